//! Runtime subroutines the compiler links in on demand.

use crate::assembly::AssemblyLine;
use crate::constant::Constant;
use crate::env::Environment;
use crate::opcode::Opcode;
use crate::options::RuntimeRoutine;

/// The body of a runtime routine, ready to append to the program.
pub fn runtime_function(routine: RuntimeRoutine, env: &Environment) -> Vec<AssemblyLine> {
    match routine {
        // A * __reg0 -> A (mod 256). Shift-and-add; clobbers X and the
        // second pseudoregister byte.
        RuntimeRoutine::MulU8 => {
            let multiplier = env.zp_register(0);
            let multiplicand = env.zp_register(1);
            vec![
                AssemblyLine::label("__mul_u8").pinned(),
                AssemblyLine::zero_page(Opcode::STA, multiplicand.clone()),
                AssemblyLine::immediate(Opcode::LDA, 0),
                AssemblyLine::immediate(Opcode::LDX, 8),
                AssemblyLine::label(".__mul_u8_loop"),
                AssemblyLine::zero_page(Opcode::LSR, multiplier),
                AssemblyLine::relative(Opcode::BCC, ".__mul_u8_skip"),
                AssemblyLine::implied(Opcode::CLC),
                AssemblyLine::zero_page(Opcode::ADC, multiplicand.clone()),
                AssemblyLine::label(".__mul_u8_skip"),
                AssemblyLine::zero_page(Opcode::ASL, multiplicand),
                AssemblyLine::implied(Opcode::DEX),
                AssemblyLine::relative(Opcode::BNE, ".__mul_u8_loop"),
                AssemblyLine::implied(Opcode::RTS),
            ]
        }
        // The shared trap for failed bounds checks. Halts in place; a
        // platform can hook the label instead.
        RuntimeRoutine::BoundsFail => vec![
            AssemblyLine::label("__bounds_fail").pinned(),
            AssemblyLine::absolute(Opcode::JMP, Constant::addr("__bounds_fail")).pinned(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiply_routine_ends_in_rts() {
        let env = Environment::new(0x02, 0xc000, 4, "default");
        let body = runtime_function(RuntimeRoutine::MulU8, &env);
        assert_eq!(body.first().unwrap().label_name(), Some("__mul_u8"));
        assert_eq!(body.last().unwrap().opcode, Opcode::RTS);
    }
}
