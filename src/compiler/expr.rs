//! Expression lowering.
//!
//! Every byte expression ends up in A; word expressions in A (low) and X
//! (high). Y is an index register only and is never live across a nested
//! expression compilation. Operands that need stashing go to the
//! zero-page pseudoregister, falling back to the hardware stack when the
//! block runs out.

use crate::addressing::AddressingMode;
use crate::assembly::AssemblyLine;
use crate::ast::{BinOp, Expr, ParamConvention};
use crate::constant::{Constant, ConstantOp};
use crate::env::{ThingKind, Type};
use crate::opcode::Opcode;
use crate::options::RuntimeRoutine;

use super::{qualified, FunctionCompiler, VarAccess};

fn constant_op(op: BinOp) -> ConstantOp {
    match op {
        BinOp::Add => ConstantOp::Plus,
        BinOp::Sub => ConstantOp::Minus,
        BinOp::Mul => ConstantOp::Times,
        BinOp::And => ConstantOp::And,
        BinOp::Or => ConstantOp::Or,
        BinOp::Xor => ConstantOp::Exor,
        BinOp::Shl => ConstantOp::Shl,
        BinOp::Shr => ConstantOp::Shr,
        BinOp::DecimalAdd => ConstantOp::DecimalPlus,
        BinOp::DecimalSub => ConstantOp::DecimalMinus,
        BinOp::DecimalMul => ConstantOp::DecimalTimes,
        BinOp::DecimalShl => ConstantOp::DecimalShl,
        BinOp::DecimalShr => ConstantOp::DecimalShr,
    }
}

fn commutative(op: BinOp) -> bool {
    matches!(
        op,
        BinOp::Add | BinOp::And | BinOp::Or | BinOp::Xor | BinOp::DecimalAdd
    )
}

impl<'a> FunctionCompiler<'a> {
    /// Fully constant expressions fold away before any code is chosen.
    pub(crate) fn const_eval(&self, expr: &Expr) -> Option<i64> {
        match expr {
            Expr::Number(value) => Some(*value),
            Expr::Variable(name) => match self.resolve(name) {
                VarAccess::Alias(constant) => constant.eval(),
                _ => None,
            },
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.const_eval(lhs)?;
                let rhs = self.const_eval(rhs)?;
                Constant::Compound(
                    constant_op(*op),
                    Box::new(Constant::num(lhs)),
                    Box::new(Constant::num(rhs)),
                )
                .eval()
            }
            Expr::Join(hi, lo) => {
                Some(((self.const_eval(hi)? & 0xff) << 8) | (self.const_eval(lo)? & 0xff))
            }
            _ => None,
        }
    }

    /// An operand usable directly in an accumulator instruction, if the
    /// expression has one: an immediate, a variable, or a
    /// constant-indexed array element.
    pub(crate) fn simple_rhs(&self, expr: &Expr) -> Option<(AddressingMode, Constant)> {
        if let Some(value) = self.const_eval(expr) {
            return Some((AddressingMode::Immediate, Constant::num(value & 0xff)));
        }
        match expr {
            Expr::Variable(name) => match self.resolve(name) {
                VarAccess::Direct(mode, operand) => Some((mode, operand)),
                _ => None,
            },
            Expr::Indexed { array, index } => {
                let offset = self.const_eval(index)?;
                match self.resolve(array) {
                    VarAccess::Direct(mode, operand) => Some((mode, operand + offset)),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    pub(crate) fn compile_expr_to_a(&mut self, expr: &Expr) {
        if let Some(value) = self.const_eval(expr) {
            self.emit(AssemblyLine::immediate(Opcode::LDA, value & 0xff));
            return;
        }
        match expr {
            Expr::Number(value) => {
                self.emit(AssemblyLine::immediate(Opcode::LDA, value & 0xff));
            }
            Expr::Variable(name) => {
                let access = self.resolve(name);
                self.load_a(access, name);
            }
            Expr::Indexed { array, index } => self.compile_indexed_load(array, index),
            Expr::Call(name, args) => self.compile_call(name, args),
            Expr::Binary(op, lhs, rhs) => self.compile_binary(*op, lhs, rhs),
            // The low byte of a word join is just the join's A half.
            Expr::Join(_, _) => self.compile_expr_to_ax(expr),
        }
    }

    fn load_a(&mut self, access: VarAccess, name: &str) {
        match access {
            VarAccess::Direct(mode, operand) => {
                self.emit(AssemblyLine::new(Opcode::LDA, mode, operand));
            }
            VarAccess::Pointer(operand) => {
                self.emit(AssemblyLine::new(Opcode::LDA, AddressingMode::ZeroPage, operand));
            }
            VarAccess::Stack(offset) => {
                let displacement = self.stack_displacement(offset);
                self.emit_implied(Opcode::TSX);
                self.emit(AssemblyLine::absolute_x(Opcode::LDA, Constant::num(displacement)));
            }
            VarAccess::Alias(constant) => {
                let operand = if constant.fits_into_byte() {
                    constant
                } else {
                    constant.lo_byte()
                };
                self.emit(AssemblyLine::immediate(Opcode::LDA, operand));
            }
            VarAccess::Unknown => {
                self.codegen_error(format!("unknown variable `{}`", name));
                self.emit(AssemblyLine::immediate(Opcode::LDA, 0));
            }
        }
    }

    fn compile_indexed_load(&mut self, array: &str, index: &Expr) {
        if let Some(offset) = self.const_eval(index) {
            match self.resolve(array) {
                VarAccess::Direct(mode, operand) => {
                    self.check_constant_index(array, offset);
                    self.emit(AssemblyLine::new(Opcode::LDA, mode, operand + offset));
                    return;
                }
                VarAccess::Pointer(pointer) => {
                    self.emit(AssemblyLine::immediate(Opcode::LDY, offset & 0xff));
                    self.emit(AssemblyLine::indexed_y(Opcode::LDA, pointer));
                    return;
                }
                _ => {}
            }
        }
        self.compile_index_to_y(index);
        self.emit_bounds_check(array);
        match self.resolve(array) {
            VarAccess::Direct(_, operand) => {
                self.emit(AssemblyLine::absolute_y(Opcode::LDA, operand));
            }
            VarAccess::Pointer(pointer) => {
                self.emit(AssemblyLine::indexed_y(Opcode::LDA, pointer));
            }
            _ => {
                self.codegen_error(format!("unknown array `{}`", array));
                self.emit(AssemblyLine::immediate(Opcode::LDA, 0));
            }
        }
    }

    pub(crate) fn check_constant_index(&self, array: &str, offset: i64) {
        if self.ctx.never_check_array_bounds {
            return;
        }
        if let Some(length) = self.ctx.env.array_length(array) {
            if offset < 0 || offset >= i64::from(length) {
                self.codegen_error(format!(
                    "index {} out of bounds for array `{}`",
                    offset, array
                ));
            }
        }
    }

    pub(crate) fn compile_index_to_y(&mut self, index: &Expr) {
        if let Some(value) = self.const_eval(index) {
            self.emit(AssemblyLine::immediate(Opcode::LDY, value & 0xff));
            return;
        }
        if let Expr::Variable(name) = index {
            if let VarAccess::Direct(mode, operand) = self.resolve(name) {
                self.emit(AssemblyLine::new(Opcode::LDY, mode, operand));
                return;
            }
        }
        self.compile_expr_to_a(index);
        self.emit_implied(Opcode::TAY);
    }

    /// Runtime index check against the array's declared length. A byte
    /// index cannot escape a full 256-entry array, so those are free.
    pub(crate) fn emit_bounds_check(&mut self, array: &str) {
        if self.ctx.never_check_array_bounds {
            return;
        }
        let Some(length) = self.ctx.env.array_length(array) else {
            return;
        };
        if length > 0xff {
            return;
        }
        let ok = self.ctx.job.labels.next("bc");
        self.emit(AssemblyLine::immediate(Opcode::CPY, i64::from(length)));
        self.emit(AssemblyLine::relative(Opcode::BCC, ok.clone()));
        self.emit(AssemblyLine::absolute(Opcode::JMP, Constant::addr("__bounds_fail")).pinned());
        self.emit(AssemblyLine::label(ok));
        self.ctx.job.require_runtime(RuntimeRoutine::BoundsFail);
    }

    fn compile_binary(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        match op {
            BinOp::Mul => return self.compile_multiply(lhs, rhs),
            BinOp::DecimalMul => {
                // Folded above when constant; there is no general BCD
                // multiply in the runtime.
                self.codegen_error("decimal multiplication requires constant operands");
                return;
            }
            BinOp::Shl | BinOp::Shr | BinOp::DecimalShl | BinOp::DecimalShr => {
                return self.compile_shift(op, lhs, rhs);
            }
            _ => {}
        }

        if let Some((mode, operand)) = self.simple_rhs(rhs) {
            self.compile_expr_to_a(lhs);
            self.apply_simple_binop(op, mode, operand);
        } else if commutative(op) && self.simple_rhs(lhs).is_some() {
            let (mode, operand) = self.simple_rhs(lhs).unwrap();
            self.compile_expr_to_a(rhs);
            self.apply_simple_binop(op, mode, operand);
        } else {
            self.compile_expr_to_a(rhs);
            if let Some(stash) = self.alloc_stash() {
                self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
                self.compile_expr_to_a(lhs);
                self.apply_simple_binop(op, AddressingMode::ZeroPage, stash);
                self.free_stash();
            } else {
                // Out of pseudoregister bytes; spill through the stack.
                self.emit_implied(Opcode::PHA);
                self.ctx.extra_stack_offset += 1;
                self.compile_expr_to_a(lhs);
                self.emit_implied(Opcode::TSX);
                self.apply_simple_binop(op, AddressingMode::AbsoluteX, Constant::num(0x0101));
                self.ctx.extra_stack_offset -= 1;
                self.emit_implied(Opcode::TAX);
                self.emit_implied(Opcode::PLA);
                self.emit_implied(Opcode::TXA);
            }
        }
    }

    fn apply_simple_binop(&mut self, op: BinOp, mode: AddressingMode, operand: Constant) {
        match op {
            BinOp::Add => {
                self.emit_implied(Opcode::CLC);
                self.emit(AssemblyLine::new(Opcode::ADC, mode, operand));
            }
            BinOp::Sub => {
                self.emit_implied(Opcode::SEC);
                self.emit(AssemblyLine::new(Opcode::SBC, mode, operand));
            }
            BinOp::And => self.emit(AssemblyLine::new(Opcode::AND, mode, operand)),
            BinOp::Or => self.emit(AssemblyLine::new(Opcode::ORA, mode, operand)),
            BinOp::Xor => self.emit(AssemblyLine::new(Opcode::EOR, mode, operand)),
            BinOp::DecimalAdd => {
                self.emit_implied(Opcode::SED);
                self.emit_implied(Opcode::CLC);
                self.emit(AssemblyLine::new(Opcode::ADC, mode, operand));
                self.emit_implied(Opcode::CLD);
            }
            BinOp::DecimalSub => {
                self.emit_implied(Opcode::SED);
                self.emit_implied(Opcode::SEC);
                self.emit(AssemblyLine::new(Opcode::SBC, mode, operand));
                self.emit_implied(Opcode::CLD);
            }
            BinOp::Mul
            | BinOp::DecimalMul
            | BinOp::Shl
            | BinOp::Shr
            | BinOp::DecimalShl
            | BinOp::DecimalShr => unreachable!("handled before operand selection"),
        }
    }

    fn compile_shift(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr) {
        let Some(amount) = self.const_eval(rhs) else {
            self.codegen_error("shift amounts must be compile-time constants");
            return;
        };
        let amount = amount.clamp(0, 8) as u8;
        self.compile_expr_to_a(lhs);
        match op {
            BinOp::Shl => {
                for _ in 0..amount {
                    self.emit_implied(Opcode::ASL);
                }
            }
            BinOp::Shr => {
                for _ in 0..amount {
                    self.emit_implied(Opcode::LSR);
                }
            }
            BinOp::DecimalShl => {
                let Some(stash) = self.alloc_stash() else {
                    self.codegen_error("expression too deep for the pseudoregister block");
                    return;
                };
                self.emit_implied(Opcode::SED);
                for _ in 0..amount {
                    self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
                    self.emit_implied(Opcode::CLC);
                    self.emit(AssemblyLine::zero_page(Opcode::ADC, stash.clone()));
                }
                self.emit_implied(Opcode::CLD);
                self.free_stash();
            }
            BinOp::DecimalShr => {
                self.codegen_error("decimal right shift requires constant operands");
            }
            _ => unreachable!(),
        }
    }

    fn compile_multiply(&mut self, lhs: &Expr, rhs: &Expr) {
        let (value_expr, multiplier) = if let Some(k) = self.const_eval(rhs) {
            (lhs, Some(k))
        } else if let Some(k) = self.const_eval(lhs) {
            (rhs, Some(k))
        } else {
            (lhs, None)
        };

        if let Some(multiplier) = multiplier {
            let multiplier = (multiplier & 0xff) as u8;
            match multiplier {
                0 => self.emit(AssemblyLine::immediate(Opcode::LDA, 0)),
                1 => self.compile_expr_to_a(value_expr),
                k if k.is_power_of_two() => {
                    self.compile_expr_to_a(value_expr);
                    for _ in 0..k.trailing_zeros() {
                        self.emit_implied(Opcode::ASL);
                    }
                }
                k => {
                    // Shift-and-add from the bit below the leading one.
                    let Some(stash) = self.alloc_stash() else {
                        self.codegen_error("expression too deep for the pseudoregister block");
                        return;
                    };
                    self.compile_expr_to_a(value_expr);
                    self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
                    let highest = 7 - k.leading_zeros();
                    for bit in (0..highest).rev() {
                        self.emit_implied(Opcode::ASL);
                        if k & (1 << bit) != 0 {
                            self.emit_implied(Opcode::CLC);
                            self.emit(AssemblyLine::zero_page(Opcode::ADC, stash.clone()));
                        }
                    }
                    self.free_stash();
                }
            }
            return;
        }

        // Variable times variable goes through the runtime routine:
        // multiplicand in A, multiplier in the first pseudoregister byte.
        let multiplier_slot = self.ctx.env.zp_register(0);
        if let Some((mode, operand)) = self.simple_rhs(lhs) {
            self.compile_expr_to_a(rhs);
            self.emit(AssemblyLine::zero_page(Opcode::STA, multiplier_slot));
            self.emit(AssemblyLine::new(Opcode::LDA, mode, operand));
        } else {
            let Some(stash) = self.alloc_stash() else {
                self.codegen_error("expression too deep for the pseudoregister block");
                return;
            };
            self.compile_expr_to_a(lhs);
            self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
            self.compile_expr_to_a(rhs);
            self.emit(AssemblyLine::zero_page(Opcode::STA, multiplier_slot));
            self.emit(AssemblyLine::zero_page(Opcode::LDA, stash));
            self.free_stash();
        }
        self.emit(AssemblyLine::absolute(Opcode::JSR, Constant::addr("__mul_u8")));
        self.ctx.job.require_runtime(RuntimeRoutine::MulU8);
    }

    pub(crate) fn compile_call(&mut self, name: &str, args: &[Expr]) {
        let (params, convention) = match self.ctx.env.get(name).map(|thing| &thing.kind) {
            Some(ThingKind::Function {
                params, convention, ..
            }) => (params.clone(), *convention),
            _ => {
                self.codegen_error(format!("call to unknown function `{}`", name));
                return;
            }
        };
        if args.len() != params.len() {
            self.codegen_error(format!(
                "`{}` takes {} argument(s), got {}",
                name,
                params.len(),
                args.len()
            ));
            return;
        }

        let register_first = convention != ParamConvention::ByVariable;
        for (index, (param, arg)) in params.iter().zip(args).enumerate() {
            if register_first && index == 0 {
                continue;
            }
            self.compile_expr_to_a(arg);
            let target = qualified(name, param);
            match self.direct_access(&target) {
                VarAccess::Direct(mode, operand) => {
                    self.emit(AssemblyLine::new(Opcode::STA, mode, operand));
                }
                _ => self.codegen_error(format!("parameter `{}` has no storage", target)),
            }
        }
        if register_first {
            if let Some(first) = args.first() {
                self.compile_expr_to_a(first);
                match convention {
                    ParamConvention::ByX => self.emit_implied(Opcode::TAX),
                    ParamConvention::ByY => self.emit_implied(Opcode::TAY),
                    _ => {}
                }
            }
        }
        self.emit(AssemblyLine::absolute(Opcode::JSR, Constant::addr(name)));
    }

    /// Word-sized results: A holds the low byte, X the high byte.
    pub(crate) fn compile_expr_to_ax(&mut self, expr: &Expr) {
        if let Some(value) = self.const_eval(expr) {
            self.emit(AssemblyLine::immediate(Opcode::LDA, value & 0xff));
            self.emit(AssemblyLine::immediate(Opcode::LDX, (value >> 8) & 0xff));
            return;
        }
        match expr {
            Expr::Variable(name) if self.var_type(name) != Type::Byte => {
                match self.resolve(name) {
                    VarAccess::Direct(mode, operand) => {
                        self.emit(AssemblyLine::new(Opcode::LDA, mode, operand.clone()));
                        self.emit(AssemblyLine::new(Opcode::LDX, mode, operand + 1));
                    }
                    VarAccess::Pointer(operand) => {
                        self.emit(AssemblyLine::new(
                            Opcode::LDA,
                            AddressingMode::ZeroPage,
                            operand.clone(),
                        ));
                        self.emit(AssemblyLine::new(
                            Opcode::LDX,
                            AddressingMode::ZeroPage,
                            operand + 1,
                        ));
                    }
                    VarAccess::Stack(offset) => {
                        let Some(stash) = self.alloc_stash() else {
                            self.codegen_error("expression too deep for the pseudoregister block");
                            return;
                        };
                        let lo = self.stack_displacement(offset);
                        let hi = self.stack_displacement(offset + 1);
                        self.emit_implied(Opcode::TSX);
                        self.emit(AssemblyLine::absolute_x(Opcode::LDA, Constant::num(hi)));
                        self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
                        self.emit(AssemblyLine::absolute_x(Opcode::LDA, Constant::num(lo)));
                        self.emit(AssemblyLine::zero_page(Opcode::LDX, stash));
                        self.free_stash();
                    }
                    VarAccess::Alias(constant) => {
                        self.emit(AssemblyLine::immediate(Opcode::LDA, constant.lo_byte()));
                        self.emit(AssemblyLine::immediate(Opcode::LDX, constant.hi_byte()));
                    }
                    VarAccess::Unknown => {
                        self.codegen_error(format!("unknown variable `{}`", name));
                    }
                }
            }
            Expr::Join(hi, lo) => {
                if let Some((mode, operand)) = self.simple_rhs(hi) {
                    self.compile_expr_to_a(lo);
                    self.emit(AssemblyLine::new(Opcode::LDX, mode, operand));
                } else {
                    let Some(stash) = self.alloc_stash() else {
                        self.codegen_error("expression too deep for the pseudoregister block");
                        return;
                    };
                    self.compile_expr_to_a(hi);
                    self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
                    self.compile_expr_to_a(lo);
                    self.emit(AssemblyLine::zero_page(Opcode::LDX, stash));
                    self.free_stash();
                }
            }
            Expr::Call(name, args) => self.compile_call(name, args),
            // Byte-sized expressions zero-extend.
            _ => {
                self.compile_expr_to_a(expr);
                self.emit(AssemblyLine::immediate(Opcode::LDX, 0));
            }
        }
    }

    /// Emits a `CMP` establishing flags for `lhs ? rhs`. Returns true if
    /// the operands were swapped, in which case the comparison operator
    /// must be mirrored.
    pub(crate) fn compile_compare(&mut self, lhs: &Expr, rhs: &Expr) -> bool {
        if let Some((mode, operand)) = self.simple_rhs(rhs) {
            self.compile_expr_to_a(lhs);
            self.emit(AssemblyLine::new(Opcode::CMP, mode, operand));
            false
        } else if let Some((mode, operand)) = self.simple_rhs(lhs) {
            self.compile_expr_to_a(rhs);
            self.emit(AssemblyLine::new(Opcode::CMP, mode, operand));
            true
        } else {
            self.compile_expr_to_a(rhs);
            match self.alloc_stash() {
                Some(stash) => {
                    self.emit(AssemblyLine::zero_page(Opcode::STA, stash.clone()));
                    self.compile_expr_to_a(lhs);
                    self.emit(AssemblyLine::zero_page(Opcode::CMP, stash));
                    self.free_stash();
                }
                None => {
                    self.codegen_error("comparison too deep for the pseudoregister block");
                }
            }
            false
        }
    }
}
