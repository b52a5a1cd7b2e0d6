//! The reference simulator: a 6502 interpreter over flat memory.
//!
//! This is the semantic oracle for the end-to-end tests: compiled
//! programs run here and their memory effects are checked. It decodes
//! through the assembler's own tables, so an encoding bug cannot hide
//! behind a matching decoding bug in a third table.
//!
//! Only the subset the compiler and the rule sets can emit is
//! implemented; hitting anything else stops the run with an error
//! instead of guessing.

use bitflags::bitflags;

use crate::addressing::AddressingMode;
use crate::asm::decode;
use crate::opcode::Opcode;
use crate::options::CpuFeature;

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct Status: u8 {
        const CARRY = 0x01;
        const ZERO = 0x02;
        const INTERRUPT_DISABLE = 0x04;
        const DECIMAL = 0x08;
        const BREAK = 0x10;
        const UNUSED = 0x20;
        const OVERFLOW = 0x40;
        const NEGATIVE = 0x80;
    }
}

const STACK: u16 = 0x0100;
/// The fake return address `run_subroutine` plants; reaching it ends the
/// run.
const SENTINEL: u16 = 0xffff;

pub struct Simulator {
    memory: Box<[u8; 0x10000]>,
    pub a: u8,
    pub x: u8,
    pub y: u8,
    pub stack_pointer: u8,
    pub status: Status,
    pub program_counter: u16,
    features: CpuFeature,
}

enum Operand {
    None,
    Immediate(u8),
    Address(u16),
}

impl Simulator {
    pub fn new(features: CpuFeature) -> Simulator {
        Simulator {
            memory: Box::new([0; 0x10000]),
            a: 0,
            x: 0,
            y: 0,
            stack_pointer: 0xfd,
            status: Status::empty(),
            program_counter: 0,
            features,
        }
    }

    pub fn load(&mut self, origin: u16, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.memory[usize::from(origin) + offset] = *byte;
        }
    }

    pub fn read(&self, address: u16) -> u8 {
        self.memory[usize::from(address)]
    }

    pub fn write(&mut self, address: u16, byte: u8) {
        self.memory[usize::from(address)] = byte;
    }

    fn read_word(&self, address: u16) -> u16 {
        u16::from(self.read(address)) | u16::from(self.read(address.wrapping_add(1))) << 8
    }

    fn read_word_zp(&self, address: u8) -> u16 {
        u16::from(self.read(u16::from(address)))
            | u16::from(self.read(u16::from(address.wrapping_add(1)))) << 8
    }

    fn fetch(&mut self) -> u8 {
        let byte = self.read(self.program_counter);
        self.program_counter = self.program_counter.wrapping_add(1);
        byte
    }

    fn fetch_word(&mut self) -> u16 {
        let lower = self.fetch();
        let higher = self.fetch();
        u16::from(lower) | u16::from(higher) << 8
    }

    fn push(&mut self, byte: u8) {
        self.write(STACK + u16::from(self.stack_pointer), byte);
        self.stack_pointer = self.stack_pointer.wrapping_sub(1);
    }

    fn pull(&mut self) -> u8 {
        self.stack_pointer = self.stack_pointer.wrapping_add(1);
        self.read(STACK + u16::from(self.stack_pointer))
    }

    fn set_nz(&mut self, value: u8) {
        self.status.set(Status::ZERO, value == 0);
        self.status.set(Status::NEGATIVE, value & 0x80 != 0);
    }

    fn fetch_operand(&mut self, mode: AddressingMode) -> Result<Operand, String> {
        use AddressingMode::*;
        Ok(match mode {
            Implied => Operand::None,
            Immediate | Relative => Operand::Immediate(self.fetch()),
            ZeroPage => Operand::Address(u16::from(self.fetch())),
            ZeroPageX => Operand::Address(u16::from(self.fetch().wrapping_add(self.x))),
            ZeroPageY => Operand::Address(u16::from(self.fetch().wrapping_add(self.y))),
            Absolute => Operand::Address(self.fetch_word()),
            AbsoluteX => Operand::Address(self.fetch_word().wrapping_add(u16::from(self.x))),
            AbsoluteY => Operand::Address(self.fetch_word().wrapping_add(u16::from(self.y))),
            Indirect => {
                let pointer = self.fetch_word();
                Operand::Address(self.read_word(pointer))
            }
            IndexedX => {
                let pointer = self.fetch().wrapping_add(self.x);
                Operand::Address(self.read_word_zp(pointer))
            }
            IndexedY => {
                let pointer = self.fetch();
                Operand::Address(
                    self.read_word_zp(pointer).wrapping_add(u16::from(self.y)),
                )
            }
            IndexedZ => {
                let pointer = self.fetch();
                Operand::Address(self.read_word_zp(pointer))
            }
            WordImmediate => Operand::Address(self.fetch_word()),
            other => return Err(format!("unsupported addressing mode {:?}", other)),
        })
    }

    fn operand_value(&self, operand: &Operand) -> Result<u8, String> {
        match operand {
            Operand::Immediate(value) => Ok(*value),
            Operand::Address(address) => Ok(self.read(*address)),
            Operand::None => Err("missing operand".to_string()),
        }
    }

    fn operand_address(&self, operand: &Operand) -> Result<u16, String> {
        match operand {
            Operand::Address(address) => Ok(*address),
            _ => Err("operand is not an address".to_string()),
        }
    }

    fn adc(&mut self, value: u8) {
        let carry_in = u8::from(self.status.contains(Status::CARRY));
        if self.status.contains(Status::DECIMAL)
            && self.features.contains(CpuFeature::DECIMAL_MODE)
        {
            let mut lo = (self.a & 0x0f) + (value & 0x0f) + carry_in;
            let mut hi = (self.a >> 4) + (value >> 4);
            if lo > 9 {
                lo += 6;
                hi += 1;
            }
            let carry_out = hi > 9;
            if carry_out {
                hi += 6;
            }
            let result = (hi << 4) | (lo & 0x0f);
            // V after a decimal add mirrors the binary computation.
            let binary = u16::from(self.a) + u16::from(value) + u16::from(carry_in);
            self.status.set(
                Status::OVERFLOW,
                ((self.a ^ binary as u8) & (value ^ binary as u8)) & 0x80 != 0,
            );
            self.a = result;
            self.status.set(Status::CARRY, carry_out);
            self.set_nz(result);
        } else {
            let full = u16::from(self.a) + u16::from(value) + u16::from(carry_in);
            let result = (full & 0xff) as u8;
            self.status.set(
                Status::OVERFLOW,
                ((self.a ^ result) & (value ^ result)) & 0x80 != 0,
            );
            self.status.set(Status::CARRY, full > 0xff);
            self.a = result;
            self.set_nz(result);
        }
    }

    fn sbc(&mut self, value: u8) {
        if self.status.contains(Status::DECIMAL)
            && self.features.contains(CpuFeature::DECIMAL_MODE)
        {
            let borrow = u8::from(!self.status.contains(Status::CARRY));
            let a = i16::from(self.a);
            let v = i16::from(value);
            let mut lo = (a & 0x0f) - (v & 0x0f) - i16::from(borrow);
            let mut hi = (a >> 4) - (v >> 4);
            if lo < 0 {
                lo += 10;
                hi -= 1;
            }
            let no_borrow = hi >= 0;
            if hi < 0 {
                hi += 10;
            }
            let result = ((hi as u8) << 4) | (lo as u8 & 0x0f);
            self.a = result;
            self.status.set(Status::CARRY, no_borrow);
            self.set_nz(result);
        } else {
            self.adc(!value);
        }
    }

    fn compare(&mut self, register: u8, value: u8) {
        let result = register.wrapping_sub(value);
        self.status.set(Status::CARRY, register >= value);
        self.set_nz(result);
    }

    fn branch(&mut self, condition: bool, offset: u8) {
        if condition {
            self.program_counter = self.program_counter.wrapping_add((offset as i8) as u16);
        }
    }

    fn shift_value(&mut self, opcode: Opcode, value: u8) -> u8 {
        let carry_in = u8::from(self.status.contains(Status::CARRY));
        let (result, carry_out) = match opcode {
            Opcode::ASL => (value << 1, value & 0x80 != 0),
            Opcode::LSR => (value >> 1, value & 1 != 0),
            Opcode::ROL => (value << 1 | carry_in, value & 0x80 != 0),
            Opcode::ROR => (value >> 1 | carry_in << 7, value & 1 != 0),
            _ => unreachable!(),
        };
        self.status.set(Status::CARRY, carry_out);
        self.set_nz(result);
        result
    }

    /// Executes one instruction.
    pub fn step(&mut self) -> Result<(), String> {
        use Opcode::*;
        let byte = self.fetch();
        let (opcode, mode) = decode(byte, self.features)
            .ok_or_else(|| format!("cannot decode byte ${:02X}", byte))?;
        let operand = self.fetch_operand(mode)?;

        match opcode {
            LDA | LAX => {
                let value = self.operand_value(&operand)?;
                self.a = value;
                if opcode == LAX {
                    self.x = value;
                }
                self.set_nz(value);
            }
            LDX => {
                self.x = self.operand_value(&operand)?;
                self.set_nz(self.x);
            }
            LDY => {
                self.y = self.operand_value(&operand)?;
                self.set_nz(self.y);
            }
            STA => {
                let address = self.operand_address(&operand)?;
                self.write(address, self.a);
            }
            STX => {
                let address = self.operand_address(&operand)?;
                self.write(address, self.x);
            }
            STY => {
                let address = self.operand_address(&operand)?;
                self.write(address, self.y);
            }
            STZ => {
                let address = self.operand_address(&operand)?;
                self.write(address, 0);
            }
            SAX => {
                let address = self.operand_address(&operand)?;
                self.write(address, self.a & self.x);
            }

            TAX => {
                self.x = self.a;
                self.set_nz(self.x);
            }
            TAY => {
                self.y = self.a;
                self.set_nz(self.y);
            }
            TXA => {
                self.a = self.x;
                self.set_nz(self.a);
            }
            TYA => {
                self.a = self.y;
                self.set_nz(self.a);
            }
            TSX => {
                self.x = self.stack_pointer;
                self.set_nz(self.x);
            }
            TXS => self.stack_pointer = self.x,
            TXY => {
                self.y = self.x;
                self.set_nz(self.y);
            }
            TYX => {
                self.x = self.y;
                self.set_nz(self.x);
            }

            AND => {
                self.a &= self.operand_value(&operand)?;
                self.set_nz(self.a);
            }
            ORA => {
                self.a |= self.operand_value(&operand)?;
                self.set_nz(self.a);
            }
            EOR => {
                self.a ^= self.operand_value(&operand)?;
                self.set_nz(self.a);
            }
            BIT => {
                let value = self.operand_value(&operand)?;
                self.status.set(Status::ZERO, self.a & value == 0);
                self.status.set(Status::OVERFLOW, value & 0x40 != 0);
                self.status.set(Status::NEGATIVE, value & 0x80 != 0);
            }
            ALR => {
                let value = self.operand_value(&operand)?;
                let masked = self.a & value;
                self.status.set(Status::CARRY, masked & 1 != 0);
                self.a = masked >> 1;
                self.set_nz(self.a);
            }
            ANC => {
                self.a &= self.operand_value(&operand)?;
                self.set_nz(self.a);
                self.status.set(Status::CARRY, self.a & 0x80 != 0);
            }
            SBX => {
                let value = self.operand_value(&operand)?;
                let base = self.a & self.x;
                self.status.set(Status::CARRY, base >= value);
                self.x = base.wrapping_sub(value);
                self.set_nz(self.x);
            }

            ADC => {
                let value = self.operand_value(&operand)?;
                self.adc(value);
            }
            SBC => {
                let value = self.operand_value(&operand)?;
                self.sbc(value);
            }
            CMP => {
                let value = self.operand_value(&operand)?;
                self.compare(self.a, value);
            }
            CPX => {
                let value = self.operand_value(&operand)?;
                self.compare(self.x, value);
            }
            CPY => {
                let value = self.operand_value(&operand)?;
                self.compare(self.y, value);
            }

            INC | DEC => {
                let address = self.operand_address(&operand)?;
                let delta = if opcode == INC { 1u8 } else { 0xff };
                let value = self.read(address).wrapping_add(delta);
                self.write(address, value);
                self.set_nz(value);
            }
            INX => {
                self.x = self.x.wrapping_add(1);
                self.set_nz(self.x);
            }
            DEX => {
                self.x = self.x.wrapping_sub(1);
                self.set_nz(self.x);
            }
            INY => {
                self.y = self.y.wrapping_add(1);
                self.set_nz(self.y);
            }
            DEY => {
                self.y = self.y.wrapping_sub(1);
                self.set_nz(self.y);
            }
            INA => {
                self.a = self.a.wrapping_add(1);
                self.set_nz(self.a);
            }
            DEA => {
                self.a = self.a.wrapping_sub(1);
                self.set_nz(self.a);
            }
            INW | DEW => {
                let address = self.operand_address(&operand)?;
                let word = self.read_word(address);
                let word = if opcode == INW {
                    word.wrapping_add(1)
                } else {
                    word.wrapping_sub(1)
                };
                self.write(address, (word & 0xff) as u8);
                self.write(address.wrapping_add(1), (word >> 8) as u8);
                self.status.set(Status::ZERO, word == 0);
                self.status.set(Status::NEGATIVE, word & 0x8000 != 0);
            }
            NEG => {
                self.a = self.a.wrapping_neg();
                self.set_nz(self.a);
            }

            ASL | LSR | ROL | ROR => match operand {
                Operand::None => {
                    let result = self.shift_value(opcode, self.a);
                    self.a = result;
                }
                _ => {
                    let address = self.operand_address(&operand)?;
                    let value = self.read(address);
                    let result = self.shift_value(opcode, value);
                    self.write(address, result);
                }
            },
            TRB => {
                let address = self.operand_address(&operand)?;
                let value = self.read(address);
                self.status.set(Status::ZERO, self.a & value == 0);
                self.write(address, value & !self.a);
            }
            TSB => {
                let address = self.operand_address(&operand)?;
                let value = self.read(address);
                self.status.set(Status::ZERO, self.a & value == 0);
                self.write(address, value | self.a);
            }

            JMP => self.program_counter = self.operand_address(&operand)?,
            JSR => {
                let target = self.operand_address(&operand)?;
                let return_point = self.program_counter.wrapping_sub(1);
                self.push((return_point >> 8) as u8);
                self.push((return_point & 0xff) as u8);
                self.program_counter = target;
            }
            RTS => {
                let lower = self.pull();
                let higher = self.pull();
                self.program_counter =
                    (u16::from(lower) | u16::from(higher) << 8).wrapping_add(1);
            }
            RTI => {
                let status = self.pull();
                self.status = Status::from_bits_truncate(status);
                let lower = self.pull();
                let higher = self.pull();
                self.program_counter = u16::from(lower) | u16::from(higher) << 8;
            }

            BCC | BCS | BEQ | BNE | BMI | BPL | BVC | BVS | BRA => {
                let Operand::Immediate(offset) = operand else {
                    return Err("branch without displacement".to_string());
                };
                let taken = match opcode {
                    BCC => !self.status.contains(Status::CARRY),
                    BCS => self.status.contains(Status::CARRY),
                    BEQ => self.status.contains(Status::ZERO),
                    BNE => !self.status.contains(Status::ZERO),
                    BMI => self.status.contains(Status::NEGATIVE),
                    BPL => !self.status.contains(Status::NEGATIVE),
                    BVC => !self.status.contains(Status::OVERFLOW),
                    BVS => self.status.contains(Status::OVERFLOW),
                    _ => true,
                };
                self.branch(taken, offset);
            }

            CLC => self.status.remove(Status::CARRY),
            SEC => self.status.insert(Status::CARRY),
            CLD => self.status.remove(Status::DECIMAL),
            SED => self.status.insert(Status::DECIMAL),
            CLI => self.status.remove(Status::INTERRUPT_DISABLE),
            SEI => self.status.insert(Status::INTERRUPT_DISABLE),
            CLV => self.status.remove(Status::OVERFLOW),

            PHA => self.push(self.a),
            PLA => {
                self.a = self.pull();
                self.set_nz(self.a);
            }
            PHX => self.push(self.x),
            PLX => {
                self.x = self.pull();
                self.set_nz(self.x);
            }
            PHY => self.push(self.y),
            PLY => {
                self.y = self.pull();
                self.set_nz(self.y);
            }
            PHP => {
                let status = self.status | Status::BREAK | Status::UNUSED;
                self.push(status.bits());
            }
            PLP => {
                let status = self.pull();
                self.status = Status::from_bits_truncate(status);
            }

            CLA => self.a = 0,
            CLX => self.x = 0,
            CLY => self.y = 0,

            NOP => {}
            BRK => return Err("hit BRK".to_string()),
            other => return Err(format!("unimplemented opcode {}", other)),
        }
        Ok(())
    }

    /// Calls `entry` as a subroutine and runs until it returns (or the
    /// step budget runs out).
    pub fn run_subroutine(&mut self, entry: u16, max_steps: u32) -> Result<(), String> {
        let fake_return = SENTINEL.wrapping_sub(1);
        self.push((fake_return >> 8) as u8);
        self.push((fake_return & 0xff) as u8);
        self.program_counter = entry;
        for _ in 0..max_steps {
            if self.program_counter == SENTINEL {
                return Ok(());
            }
            self.step()?;
        }
        Err(format!(
            "run did not finish within {} steps (pc=${:04X})",
            max_steps, self.program_counter
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::options::CpuFamily;

    use super::*;

    fn simulator() -> Simulator {
        Simulator::new(CpuFamily::Nmos6502.base_features())
    }

    #[test]
    fn a_store_lands_in_memory() {
        let mut sim = simulator();
        // LDA #$2A / STA $C000 / RTS
        sim.load(0x0200, &[0xA9, 0x2A, 0x8D, 0x00, 0xC0, 0x60]);
        sim.run_subroutine(0x0200, 100).unwrap();
        assert_eq!(sim.read(0xc000), 0x2a);
    }

    #[test]
    fn decimal_addition_carries_in_tens() {
        let mut sim = simulator();
        // SED / CLC / LDA #$19 / ADC #$03 / CLD / RTS
        sim.load(0x0200, &[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x03, 0xD8, 0x60]);
        sim.run_subroutine(0x0200, 100).unwrap();
        assert_eq!(sim.a, 0x22);
    }

    #[test]
    fn decimal_mode_is_inert_on_ricoh() {
        let mut sim = Simulator::new(CpuFamily::Ricoh.base_features());
        sim.load(0x0200, &[0xF8, 0x18, 0xA9, 0x19, 0x69, 0x03, 0xD8, 0x60]);
        sim.run_subroutine(0x0200, 100).unwrap();
        assert_eq!(sim.a, 0x1c);
    }

    #[test]
    fn nested_subroutines_return_in_order() {
        let mut sim = simulator();
        // main: JSR helper / STA $C000 / RTS  +  helper: LDA #7 / RTS
        sim.load(
            0x0200,
            &[0x20, 0x07, 0x02, 0x8D, 0x00, 0xC0, 0x60, 0xA9, 0x07, 0x60],
        );
        sim.run_subroutine(0x0200, 100).unwrap();
        assert_eq!(sim.read(0xc000), 7);
    }

    #[test]
    fn undecodable_bytes_stop_the_run() {
        let mut sim = simulator();
        sim.load(0x0200, &[0x02]);
        assert!(sim.run_subroutine(0x0200, 10).is_err());
    }
}
