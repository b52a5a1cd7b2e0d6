//! The flat pseudo-assembly representation between the compiler and the
//! assembler.
//!
//! A function body is a `Vec<AssemblyLine>`; the optimizer consumes and
//! produces whole new vectors, never mutating lines in place. The
//! `elidable` flag is the optimizer's permission bit: user-written inline
//! assembly and entry labels are pinned and survive verbatim.

use std::fmt;

use crate::addressing::AddressingMode;
use crate::constant::Constant;
use crate::opcode::Opcode;

/// A source location, carried through for diagnostics.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AssemblyLine {
    pub opcode: Opcode,
    pub mode: AddressingMode,
    pub operand: Constant,
    pub elidable: bool,
    pub position: Option<Position>,
}

impl AssemblyLine {
    pub fn new(opcode: Opcode, mode: AddressingMode, operand: Constant) -> AssemblyLine {
        AssemblyLine {
            opcode,
            mode,
            operand,
            elidable: true,
            position: None,
        }
    }

    pub fn implied(opcode: Opcode) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::Implied, Constant::zero())
    }

    pub fn immediate(opcode: Opcode, operand: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::Immediate, operand.into())
    }

    pub fn zero_page(opcode: Opcode, operand: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::ZeroPage, operand.into())
    }

    pub fn absolute(opcode: Opcode, operand: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::Absolute, operand.into())
    }

    pub fn absolute_x(opcode: Opcode, operand: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::AbsoluteX, operand.into())
    }

    pub fn absolute_y(opcode: Opcode, operand: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::AbsoluteY, operand.into())
    }

    pub fn indexed_y(opcode: Opcode, operand: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(opcode, AddressingMode::IndexedY, operand.into())
    }

    pub fn relative(opcode: Opcode, label: impl Into<String>) -> AssemblyLine {
        AssemblyLine::new(
            opcode,
            AddressingMode::Relative,
            Constant::addr(label.into()),
        )
    }

    pub fn label(name: impl Into<String>) -> AssemblyLine {
        AssemblyLine::new(
            Opcode::LABEL,
            AddressingMode::DoesNotExist,
            Constant::addr(name.into()),
        )
    }

    pub fn byte(value: impl Into<Constant>) -> AssemblyLine {
        AssemblyLine::new(Opcode::BYTE, AddressingMode::DoesNotExist, value.into())
    }

    /// The pinned form: the optimizer must not delete or rewrite it.
    pub fn pinned(mut self) -> AssemblyLine {
        self.elidable = false;
        self
    }

    pub fn at(mut self, position: Position) -> AssemblyLine {
        self.position = Some(position);
        self
    }

    pub fn is_label(&self) -> bool {
        self.opcode == Opcode::LABEL
    }

    /// The label name, for `LABEL` lines and branch/jump operands.
    pub fn label_name(&self) -> Option<&str> {
        match &self.operand {
            Constant::MemoryAddress(name) => Some(name),
            _ => None,
        }
    }

    pub fn reads_memory(&self) -> bool {
        self.mode.accesses_memory() && !self.opcode.is_store()
    }

    pub fn changes_memory(&self) -> bool {
        self.mode.accesses_memory() && (self.opcode.is_store() || self.opcode.is_rmw())
    }

    /// Whether this line may touch the memory of the named thing.
    /// Indirect modes can reach anywhere, so they relate to everything.
    pub fn accesses_thing(&self, name: &str) -> bool {
        if !self.mode.accesses_memory() {
            return false;
        }
        match self.mode {
            AddressingMode::IndexedX
            | AddressingMode::IndexedY
            | AddressingMode::IndexedZ
            | AddressingMode::IndexedSY
            | AddressingMode::LongIndexedY
            | AddressingMode::LongIndexedZ
            | AddressingMode::Indirect => true,
            _ => self.operand.is_related_to(name),
        }
    }

    /// Size of the encoded instruction in bytes.
    pub fn byte_size(&self) -> u16 {
        match self.opcode {
            Opcode::LABEL => 0,
            Opcode::BYTE => 1,
            _ => 1 + self.mode.operand_length(),
        }
    }

    /// A rough cycle count, good enough for the optimizer's cost gate.
    /// Page-crossing penalties are deliberately ignored.
    pub fn cycles(&self) -> u32 {
        use AddressingMode::*;
        match self.opcode {
            Opcode::LABEL | Opcode::BYTE => 0,
            Opcode::JSR | Opcode::RTS | Opcode::RTI | Opcode::BRK => 6,
            Opcode::PHA | Opcode::PHP | Opcode::PHX | Opcode::PHY | Opcode::PHZ => 3,
            Opcode::PLA | Opcode::PLP | Opcode::PLX | Opcode::PLY | Opcode::PLZ => 4,
            Opcode::JMP => match self.mode {
                Indirect => 5,
                _ => 3,
            },
            opcode if opcode.is_conditional_branch() => 3,
            Opcode::BRA => 3,
            opcode if opcode.is_rmw() => match self.mode {
                ZeroPage => 5,
                ZeroPageX | Absolute => 6,
                _ => 7,
            },
            _ => match self.mode {
                Implied | Immediate => 2,
                ZeroPage => 3,
                ZeroPageX | ZeroPageY | Absolute | AbsoluteX | AbsoluteY | WordImmediate => 4,
                IndexedY | IndexedZ | Stack => 5,
                IndexedX | IndexedSY | LongAbsolute | LongAbsoluteX => 6,
                LongIndexedY | LongIndexedZ => 6,
                Indirect | Relative | DoesNotExist => 3,
            },
        }
    }
}

/// The total cost of a sequence, in the metric's unit.
pub fn sequence_bytes(lines: &[AssemblyLine]) -> u32 {
    lines.iter().map(|line| u32::from(line.byte_size())).sum()
}

pub fn sequence_cycles(lines: &[AssemblyLine]) -> u32 {
    lines.iter().map(AssemblyLine::cycles).sum()
}

impl fmt::Display for AssemblyLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use AddressingMode::*;
        match self.opcode {
            Opcode::LABEL => return write!(f, "{}:", self.operand),
            Opcode::BYTE => return write!(f, "    !byte {}", self.operand),
            _ => {}
        }
        match self.mode {
            Implied => write!(f, "    {}", self.opcode),
            Immediate => write!(f, "    {} #{}", self.opcode, self.operand),
            WordImmediate => write!(f, "    {} ##{}", self.opcode, self.operand),
            ZeroPage | Absolute | LongAbsolute | Relative | DoesNotExist => {
                write!(f, "    {} {}", self.opcode, self.operand)
            }
            ZeroPageX | AbsoluteX | LongAbsoluteX => {
                write!(f, "    {} {},X", self.opcode, self.operand)
            }
            ZeroPageY | AbsoluteY => write!(f, "    {} {},Y", self.opcode, self.operand),
            Indirect => write!(f, "    {} ({})", self.opcode, self.operand),
            IndexedX => write!(f, "    {} ({},X)", self.opcode, self.operand),
            IndexedY => write!(f, "    {} ({}),Y", self.opcode, self.operand),
            IndexedZ => write!(f, "    {} ({})", self.opcode, self.operand),
            IndexedSY => write!(f, "    {} ({},S),Y", self.opcode, self.operand),
            LongIndexedY => write!(f, "    {} [{}],Y", self.opcode, self.operand),
            LongIndexedZ => write!(f, "    {} [{}]", self.opcode, self.operand),
            Stack => write!(f, "    {} {},S", self.opcode, self.operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_take_no_space() {
        assert_eq!(AssemblyLine::label(".loop").byte_size(), 0);
        assert_eq!(AssemblyLine::byte(Constant::num(0)).byte_size(), 1);
        assert_eq!(
            AssemblyLine::immediate(Opcode::LDA, Constant::num(5)).byte_size(),
            2
        );
        assert_eq!(
            AssemblyLine::absolute(Opcode::STA, Constant::addr("output")).byte_size(),
            3
        );
    }

    #[test]
    fn pinned_lines_lose_elidability() {
        let line = AssemblyLine::implied(Opcode::RTS);
        assert!(line.elidable);
        assert!(!line.pinned().elidable);
    }

    #[test]
    fn indexed_stores_relate_to_everything() {
        let line = AssemblyLine::indexed_y(Opcode::STA, Constant::num(0x02));
        assert!(line.accesses_thing("anything"));
        let direct = AssemblyLine::absolute(Opcode::STA, Constant::addr("output"));
        assert!(direct.accesses_thing("output"));
        assert!(!direct.accesses_thing("input"));
    }

    #[test]
    fn listing_formats_read_like_an_assembler() {
        assert_eq!(
            AssemblyLine::immediate(Opcode::LDA, Constant::num(0x2a)).to_string(),
            "    LDA #$2A"
        );
        assert_eq!(
            AssemblyLine::indexed_y(Opcode::STA, Constant::num(0x02)).to_string(),
            "    STA ($02),Y"
        );
        assert_eq!(AssemblyLine::label(".done").to_string(), ".done:");
    }
}
