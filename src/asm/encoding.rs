//! Opcode encoding tables, one per instruction-set extension.
//!
//! Each table is written once and the macro derives both directions:
//! the assembler encodes, the reference simulator decodes. Extension
//! tables shadow the base table, so e.g. `$1A` is `INA` on a CMOS part
//! and nothing at all on NMOS (the undocumented `NOP $1A` is not
//! modelled).

use crate::addressing::AddressingMode;
use crate::opcode::Opcode;
use crate::options::CpuFeature;

macro_rules! encoding_table {
    ($encode:ident, $decode:ident; $($byte:literal => $op:ident $mode:ident),* $(,)?) => {
        pub fn $encode(opcode: Opcode, mode: AddressingMode) -> Option<u8> {
            match (opcode, mode) {
                $( (Opcode::$op, AddressingMode::$mode) => Some($byte), )*
                _ => None,
            }
        }

        pub fn $decode(byte: u8) -> Option<(Opcode, AddressingMode)> {
            match byte {
                $( $byte => Some((Opcode::$op, AddressingMode::$mode)), )*
                _ => None,
            }
        }
    };
}

encoding_table! {
    encode_nmos, decode_nmos;
    0x69 => ADC Immediate, 0x65 => ADC ZeroPage, 0x75 => ADC ZeroPageX,
    0x6D => ADC Absolute, 0x7D => ADC AbsoluteX, 0x79 => ADC AbsoluteY,
    0x61 => ADC IndexedX, 0x71 => ADC IndexedY,
    0x29 => AND Immediate, 0x25 => AND ZeroPage, 0x35 => AND ZeroPageX,
    0x2D => AND Absolute, 0x3D => AND AbsoluteX, 0x39 => AND AbsoluteY,
    0x21 => AND IndexedX, 0x31 => AND IndexedY,
    0x0A => ASL Implied, 0x06 => ASL ZeroPage, 0x16 => ASL ZeroPageX,
    0x0E => ASL Absolute, 0x1E => ASL AbsoluteX,
    0x90 => BCC Relative, 0xB0 => BCS Relative, 0xF0 => BEQ Relative,
    0x30 => BMI Relative, 0xD0 => BNE Relative, 0x10 => BPL Relative,
    0x50 => BVC Relative, 0x70 => BVS Relative,
    0x24 => BIT ZeroPage, 0x2C => BIT Absolute,
    0x00 => BRK Implied,
    0x18 => CLC Implied, 0xD8 => CLD Implied, 0x58 => CLI Implied, 0xB8 => CLV Implied,
    0xC9 => CMP Immediate, 0xC5 => CMP ZeroPage, 0xD5 => CMP ZeroPageX,
    0xCD => CMP Absolute, 0xDD => CMP AbsoluteX, 0xD9 => CMP AbsoluteY,
    0xC1 => CMP IndexedX, 0xD1 => CMP IndexedY,
    0xE0 => CPX Immediate, 0xE4 => CPX ZeroPage, 0xEC => CPX Absolute,
    0xC0 => CPY Immediate, 0xC4 => CPY ZeroPage, 0xCC => CPY Absolute,
    0xC6 => DEC ZeroPage, 0xD6 => DEC ZeroPageX, 0xCE => DEC Absolute, 0xDE => DEC AbsoluteX,
    0xCA => DEX Implied, 0x88 => DEY Implied,
    0x49 => EOR Immediate, 0x45 => EOR ZeroPage, 0x55 => EOR ZeroPageX,
    0x4D => EOR Absolute, 0x5D => EOR AbsoluteX, 0x59 => EOR AbsoluteY,
    0x41 => EOR IndexedX, 0x51 => EOR IndexedY,
    0xE6 => INC ZeroPage, 0xF6 => INC ZeroPageX, 0xEE => INC Absolute, 0xFE => INC AbsoluteX,
    0xE8 => INX Implied, 0xC8 => INY Implied,
    0x4C => JMP Absolute, 0x6C => JMP Indirect,
    0x20 => JSR Absolute,
    0xA9 => LDA Immediate, 0xA5 => LDA ZeroPage, 0xB5 => LDA ZeroPageX,
    0xAD => LDA Absolute, 0xBD => LDA AbsoluteX, 0xB9 => LDA AbsoluteY,
    0xA1 => LDA IndexedX, 0xB1 => LDA IndexedY,
    0xA2 => LDX Immediate, 0xA6 => LDX ZeroPage, 0xB6 => LDX ZeroPageY,
    0xAE => LDX Absolute, 0xBE => LDX AbsoluteY,
    0xA0 => LDY Immediate, 0xA4 => LDY ZeroPage, 0xB4 => LDY ZeroPageX,
    0xAC => LDY Absolute, 0xBC => LDY AbsoluteX,
    0x4A => LSR Implied, 0x46 => LSR ZeroPage, 0x56 => LSR ZeroPageX,
    0x4E => LSR Absolute, 0x5E => LSR AbsoluteX,
    0xEA => NOP Implied,
    0x09 => ORA Immediate, 0x05 => ORA ZeroPage, 0x15 => ORA ZeroPageX,
    0x0D => ORA Absolute, 0x1D => ORA AbsoluteX, 0x19 => ORA AbsoluteY,
    0x01 => ORA IndexedX, 0x11 => ORA IndexedY,
    0x48 => PHA Implied, 0x08 => PHP Implied, 0x68 => PLA Implied, 0x28 => PLP Implied,
    0x2A => ROL Implied, 0x26 => ROL ZeroPage, 0x36 => ROL ZeroPageX,
    0x2E => ROL Absolute, 0x3E => ROL AbsoluteX,
    0x6A => ROR Implied, 0x66 => ROR ZeroPage, 0x76 => ROR ZeroPageX,
    0x6E => ROR Absolute, 0x7E => ROR AbsoluteX,
    0x40 => RTI Implied, 0x60 => RTS Implied,
    0xE9 => SBC Immediate, 0xE5 => SBC ZeroPage, 0xF5 => SBC ZeroPageX,
    0xED => SBC Absolute, 0xFD => SBC AbsoluteX, 0xF9 => SBC AbsoluteY,
    0xE1 => SBC IndexedX, 0xF1 => SBC IndexedY,
    0x38 => SEC Implied, 0xF8 => SED Implied, 0x78 => SEI Implied,
    0x85 => STA ZeroPage, 0x95 => STA ZeroPageX, 0x8D => STA Absolute,
    0x9D => STA AbsoluteX, 0x99 => STA AbsoluteY, 0x81 => STA IndexedX, 0x91 => STA IndexedY,
    0x86 => STX ZeroPage, 0x96 => STX ZeroPageY, 0x8E => STX Absolute,
    0x84 => STY ZeroPage, 0x94 => STY ZeroPageX, 0x8C => STY Absolute,
    0xAA => TAX Implied, 0xA8 => TAY Implied, 0xBA => TSX Implied,
    0x8A => TXA Implied, 0x9A => TXS Implied, 0x98 => TYA Implied,
    // The stable undocumented opcodes.
    0xA7 => LAX ZeroPage, 0xB7 => LAX ZeroPageY, 0xAF => LAX Absolute,
    0xBF => LAX AbsoluteY, 0xA3 => LAX IndexedX, 0xB3 => LAX IndexedY,
    0x87 => SAX ZeroPage, 0x97 => SAX ZeroPageY, 0x8F => SAX Absolute, 0x83 => SAX IndexedX,
    0xCB => SBX Immediate, 0x4B => ALR Immediate, 0x0B => ANC Immediate, 0x6B => ARR Immediate,
}

encoding_table! {
    encode_cmos, decode_cmos;
    0x80 => BRA Relative,
    0x64 => STZ ZeroPage, 0x74 => STZ ZeroPageX, 0x9C => STZ Absolute, 0x9E => STZ AbsoluteX,
    0xDA => PHX Implied, 0xFA => PLX Implied, 0x5A => PHY Implied, 0x7A => PLY Implied,
    0x14 => TRB ZeroPage, 0x1C => TRB Absolute,
    0x04 => TSB ZeroPage, 0x0C => TSB Absolute,
    0x1A => INA Implied, 0x3A => DEA Implied,
    0xB2 => LDA IndexedZ, 0x92 => STA IndexedZ, 0x72 => ADC IndexedZ, 0xF2 => SBC IndexedZ,
    0x32 => AND IndexedZ, 0x12 => ORA IndexedZ, 0x52 => EOR IndexedZ, 0xD2 => CMP IndexedZ,
    0x89 => BIT Immediate, 0x34 => BIT ZeroPageX, 0x3C => BIT AbsoluteX,
}

encoding_table! {
    encode_ce02, decode_ce02;
    0xE3 => INW ZeroPage, 0xC3 => DEW ZeroPage,
    0x42 => NEG Implied, 0x43 => ASR Implied, 0x44 => ASR ZeroPage,
    0x4B => TAZ Implied, 0x6B => TZA Implied,
    0x1B => INZ Implied, 0x3B => DEZ Implied,
    0xDB => PHZ Implied, 0xFB => PLZ Implied,
    0x02 => CLE Implied, 0x03 => SEE Implied,
}

encoding_table! {
    encode_huc, decode_huc;
    0x62 => CLA Implied, 0x82 => CLX Implied, 0xC2 => CLY Implied,
    0xD4 => CSH Implied, 0x54 => CSL Implied,
    0x22 => SAY Implied, 0x02 => SXY Implied,
    0x53 => TAM Immediate, 0x43 => TMA Immediate,
    0x03 => ST0 Immediate, 0x13 => ST1 Immediate, 0x23 => ST2 Immediate,
    0xF4 => SET Implied, 0x42 => HuSAX Implied,
}

encoding_table! {
    encode_sixteen, decode_sixteen;
    0xFB => XCE Implied, 0xC2 => REP Immediate, 0xE2 => SEP Immediate,
    0x8B => PHB Implied, 0xAB => PLB Implied,
    0x0B => PHD Implied, 0x2B => PLD Implied, 0x4B => PHK Implied,
    0x6B => RTL Implied, 0x22 => JSL LongAbsolute,
    0x5B => TCD Implied, 0x7B => TDC Implied, 0x1B => TCS Implied, 0x3B => TSC Implied,
    0x9B => TXY Implied, 0xBB => TYX Implied, 0xEB => XBA Implied,
    0xF4 => PEA WordImmediate, 0xD4 => PEI ZeroPage, 0x62 => PER Relative,
    0x54 => MVN WordImmediate, 0x44 => MVP WordImmediate,
    0x82 => BRL Relative, 0x02 => COP Immediate,
    0xCB => WAI Implied, 0xDB => STP Implied,
}

/// Encodes for the active feature set; extensions win over the base
/// table, matching what the silicon actually decodes.
pub fn encode(opcode: Opcode, mode: AddressingMode, features: CpuFeature) -> Option<u8> {
    if features.contains(CpuFeature::CE02_OPS) {
        if let Some(byte) = encode_ce02(opcode, mode) {
            return Some(byte);
        }
    }
    if features.contains(CpuFeature::HUC6280_OPS) {
        if let Some(byte) = encode_huc(opcode, mode) {
            return Some(byte);
        }
    }
    if features.contains(CpuFeature::EMULATION_65816) || features.contains(CpuFeature::NATIVE_65816)
    {
        if let Some(byte) = encode_sixteen(opcode, mode) {
            return Some(byte);
        }
    }
    if features.contains(CpuFeature::CMOS_OPS) {
        if let Some(byte) = encode_cmos(opcode, mode) {
            return Some(byte);
        }
    }
    encode_nmos(opcode, mode)
}

/// Decode for the simulator, honoring the same shadowing order.
pub fn decode(byte: u8, features: CpuFeature) -> Option<(Opcode, AddressingMode)> {
    if features.contains(CpuFeature::CE02_OPS) {
        if let Some(decoded) = decode_ce02(byte) {
            return Some(decoded);
        }
    }
    if features.contains(CpuFeature::HUC6280_OPS) {
        if let Some(decoded) = decode_huc(byte) {
            return Some(decoded);
        }
    }
    if features.contains(CpuFeature::EMULATION_65816) || features.contains(CpuFeature::NATIVE_65816)
    {
        if let Some(decoded) = decode_sixteen(byte) {
            return Some(decoded);
        }
    }
    if features.contains(CpuFeature::CMOS_OPS) {
        if let Some(decoded) = decode_cmos(byte) {
            return Some(decoded);
        }
    }
    decode_nmos(byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_table_round_trips() {
        for byte in 0..=255u8 {
            if let Some((opcode, mode)) = decode_nmos(byte) {
                assert_eq!(encode_nmos(opcode, mode), Some(byte));
            }
        }
    }

    #[test]
    fn cmos_shadows_the_base_table() {
        let features = CpuFeature::CMOS_OPS;
        assert_eq!(
            decode(0x1A, features),
            Some((Opcode::INA, AddressingMode::Implied))
        );
        assert_eq!(decode(0x1A, CpuFeature::empty()), None);
        // Plain instructions stay identical across families.
        assert_eq!(
            decode(0xA9, features),
            Some((Opcode::LDA, AddressingMode::Immediate))
        );
    }

    #[test]
    fn undocumented_opcodes_live_in_the_base_table() {
        assert_eq!(
            encode(Opcode::LAX, AddressingMode::ZeroPage, CpuFeature::empty()),
            Some(0xA7)
        );
        assert_eq!(
            encode(Opcode::SBX, AddressingMode::Immediate, CpuFeature::ILLEGALS),
            Some(0xCB)
        );
    }

    #[test]
    fn stores_have_no_immediate_encoding() {
        assert_eq!(
            encode(Opcode::STA, AddressingMode::Immediate, CpuFeature::empty()),
            None
        );
    }
}
