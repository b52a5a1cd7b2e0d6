//! The rule catalogue, grouped into the sets the driver picks from.
//!
//! Naming follows what each rule does to the matched window. Every rule
//! is semantics-preserving given its preconditions; anything relying on
//! memory being plain RAM (no read/write side effects) lives in the
//! dangerous set.

use crate::addressing::AddressingMode::*;
use crate::constant::ConstantOp;
use crate::dataflow::Register;
use crate::opcode::Opcode::*;

use super::pattern::{
    AssemblyRule, AssemblyRuleSet, Flag, LineMatcher, ModeSpec, NewLine, OpcodeSpec, OperandSpec,
    Precondition,
};

const NZ: &[Flag] = &[Flag::N, Flag::Z];
const NZC: &[Flag] = &[Flag::N, Flag::Z, Flag::C];
const CV: &[Flag] = &[Flag::C, Flag::V];
const NZCV: &[Flag] = &[Flag::N, Flag::Z, Flag::C, Flag::V];

fn rule(
    name: &'static str,
    window: Vec<LineMatcher>,
    preconditions: Vec<Precondition>,
    replacement: Vec<NewLine>,
) -> AssemblyRule {
    AssemblyRule {
        name,
        window,
        preconditions,
        replacement,
    }
}

/// The cheap rules that run even at `-O1`.
pub fn quick_preset() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    // A load straight over another load of the same register.
    for (load, name) in [
        (LDA, "pointless-load-before-load-a"),
        (LDX, "pointless-load-before-load-x"),
        (LDY, "pointless-load-before-load-y"),
    ] {
        rules.push(rule(
            name,
            vec![LineMatcher::op(&[load]), LineMatcher::op(&[load])],
            vec![Precondition::FlagsDeadAfter(0, NZ)],
            vec![NewLine::copy(1)],
        ));
    }

    // Reloading what was just stored.
    for (store, load, name) in [
        (STA, LDA, "load-after-store-a"),
        (STX, LDX, "load-after-store-x"),
        (STY, LDY, "load-after-store-y"),
    ] {
        rules.push(rule(
            name,
            vec![
                LineMatcher::op(&[store]).bind(0),
                LineMatcher::op(&[load]).bind(0).same_mode_as(0),
            ],
            vec![Precondition::FlagsDeadAfter(1, NZ)],
            vec![NewLine::copy(0)],
        ));
    }

    // Two identical loads back to back.
    for (load, name) in [
        (LDA, "duplicate-load-a"),
        (LDX, "duplicate-load-x"),
        (LDY, "duplicate-load-y"),
    ] {
        rules.push(rule(
            name,
            vec![
                LineMatcher::op(&[load]).bind(0),
                LineMatcher::op(&[load]).bind(0).same_mode_as(0),
            ],
            vec![],
            vec![NewLine::copy(0)],
        ));
    }

    rules.push(rule(
        "clc-when-carry-clear",
        vec![LineMatcher::op(&[CLC])],
        vec![Precondition::FlagKnownAt(Flag::C, false)],
        vec![],
    ));
    rules.push(rule(
        "sec-when-carry-set",
        vec![LineMatcher::op(&[SEC])],
        vec![Precondition::FlagKnownAt(Flag::C, true)],
        vec![],
    ));

    rules.push(rule(
        "jump-to-next-line",
        vec![
            LineMatcher::op(&[JMP, BRA]).bind(0),
            LineMatcher::op(&[LABEL]).bind(0),
        ],
        vec![],
        vec![NewLine::copy(1)],
    ));

    AssemblyRuleSet {
        name: "QuickPreset",
        rules,
    }
}

/// The main workhorse set.
pub fn good_rules() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    rules.push(rule(
        "tail-call",
        vec![
            LineMatcher::op(&[JSR]).modes(&[Absolute]).bind(0),
            LineMatcher::op(&[RTS]),
        ],
        vec![],
        vec![NewLine::fixed(JMP, Absolute, OperandSpec::Slot(0))],
    ));

    rules.push(rule(
        "fold-immediate-addition",
        vec![
            LineMatcher::op(&[LDA]).modes(&[Immediate]).bind(0),
            LineMatcher::op(&[CLC]),
            LineMatcher::op(&[ADC]).modes(&[Immediate]).bind(1),
        ],
        vec![Precondition::FlagsDeadAfter(2, CV)],
        vec![NewLine::immediate(
            LDA,
            OperandSpec::ComputeByte(ConstantOp::Plus, 0, 1),
        )],
    ));
    rules.push(rule(
        "fold-immediate-subtraction",
        vec![
            LineMatcher::op(&[LDA]).modes(&[Immediate]).bind(0),
            LineMatcher::op(&[SEC]),
            LineMatcher::op(&[SBC]).modes(&[Immediate]).bind(1),
        ],
        vec![Precondition::FlagsDeadAfter(2, CV)],
        vec![NewLine::immediate(
            LDA,
            OperandSpec::ComputeByte(ConstantOp::Minus, 0, 1),
        )],
    ));
    for (op, fold, name) in [
        (AND, ConstantOp::And, "fold-immediate-and"),
        (ORA, ConstantOp::Or, "fold-immediate-or"),
        (EOR, ConstantOp::Exor, "fold-immediate-eor"),
    ] {
        rules.push(rule(
            name,
            vec![
                LineMatcher::op(&[LDA]).modes(&[Immediate]).bind(0),
                LineMatcher::op(&[op]).modes(&[Immediate]).bind(1),
            ],
            vec![],
            vec![NewLine::immediate(LDA, OperandSpec::ComputeByte(fold, 0, 1))],
        ));
    }
    rules.push(rule(
        "fold-immediate-shift-left",
        vec![
            LineMatcher::op(&[LDA]).modes(&[Immediate]).bind(0),
            LineMatcher::op(&[ASL]).modes(&[Implied]),
        ],
        vec![Precondition::FlagsDeadAfter(1, &[Flag::C])],
        vec![NewLine::immediate(
            LDA,
            OperandSpec::SlotOpByte(ConstantOp::Shl, 0, 1),
        )],
    ));
    rules.push(rule(
        "fold-immediate-shift-right",
        vec![
            LineMatcher::op(&[LDA]).modes(&[Immediate]).bind(0),
            LineMatcher::op(&[LSR]).modes(&[Implied]),
        ],
        vec![Precondition::FlagsDeadAfter(1, &[Flag::C])],
        vec![NewLine::immediate(
            LDA,
            OperandSpec::SlotOpByte(ConstantOp::Shr, 0, 1),
        )],
    ));

    rules.push(rule(
        "add-zero-is-nothing",
        vec![
            LineMatcher::op(&[CLC]),
            LineMatcher::op(&[ADC]).modes(&[Immediate]).is(0),
        ],
        vec![Precondition::FlagsDeadAfter(1, NZCV)],
        vec![],
    ));

    // The register already holds that exact value.
    for (load, register, name) in [
        (LDA, Register::A, "load-of-known-value-a"),
        (LDX, Register::X, "load-of-known-value-x"),
        (LDY, Register::Y, "load-of-known-value-y"),
    ] {
        rules.push(rule(
            name,
            vec![LineMatcher::op(&[load]).modes(&[Immediate]).bind(0)],
            vec![
                Precondition::RegisterEqualsSlot(register, 0),
                Precondition::FlagsDeadAfter(0, NZ),
            ],
            vec![],
        ));
    }

    rules.push(rule(
        "push-pull-identity",
        vec![LineMatcher::op(&[PHA]), LineMatcher::op(&[PLA])],
        vec![Precondition::FlagsDeadAfter(1, NZ)],
        vec![],
    ));

    for (first, second, name) in [
        (TAX, TXA, "transfer-there-and-back-ax"),
        (TAY, TYA, "transfer-there-and-back-ay"),
        (TXA, TAX, "transfer-there-and-back-xa"),
        (TYA, TAY, "transfer-there-and-back-ya"),
    ] {
        rules.push(rule(
            name,
            vec![LineMatcher::op(&[first]), LineMatcher::op(&[second])],
            vec![],
            vec![NewLine::copy(0)],
        ));
    }

    rules.push(rule(
        "compare-to-zero-after-load",
        vec![
            LineMatcher::op(&[LDA]),
            LineMatcher::op(&[CMP]).modes(&[Immediate]).is(0),
        ],
        vec![Precondition::FlagsDeadAfter(1, &[Flag::C])],
        vec![NewLine::copy(0)],
    ));

    for (load, step, fold, name) in [
        (LDX, INX, ConstantOp::Plus, "fold-increment-into-ldx"),
        (LDX, DEX, ConstantOp::Minus, "fold-decrement-into-ldx"),
        (LDY, INY, ConstantOp::Plus, "fold-increment-into-ldy"),
        (LDY, DEY, ConstantOp::Minus, "fold-decrement-into-ldy"),
    ] {
        rules.push(rule(
            name,
            vec![
                LineMatcher::op(&[load]).modes(&[Immediate]).bind(0),
                LineMatcher::op(&[step]),
            ],
            vec![],
            vec![NewLine::immediate(load, OperandSpec::SlotOpByte(fold, 0, 1))],
        ));
    }

    AssemblyRuleSet {
        name: "Good",
        rules,
    }
}

/// Assembly-level cleanups: control flow and dead code.
pub fn ass_opt() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    rules.push(rule(
        "branch-over-jump",
        vec![
            LineMatcher::op(&[BCC, BCS, BEQ, BNE, BMI, BPL, BVC, BVS]).bind(0),
            LineMatcher::op(&[JMP]).modes(&[Absolute]).bind(1),
            LineMatcher::op(&[LABEL]).bind(0),
        ],
        vec![],
        vec![
            NewLine {
                opcode: OpcodeSpec::InvertedBranchOf(0),
                mode: ModeSpec::Fixed(Relative),
                operand: OperandSpec::Slot(1),
            },
            NewLine::copy(2),
        ],
    ));

    for (transfer, register, name) in [
        (TAX, Register::X, "dead-transfer-to-x"),
        (TAY, Register::Y, "dead-transfer-to-y"),
        (TXA, Register::A, "dead-transfer-to-a-from-x"),
        (TYA, Register::A, "dead-transfer-to-a-from-y"),
    ] {
        rules.push(rule(
            name,
            vec![LineMatcher::op(&[transfer])],
            vec![
                Precondition::RegisterDeadAfter(0, register),
                Precondition::FlagsDeadAfter(0, NZ),
            ],
            vec![],
        ));
    }

    for (load, register, name) in [
        (LDA, Register::A, "dead-load-a"),
        (LDX, Register::X, "dead-load-x"),
        (LDY, Register::Y, "dead-load-y"),
    ] {
        rules.push(rule(
            name,
            vec![LineMatcher::op(&[load]).modes(&[Immediate, ZeroPage, Absolute])],
            vec![
                Precondition::RegisterDeadAfter(0, register),
                Precondition::FlagsDeadAfter(0, NZ),
            ],
            vec![],
        ));
    }

    rules.push(rule(
        "dead-compare",
        vec![LineMatcher::op(&[CMP, CPX, CPY])],
        vec![Precondition::FlagsDeadAfter(0, NZC)],
        vec![],
    ));

    rules.push(rule(
        "dead-carry-change",
        vec![LineMatcher::op(&[CLC, SEC])],
        vec![Precondition::FlagsDeadAfter(0, &[Flag::C])],
        vec![],
    ));

    AssemblyRuleSet {
        name: "AssOpt",
        rules,
    }
}

/// Rules that only pay off after the main sets have converged.
pub fn later_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    // Reload over a one-line gap that cannot have disturbed A or the
    // stored cell. The gap may move the index registers, so only
    // unindexed stores qualify.
    rules.push(rule(
        "reload-over-safe-gap",
        vec![
            LineMatcher::op(&[STA]).modes(&[ZeroPage, Absolute]).bind(0),
            LineMatcher::op(&[STX, STY, LDX, LDY, INX, DEX, INY, DEY, CPX, CPY, CLC, SEC, NOP])
                .not_accessing(0),
            LineMatcher::op(&[LDA]).modes(&[ZeroPage, Absolute]).bind(0),
        ],
        vec![Precondition::FlagsDeadAfter(2, NZ)],
        vec![NewLine::copy(0), NewLine::copy(1)],
    ));

    AssemblyRuleSet {
        name: "LaterOptimizations",
        rules,
    }
}

pub fn cmos_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    rules.push(rule(
        "store-zero-is-stz",
        vec![
            LineMatcher::op(&[LDA]).modes(&[Immediate]).is(0),
            LineMatcher::op(&[STA]).modes(&[ZeroPage, ZeroPageX, Absolute, AbsoluteX]),
        ],
        vec![
            Precondition::RegisterDeadAfter(1, Register::A),
            Precondition::FlagsDeadAfter(1, NZ),
        ],
        vec![NewLine {
            opcode: OpcodeSpec::Fixed(STZ),
            mode: ModeSpec::SameAsLine(1),
            operand: OperandSpec::OfLine(1),
        }],
    ));

    rules.push(rule(
        "increment-accumulator",
        vec![
            LineMatcher::op(&[CLC]),
            LineMatcher::op(&[ADC]).modes(&[Immediate]).is(1),
        ],
        vec![Precondition::FlagsDeadAfter(1, CV)],
        vec![NewLine::implied(INA)],
    ));
    rules.push(rule(
        "decrement-accumulator",
        vec![
            LineMatcher::op(&[SEC]),
            LineMatcher::op(&[SBC]).modes(&[Immediate]).is(1),
        ],
        vec![Precondition::FlagsDeadAfter(1, CV)],
        vec![NewLine::implied(DEA)],
    ));

    rules.push(rule(
        "push-x-directly",
        vec![LineMatcher::op(&[TXA]), LineMatcher::op(&[PHA])],
        vec![
            Precondition::RegisterDeadAfter(1, Register::A),
            Precondition::FlagsDeadAfter(1, NZ),
        ],
        vec![NewLine::implied(PHX)],
    ));
    rules.push(rule(
        "push-y-directly",
        vec![LineMatcher::op(&[TYA]), LineMatcher::op(&[PHA])],
        vec![
            Precondition::RegisterDeadAfter(1, Register::A),
            Precondition::FlagsDeadAfter(1, NZ),
        ],
        vec![NewLine::implied(PHY)],
    ));
    rules.push(rule(
        "pull-x-directly",
        vec![LineMatcher::op(&[PLA]), LineMatcher::op(&[TAX])],
        vec![Precondition::RegisterDeadAfter(1, Register::A)],
        vec![NewLine::implied(PLX)],
    ));
    rules.push(rule(
        "pull-y-directly",
        vec![LineMatcher::op(&[PLA]), LineMatcher::op(&[TAY])],
        vec![Precondition::RegisterDeadAfter(1, Register::A)],
        vec![NewLine::implied(PLY)],
    ));

    AssemblyRuleSet {
        name: "CmosOptimizations",
        rules,
    }
}

pub fn ce02_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    // The canonical 16-bit increment collapses to INW.
    rules.push(rule(
        "word-increment",
        vec![
            LineMatcher::op(&[INC]).modes(&[ZeroPage]).bind(0),
            LineMatcher::op(&[BNE]).bind(1),
            LineMatcher::op(&[INC]).modes(&[ZeroPage]).bind(2),
            LineMatcher::op(&[LABEL]).bind(1),
        ],
        vec![
            Precondition::Consecutive(0, 2),
            Precondition::FlagsDeadAfter(3, NZ),
        ],
        vec![
            NewLine::fixed(INW, ZeroPage, OperandSpec::Slot(0)),
            NewLine::copy(3),
        ],
    ));

    rules.push(rule(
        "negate-accumulator",
        vec![
            LineMatcher::op(&[EOR]).modes(&[Immediate]).is(0xff),
            LineMatcher::op(&[CLC]),
            LineMatcher::op(&[ADC]).modes(&[Immediate]).is(1),
        ],
        vec![Precondition::FlagsDeadAfter(2, CV)],
        vec![NewLine::implied(NEG)],
    ));

    AssemblyRuleSet {
        name: "CE02Optimizations",
        rules,
    }
}

pub fn hudson_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    // The HuC6280 clear instructions touch no flags, so the flags the
    // load would have set must be dead.
    for (load, clear, name) in [
        (LDA, CLA, "clear-a"),
        (LDX, CLX, "clear-x"),
        (LDY, CLY, "clear-y"),
    ] {
        rules.push(rule(
            name,
            vec![LineMatcher::op(&[load]).modes(&[Immediate]).is(0)],
            vec![Precondition::FlagsDeadAfter(0, NZ)],
            vec![NewLine::implied(clear)],
        ));
    }

    AssemblyRuleSet {
        name: "HudsonOptimizations",
        rules,
    }
}

pub fn sixteen_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    rules.push(rule(
        "transfer-x-to-y",
        vec![LineMatcher::op(&[TXA]), LineMatcher::op(&[TAY])],
        vec![Precondition::RegisterDeadAfter(1, Register::A)],
        vec![NewLine::implied(TXY)],
    ));
    rules.push(rule(
        "transfer-y-to-x",
        vec![LineMatcher::op(&[TYA]), LineMatcher::op(&[TAX])],
        vec![Precondition::RegisterDeadAfter(1, Register::A)],
        vec![NewLine::implied(TYX)],
    ));

    for (op, name) in [(REP, "merge-rep"), (SEP, "merge-sep")] {
        rules.push(rule(
            name,
            vec![
                LineMatcher::op(&[op]).modes(&[Immediate]).bind(0),
                LineMatcher::op(&[op]).modes(&[Immediate]).bind(1),
            ],
            vec![],
            vec![NewLine::immediate(
                op,
                OperandSpec::ComputeByte(ConstantOp::Or, 0, 1),
            )],
        ));
    }

    AssemblyRuleSet {
        name: "SixteenOptimizations",
        rules,
    }
}

pub fn undocumented_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    // LDA+TAX in one opcode; the immediate form is unstable silicon and
    // never used.
    rules.push(rule(
        "load-a-and-x",
        vec![
            LineMatcher::op(&[LDA]).modes(&[ZeroPage, Absolute, AbsoluteY, IndexedY]),
            LineMatcher::op(&[TAX]),
        ],
        vec![],
        vec![NewLine {
            opcode: OpcodeSpec::Fixed(LAX),
            mode: ModeSpec::SameAsLine(0),
            operand: OperandSpec::OfLine(0),
        }],
    ));
    rules.push(rule(
        "load-x-and-a",
        vec![
            LineMatcher::op(&[LDX]).modes(&[ZeroPage, ZeroPageY, Absolute, AbsoluteY]),
            LineMatcher::op(&[TXA]),
        ],
        vec![],
        vec![NewLine {
            opcode: OpcodeSpec::Fixed(LAX),
            mode: ModeSpec::SameAsLine(0),
            operand: OperandSpec::OfLine(0),
        }],
    ));

    rules.push(rule(
        "and-then-shift-is-alr",
        vec![
            LineMatcher::op(&[AND]).modes(&[Immediate]).bind(0),
            LineMatcher::op(&[LSR]).modes(&[Implied]),
        ],
        vec![],
        vec![NewLine::immediate(ALR, OperandSpec::Slot(0))],
    ));

    rules.push(rule(
        "double-decrement-is-sbx",
        vec![LineMatcher::op(&[DEX]), LineMatcher::op(&[DEX])],
        vec![
            Precondition::RegisterKnownAt(Register::A, 0xff),
            Precondition::FlagsDeadAfter(1, &[Flag::C]),
        ],
        vec![NewLine::immediate(SBX, OperandSpec::Num(2))],
    ));

    AssemblyRuleSet {
        name: "UndocumentedOptimizations",
        rules,
    }
}

/// Sound only when every operand is plain RAM; reads and writes with
/// side effects would be lost.
pub fn dangerous_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    rules.push(rule(
        "overwritten-store",
        vec![
            LineMatcher::op(&[STA]).bind(0),
            LineMatcher::op(&[STA]).bind(0).same_mode_as(0),
        ],
        vec![],
        vec![NewLine::copy(1)],
    ));

    rules.push(rule(
        "write-back-of-unchanged-value",
        vec![
            LineMatcher::op(&[LDA]).bind(0),
            LineMatcher::op(&[STA]).bind(0).same_mode_as(0),
        ],
        vec![],
        vec![NewLine::copy(0)],
    ));

    AssemblyRuleSet {
        name: "DangerousOptimizations",
        rules,
    }
}

pub fn zeropage_register_optimizations() -> AssemblyRuleSet {
    let mut rules = Vec::new();

    rules.push(rule(
        "pseudoregister-churn",
        vec![
            LineMatcher::op(&[STA]).related_to("__reg").bind(0),
            LineMatcher::op(&[LDA]).bind(0).same_mode_as(0),
        ],
        vec![Precondition::FlagsDeadAfter(1, NZ)],
        vec![NewLine::copy(0)],
    ));

    // A pseudoregister byte stored twice with nothing reading it between.
    rules.push(rule(
        "pseudoregister-dead-store",
        vec![
            LineMatcher::op(&[STA]).related_to("__reg").bind(0),
            LineMatcher::any().not_accessing(0).straight_line(),
            LineMatcher::op(&[STA]).bind(0).same_mode_as(0),
        ],
        vec![],
        vec![NewLine::copy(1), NewLine::copy(2)],
    ));

    AssemblyRuleSet {
        name: "ZeropageRegisterOptimizations",
        rules,
    }
}
