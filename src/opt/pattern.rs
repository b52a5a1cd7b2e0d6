//! The peephole matcher DSL.
//!
//! Rules are data: a window of line matchers, a list of dataflow
//! preconditions, and a replacement template. Keeping them declarative
//! buys deterministic ordering, per-rule debug logging, and an engine
//! that can refuse an unsound transform in one place.

use crate::addressing::AddressingMode;
use crate::assembly::AssemblyLine;
use crate::constant::{Constant, ConstantOp};
use crate::dataflow::{CpuStatus, Liveness, Register};
use crate::opcode::Opcode;

/// Operand unification slots shared across one rule's window.
pub type Slot = usize;
pub const SLOTS: usize = 4;

#[derive(Debug, Clone)]
pub enum OperandMatcher {
    Any,
    /// Unify: first occurrence captures, later ones must match.
    Bind(Slot),
    /// A specific numeric value.
    Is(i64),
}

#[derive(Debug, Clone)]
pub struct LineMatcher {
    /// `None` matches any opcode.
    pub opcodes: Option<Vec<Opcode>>,
    pub modes: Option<Vec<AddressingMode>>,
    pub operand: OperandMatcher,
    /// Pinned lines never match unless this is set (label keepers only).
    pub allow_pinned: bool,
    /// The line must not read or write the captured operand's memory.
    pub not_accessing: Option<Slot>,
    pub forbid_control_flow: bool,
    /// The operand must mention the named symbol.
    pub operand_related_to: Option<&'static str>,
    /// The mode must equal that of an earlier window line; two lines
    /// with the same operand but different modes can still address
    /// different bytes (indexing), so operand unification alone is not
    /// an aliasing proof.
    pub same_mode_as: Option<usize>,
}

impl LineMatcher {
    pub fn op(opcodes: &[Opcode]) -> LineMatcher {
        LineMatcher {
            opcodes: Some(opcodes.to_vec()),
            modes: None,
            operand: OperandMatcher::Any,
            allow_pinned: false,
            not_accessing: None,
            forbid_control_flow: false,
            operand_related_to: None,
            same_mode_as: None,
        }
    }

    pub fn any() -> LineMatcher {
        LineMatcher {
            opcodes: None,
            modes: None,
            operand: OperandMatcher::Any,
            allow_pinned: false,
            not_accessing: None,
            forbid_control_flow: false,
            operand_related_to: None,
            same_mode_as: None,
        }
    }

    pub fn modes(mut self, modes: &[AddressingMode]) -> LineMatcher {
        self.modes = Some(modes.to_vec());
        self
    }

    pub fn bind(mut self, slot: Slot) -> LineMatcher {
        self.operand = OperandMatcher::Bind(slot);
        self
    }

    pub fn is(mut self, value: i64) -> LineMatcher {
        self.operand = OperandMatcher::Is(value);
        self
    }

    pub fn not_accessing(mut self, slot: Slot) -> LineMatcher {
        self.not_accessing = Some(slot);
        self
    }

    pub fn straight_line(mut self) -> LineMatcher {
        self.forbid_control_flow = true;
        self
    }

    pub fn related_to(mut self, name: &'static str) -> LineMatcher {
        self.operand_related_to = Some(name);
        self
    }

    pub fn same_mode_as(mut self, index: usize) -> LineMatcher {
        self.same_mode_as = Some(index);
        self
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Flag {
    N,
    Z,
    C,
    V,
}

/// Dataflow requirements checked after the structural match succeeds.
#[derive(Debug, Clone)]
pub enum Precondition {
    /// The flags are dead right after window line `0` executes.
    FlagsDeadAfter(usize, &'static [Flag]),
    RegisterDeadAfter(usize, Register),
    /// At window entry.
    RegisterKnownAt(Register, u8),
    FlagKnownAt(Flag, bool),
    /// The register already holds the slot's (numeric) value.
    RegisterEqualsSlot(Register, Slot),
    /// The two captured operands provably name different memory.
    Unrelated(Slot, Slot),
    /// `slot_hi` is exactly `slot_lo + 1` (a word pair).
    Consecutive(Slot, Slot),
}

#[derive(Debug, Clone)]
pub enum OpcodeSpec {
    Fixed(Opcode),
    SameAsLine(usize),
    InvertedBranchOf(usize),
}

#[derive(Debug, Clone)]
pub enum ModeSpec {
    Fixed(AddressingMode),
    SameAsLine(usize),
}

#[derive(Debug, Clone)]
pub enum OperandSpec {
    Slot(Slot),
    Num(i64),
    OfLine(usize),
    /// Fold two captured operands, truncated to a byte.
    ComputeByte(ConstantOp, Slot, Slot),
    /// Fold a captured operand with a literal, truncated to a byte.
    SlotOpByte(ConstantOp, Slot, i64),
    Nothing,
}

#[derive(Debug, Clone)]
pub struct NewLine {
    pub opcode: OpcodeSpec,
    pub mode: ModeSpec,
    pub operand: OperandSpec,
}

impl NewLine {
    pub fn fixed(opcode: Opcode, mode: AddressingMode, operand: OperandSpec) -> NewLine {
        NewLine {
            opcode: OpcodeSpec::Fixed(opcode),
            mode: ModeSpec::Fixed(mode),
            operand,
        }
    }

    pub fn implied(opcode: Opcode) -> NewLine {
        NewLine::fixed(opcode, AddressingMode::Implied, OperandSpec::Nothing)
    }

    pub fn immediate(opcode: Opcode, operand: OperandSpec) -> NewLine {
        NewLine::fixed(opcode, AddressingMode::Immediate, operand)
    }

    /// Reproduce window line `index` unchanged.
    pub fn copy(index: usize) -> NewLine {
        NewLine {
            opcode: OpcodeSpec::SameAsLine(index),
            mode: ModeSpec::SameAsLine(index),
            operand: OperandSpec::OfLine(index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblyRule {
    pub name: &'static str,
    pub window: Vec<LineMatcher>,
    pub preconditions: Vec<Precondition>,
    pub replacement: Vec<NewLine>,
}

#[derive(Debug)]
pub struct AssemblyRuleSet {
    pub name: &'static str,
    pub rules: Vec<AssemblyRule>,
}

pub struct MatchState {
    pub slots: [Option<Constant>; SLOTS],
}

/// Structural match of the window at `at`; returns the unified slots.
pub fn match_window(
    rule: &AssemblyRule,
    lines: &[AssemblyLine],
    at: usize,
) -> Option<MatchState> {
    if at + rule.window.len() > lines.len() {
        return None;
    }
    let mut slots: [Option<Constant>; SLOTS] = [None, None, None, None];
    for (matcher, line) in rule.window.iter().zip(&lines[at..]) {
        if !matcher.allow_pinned && !line.elidable {
            return None;
        }
        if let Some(earlier) = matcher.same_mode_as {
            if line.mode != lines[at + earlier].mode {
                return None;
            }
        }
        if let Some(opcodes) = &matcher.opcodes {
            if !opcodes.contains(&line.opcode) {
                return None;
            }
        }
        if let Some(modes) = &matcher.modes {
            if !modes.contains(&line.mode) {
                return None;
            }
        }
        // A label is a join point, so it also ends a straight-line run.
        if matcher.forbid_control_flow && (line.opcode.is_control_flow() || line.is_label()) {
            return None;
        }
        if let Some(name) = matcher.operand_related_to {
            if !line.operand.is_related_to(name) {
                return None;
            }
        }
        match matcher.operand {
            OperandMatcher::Any => {}
            OperandMatcher::Is(value) => {
                if line.operand.eval() != Some(value) {
                    return None;
                }
            }
            OperandMatcher::Bind(slot) => {
                let value = line.operand.quick_simplify();
                match &slots[slot] {
                    None => slots[slot] = Some(value),
                    Some(existing) => {
                        if *existing != value {
                            return None;
                        }
                    }
                }
            }
        }
        if let Some(slot) = matcher.not_accessing {
            match &slots[slot] {
                Some(captured) => match captured.base_symbol() {
                    Some(name) => {
                        if line.accesses_thing(name) {
                            return None;
                        }
                    }
                    // A raw numeric address; nothing to compare names
                    // against, so any memory access might alias it.
                    None => {
                        if line.reads_memory() || line.changes_memory() {
                            return None;
                        }
                    }
                },
                None => return None,
            }
        }
    }
    Some(MatchState { slots })
}

fn unrelated(a: &Constant, b: &Constant) -> bool {
    if let (Some(x), Some(y)) = (a.eval(), b.eval()) {
        return x != y;
    }
    match (a.base_symbol(), b.base_symbol()) {
        (Some(sa), Some(sb)) if sa != sb => true,
        // Same symbol: distinct constant offsets keep them apart.
        (Some(_), Some(_)) => a != b,
        _ => false,
    }
}

fn flag_live(liveness: &Liveness, flag: Flag) -> bool {
    match flag {
        Flag::N => liveness.n,
        Flag::Z => liveness.z,
        Flag::C => liveness.c,
        Flag::V => liveness.v,
    }
}

fn register_live(liveness: &Liveness, register: Register) -> bool {
    match register {
        Register::A => liveness.a,
        Register::X => liveness.x,
        Register::Y => liveness.y,
    }
}

/// Checks the rule's dataflow preconditions at the matched window.
pub fn check_preconditions(
    rule: &AssemblyRule,
    at: usize,
    slots: &MatchState,
    states: &[CpuStatus],
    liveness: &[Liveness],
) -> bool {
    rule.preconditions.iter().all(|precondition| {
        match precondition {
            Precondition::FlagsDeadAfter(offset, flags) => {
                let live = &liveness[at + offset];
                flags.iter().all(|flag| !flag_live(live, *flag))
            }
            Precondition::RegisterDeadAfter(offset, register) => {
                !register_live(&liveness[at + offset], *register)
            }
            Precondition::RegisterKnownAt(register, value) => {
                states[at].register(*register).known() == Some(*value)
            }
            Precondition::FlagKnownAt(flag, value) => {
                let status = match flag {
                    Flag::N => states[at].n,
                    Flag::Z => states[at].z,
                    Flag::C => states[at].c,
                    Flag::V => states[at].v,
                };
                status.known() == Some(*value)
            }
            Precondition::RegisterEqualsSlot(register, slot) => {
                match (&slots.slots[*slot], states[at].register(*register).known()) {
                    (Some(captured), Some(value)) => {
                        captured.eval().map(|v| (v & 0xff) as u8) == Some(value)
                    }
                    _ => false,
                }
            }
            Precondition::Unrelated(a, b) => match (&slots.slots[*a], &slots.slots[*b]) {
                (Some(a), Some(b)) => unrelated(a, b),
                _ => false,
            },
            Precondition::Consecutive(lo, hi) => {
                match (&slots.slots[*lo], &slots.slots[*hi]) {
                    (Some(lo), Some(hi)) => lo.clone() + 1 == *hi,
                    _ => false,
                }
            }
        }
    })
}

/// Instantiates the replacement. `None` means the rule does not apply
/// here after all (a template needed a numeric value the operand does
/// not have); legality of the result is the engine's check.
pub fn build_replacement(
    rule: &AssemblyRule,
    lines: &[AssemblyLine],
    at: usize,
    slots: &MatchState,
) -> Option<Vec<AssemblyLine>> {
    let mut replacement = Vec::with_capacity(rule.replacement.len());
    for template in &rule.replacement {
        let opcode = match &template.opcode {
            OpcodeSpec::Fixed(opcode) => *opcode,
            OpcodeSpec::SameAsLine(index) => lines[at + index].opcode,
            OpcodeSpec::InvertedBranchOf(index) => lines[at + index].opcode.inverted_branch()?,
        };
        let mode = match &template.mode {
            ModeSpec::Fixed(mode) => *mode,
            ModeSpec::SameAsLine(index) => lines[at + index].mode,
        };
        let operand = match &template.operand {
            OperandSpec::Slot(slot) => slots.slots[*slot].clone()?,
            OperandSpec::Num(value) => Constant::num(*value),
            OperandSpec::OfLine(index) => lines[at + index].operand.clone(),
            OperandSpec::ComputeByte(op, a, b) => {
                let a = slots.slots[*a].clone()?;
                let b = slots.slots[*b].clone()?;
                let folded = Constant::Compound(*op, Box::new(a), Box::new(b)).quick_simplify();
                Constant::num(folded.eval()? & 0xff)
            }
            OperandSpec::SlotOpByte(op, slot, literal) => {
                let base = slots.slots[*slot].clone()?;
                let folded =
                    Constant::Compound(*op, Box::new(base), Box::new(Constant::num(*literal)))
                        .quick_simplify();
                Constant::num(folded.eval()? & 0xff)
            }
            OperandSpec::Nothing => Constant::zero(),
        };
        replacement.push(AssemblyLine::new(opcode, mode, operand));
    }
    Some(replacement)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_unifies_across_the_window() {
        let rule = AssemblyRule {
            name: "store-load",
            window: vec![
                LineMatcher::op(&[Opcode::STA]).bind(0),
                LineMatcher::op(&[Opcode::LDA]).bind(0),
            ],
            preconditions: vec![],
            replacement: vec![NewLine::copy(0)],
        };
        let matching = vec![
            AssemblyLine::absolute(Opcode::STA, Constant::addr("x")),
            AssemblyLine::absolute(Opcode::LDA, Constant::addr("x")),
        ];
        assert!(match_window(&rule, &matching, 0).is_some());

        let different = vec![
            AssemblyLine::absolute(Opcode::STA, Constant::addr("x")),
            AssemblyLine::absolute(Opcode::LDA, Constant::addr("y")),
        ];
        assert!(match_window(&rule, &different, 0).is_none());
    }

    #[test]
    fn pinned_lines_refuse_to_match() {
        let rule = AssemblyRule {
            name: "drop-rts",
            window: vec![LineMatcher::op(&[Opcode::RTS])],
            preconditions: vec![],
            replacement: vec![],
        };
        let pinned = vec![AssemblyLine::implied(Opcode::RTS).pinned()];
        assert!(match_window(&rule, &pinned, 0).is_none());
    }

    #[test]
    fn folding_templates_need_numeric_operands() {
        use crate::constant::ConstantOp;

        let rule = AssemblyRule {
            name: "fold",
            window: vec![
                LineMatcher::op(&[Opcode::LDA]).bind(0),
                LineMatcher::op(&[Opcode::ADC]).bind(1),
            ],
            preconditions: vec![],
            replacement: vec![NewLine::immediate(
                Opcode::LDA,
                OperandSpec::ComputeByte(ConstantOp::Plus, 0, 1),
            )],
        };
        // The low byte of a symbol address is not a number yet, so the
        // rule must quietly not apply.
        let lines = vec![
            AssemblyLine::immediate(Opcode::LDA, Constant::addr("table").lo_byte()),
            AssemblyLine::immediate(Opcode::ADC, 1),
        ];
        let slots = match_window(&rule, &lines, 0).unwrap();
        assert!(build_replacement(&rule, &lines, 0, &slots).is_none());
    }
}
