//! The `-O9` superoptimizer.
//!
//! Only straight-line, accumulator-and-flags-only blocks are considered.
//! For those the full input space is just 256 accumulator values times
//! two carry states, so candidate sequences are checked by exhaustive
//! forward execution, not by reasoning. Search is iterative-deepening
//! over a small instruction alphabet, bounded per block.

use log::debug;

use crate::addressing::AddressingMode;
use crate::assembly::{sequence_bytes, sequence_cycles, AssemblyLine};
use crate::dataflow::analyze_liveness;
use crate::opcode::Opcode;
use crate::options::{JobContext, OptimizationMetric};

const MAX_BLOCK_LEN: usize = 5;
const NODE_BUDGET: usize = 50_000;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct RegState {
    a: u8,
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

fn set_nz(state: &mut RegState, value: u8) {
    state.n = value & 0x80 != 0;
    state.z = value == 0;
}

/// Executes one accumulator-only line. `None` when the opcode is outside
/// the modelled subset.
fn step(mut state: RegState, line: &AssemblyLine) -> Option<RegState> {
    use Opcode::*;
    let immediate = || {
        line.operand.eval().map(|value| (value & 0xff) as u8)
    };
    match (line.opcode, line.mode) {
        (LDA, AddressingMode::Immediate) => {
            state.a = immediate()?;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (ADC, AddressingMode::Immediate) | (SBC, AddressingMode::Immediate) => {
            let operand = immediate()?;
            let operand = if line.opcode == SBC { !operand } else { operand };
            let full = u16::from(state.a) + u16::from(operand) + u16::from(state.c);
            let result = (full & 0xff) as u8;
            state.v = ((state.a ^ result) & (operand ^ result)) & 0x80 != 0;
            state.c = full > 0xff;
            state.a = result;
            set_nz(&mut state, result);
        }
        (AND, AddressingMode::Immediate) => {
            state.a &= immediate()?;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (ORA, AddressingMode::Immediate) => {
            state.a |= immediate()?;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (EOR, AddressingMode::Immediate) => {
            state.a ^= immediate()?;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (CMP, AddressingMode::Immediate) => {
            let operand = immediate()?;
            let result = state.a.wrapping_sub(operand);
            state.c = state.a >= operand;
            set_nz(&mut state, result);
        }
        (ASL, AddressingMode::Implied) => {
            state.c = state.a & 0x80 != 0;
            state.a <<= 1;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (LSR, AddressingMode::Implied) => {
            state.c = state.a & 1 != 0;
            state.a >>= 1;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (ROL, AddressingMode::Implied) => {
            let carry_in = u8::from(state.c);
            state.c = state.a & 0x80 != 0;
            state.a = state.a << 1 | carry_in;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (ROR, AddressingMode::Implied) => {
            let carry_in = u8::from(state.c);
            state.c = state.a & 1 != 0;
            state.a = state.a >> 1 | carry_in << 7;
            let new_a = state.a;
            set_nz(&mut state, new_a);
        }
        (CLC, AddressingMode::Implied) => state.c = false,
        (SEC, AddressingMode::Implied) => state.c = true,
        (NOP, AddressingMode::Implied) => {}
        _ => return None,
    }
    Some(state)
}

fn run(lines: &[AssemblyLine], start: RegState) -> Option<RegState> {
    lines.iter().try_fold(start, step)
}

#[derive(Copy, Clone)]
struct Observed {
    a: bool,
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

fn same_outputs(left: RegState, right: RegState, observed: Observed) -> bool {
    (!observed.a || left.a == right.a)
        && (!observed.n || left.n == right.n)
        && (!observed.z || left.z == right.z)
        && (!observed.c || left.c == right.c)
        && (!observed.v || left.v == right.v)
}

fn inputs() -> impl Iterator<Item = RegState> {
    (0..=255u8).flat_map(|a| {
        [false, true].into_iter().map(move |c| RegState {
            a,
            n: false,
            z: false,
            c,
            v: false,
        })
    })
}

fn equivalent(candidate: &[AssemblyLine], reference: &[RegState], observed: Observed) -> bool {
    inputs().zip(reference).all(|(input, expected)| {
        match run(candidate, input) {
            Some(output) => same_outputs(output, *expected, observed),
            None => false,
        }
    })
}

fn cost(lines: &[AssemblyLine], metric: OptimizationMetric) -> u32 {
    match metric {
        OptimizationMetric::Size => sequence_bytes(lines),
        _ => sequence_cycles(lines),
    }
}

/// Candidate instructions: the implied subset plus immediates over the
/// constants seen in (or produced by) the block.
fn alphabet(block: &[AssemblyLine], reference: &[RegState]) -> Vec<AssemblyLine> {
    let mut constants = vec![0i64, 1, 0xff];
    for line in block {
        if line.mode == AddressingMode::Immediate {
            if let Some(value) = line.operand.eval() {
                constants.push(value & 0xff);
            }
        }
    }
    // Outputs for two corner inputs catch constant-result blocks.
    for state in [reference.first(), reference.last()].into_iter().flatten() {
        constants.push(i64::from(state.a));
    }
    constants.sort_unstable();
    constants.dedup();

    let mut candidates = vec![
        AssemblyLine::implied(Opcode::CLC),
        AssemblyLine::implied(Opcode::SEC),
        AssemblyLine::implied(Opcode::ASL),
        AssemblyLine::implied(Opcode::LSR),
        AssemblyLine::implied(Opcode::ROL),
        AssemblyLine::implied(Opcode::ROR),
    ];
    for constant in constants {
        for opcode in [
            Opcode::LDA,
            Opcode::ADC,
            Opcode::SBC,
            Opcode::AND,
            Opcode::ORA,
            Opcode::EOR,
            Opcode::CMP,
        ] {
            candidates.push(AssemblyLine::immediate(opcode, constant));
        }
    }
    candidates
}

fn dfs(
    alphabet: &[AssemblyLine],
    sequence: &mut Vec<AssemblyLine>,
    remaining: usize,
    reference: &[RegState],
    observed: Observed,
    max_cost: u32,
    metric: OptimizationMetric,
    budget: &mut usize,
) -> bool {
    if *budget == 0 {
        return false;
    }
    *budget -= 1;
    if cost(sequence, metric) >= max_cost {
        return false;
    }
    if remaining == 0 {
        return equivalent(sequence, reference, observed);
    }
    for candidate in alphabet {
        sequence.push(candidate.clone());
        if dfs(
            alphabet, sequence, remaining - 1, reference, observed, max_cost, metric, budget,
        ) {
            return true;
        }
        sequence.pop();
    }
    false
}

/// Whether the block at `start` might run with decimal mode on. The
/// compiler only ever sets D inside a short `SED..CLD` bracket with no
/// labels in between, so the nearest decimal instruction upstream
/// decides.
fn decimal_unsafe(lines: &[AssemblyLine], start: usize) -> bool {
    for line in lines[..start].iter().rev() {
        match line.opcode {
            Opcode::SED => return true,
            Opcode::CLD => return false,
            Opcode::LABEL => return false,
            _ => {}
        }
    }
    false
}

/// Replaces short register-only blocks with the cheapest equivalent
/// sequence the bounded search can find.
pub fn superoptimize(
    job: &JobContext,
    function_name: &str,
    lines: Vec<AssemblyLine>,
) -> Vec<AssemblyLine> {
    let metric = job.options.metric;
    let mut lines = lines;
    let mut start = 0;
    while start < lines.len() {
        // Grow the largest supported block at `start`.
        let mut end = start;
        while end < lines.len()
            && end - start < MAX_BLOCK_LEN
            && lines[end].elidable
            && step(
                RegState {
                    a: 0,
                    n: false,
                    z: false,
                    c: false,
                    v: false,
                },
                &lines[end],
            )
            .is_some()
        {
            end += 1;
        }
        if end - start < 2 || decimal_unsafe(&lines, start) {
            start = end.max(start + 1);
            continue;
        }

        let block = &lines[start..end];
        let reference: Vec<RegState> = match inputs()
            .map(|input| run(block, input))
            .collect::<Option<Vec<_>>>()
        {
            Some(reference) => reference,
            None => {
                start = end;
                continue;
            }
        };
        let liveness = analyze_liveness(&lines);
        let live = liveness[end - 1];
        let observed = Observed {
            a: live.a,
            n: live.n,
            z: live.z,
            c: live.c,
            v: live.v,
        };

        let alphabet = alphabet(block, &reference);
        let original_cost = cost(block, metric);
        let mut budget = NODE_BUDGET;
        let mut found = None;
        for length in 0..block.len() {
            let mut sequence = Vec::with_capacity(length);
            if dfs(
                &alphabet,
                &mut sequence,
                length,
                &reference,
                observed,
                original_cost,
                metric,
                &mut budget,
            ) {
                found = Some(sequence);
                break;
            }
            if budget == 0 {
                break;
            }
        }

        match found {
            Some(replacement) => {
                debug!(
                    "{}: superoptimizer shrank a {}-line block to {}",
                    function_name,
                    end - start,
                    replacement.len()
                );
                let new_end = start + replacement.len();
                lines.splice(start..end, replacement);
                start = new_end.max(start + 1);
            }
            None => start = end,
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use crate::constant::Constant;
    use crate::options::CompilationOptions;

    use super::*;

    #[test]
    fn constant_arithmetic_collapses_to_one_load() {
        let job = JobContext::new(CompilationOptions::default().with_level(9));
        let lines = vec![
            AssemblyLine::immediate(Opcode::LDA, 2),
            AssemblyLine::implied(Opcode::CLC),
            AssemblyLine::immediate(Opcode::ADC, 2),
            AssemblyLine::absolute(Opcode::STA, Constant::addr("out")),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let optimized = superoptimize(&job, "test", lines);
        assert!(optimized
            .iter()
            .any(|line| line.opcode == Opcode::LDA && line.operand.eval() == Some(4)));
        assert!(!optimized.iter().any(|line| line.opcode == Opcode::ADC));
    }

    #[test]
    fn blocks_with_live_flags_keep_their_behavior() {
        let job = JobContext::new(CompilationOptions::default().with_level(9));
        // The carry out of ASL feeds the branch, so a bare LDA of the
        // shifted constant would be wrong.
        let lines = vec![
            AssemblyLine::immediate(Opcode::LDA, 0x81),
            AssemblyLine::implied(Opcode::ASL),
            AssemblyLine::relative(Opcode::BCC, ".never"),
            AssemblyLine::label(".never"),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let optimized = superoptimize(&job, "test", lines.clone());
        // Whatever the search found must still set the carry.
        let block_end = optimized
            .iter()
            .position(|line| line.opcode == Opcode::BCC)
            .unwrap();
        let reference = run(&lines[0..2], RegState { a: 0, n: false, z: false, c: false, v: false })
            .unwrap();
        let outcome = run(&optimized[0..block_end], RegState {
            a: 0,
            n: false,
            z: false,
            c: false,
            v: false,
        })
        .unwrap();
        assert_eq!(outcome.c, reference.c);
        assert_eq!(outcome.a, reference.a);
    }
}
