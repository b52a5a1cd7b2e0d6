//! The peephole optimization engine.
//!
//! Scans left to right, applies the first rule whose window, operands and
//! dataflow preconditions all hold, then backs up a few lines so newly
//! created juxtapositions get another look. Sweeps repeat until nothing
//! changes or the level's iteration budget runs out.

use std::collections::HashSet;

use log::debug;

use crate::assembly::{sequence_bytes, sequence_cycles, AssemblyLine};
use crate::dataflow::{analyze, analyze_liveness};
use crate::options::{CompilationOptions, CpuFeature, JobContext, OptimizationMetric};

mod pattern;
mod presets;
mod superopt;

pub use pattern::{
    AssemblyRule, AssemblyRuleSet, Flag, LineMatcher, ModeSpec, NewLine, OpcodeSpec,
    OperandMatcher, OperandSpec, Precondition, Slot,
};
pub use superopt::superoptimize;

/// After a rewrite, rescanning starts this many lines earlier.
const RESTART_WINDOW: usize = 8;

fn sweep_budget(level: u8) -> usize {
    match level {
        0 => 0,
        1 => 2,
        2 | 3 => 8,
        _ => 16,
    }
}

fn cost(lines: &[AssemblyLine], metric: OptimizationMetric) -> u32 {
    match metric {
        OptimizationMetric::Size => sequence_bytes(lines),
        OptimizationMetric::Speed | OptimizationMetric::ExtremeSpeed => sequence_cycles(lines),
    }
}

/// The rule sets active for the given options, in application order. At
/// `-O2` and up the good set sandwiches the assembly-level set
/// (good·ass·good) so neither starves the other of opportunities.
pub fn rule_sets(options: &CompilationOptions) -> Vec<AssemblyRuleSet> {
    let level = options.optimization_level;
    let mut sets = Vec::new();
    if level >= 1 {
        sets.push(presets::quick_preset());
    }
    if level >= 2 {
        sets.push(presets::good_rules());
        sets.push(presets::ass_opt());
        sets.push(presets::good_rules());
        sets.push(presets::later_optimizations());
        if options.has(CpuFeature::CMOS_OPS) {
            sets.push(presets::cmos_optimizations());
        }
        if options.has(CpuFeature::CE02_OPS) {
            sets.push(presets::ce02_optimizations());
        }
        if options.has(CpuFeature::HUC6280_OPS) {
            sets.push(presets::hudson_optimizations());
        }
        if options.has(CpuFeature::EMULATION_65816) {
            sets.push(presets::sixteen_optimizations());
        }
        if options.has(CpuFeature::ILLEGALS) {
            sets.push(presets::undocumented_optimizations());
        }
        if options.zp_register_size > 0 {
            sets.push(presets::zeropage_register_optimizations());
        }
    }
    if level >= 4 {
        sets.push(presets::dangerous_optimizations());
    }
    sets
}

/// Optimizes one function's line list to a fixpoint (or the budget).
pub fn optimize_function(
    job: &JobContext,
    function_name: &str,
    mut lines: Vec<AssemblyLine>,
    sets: &[AssemblyRuleSet],
) -> Vec<AssemblyLine> {
    let metric = job.options.metric;
    for _ in 0..sweep_budget(job.options.optimization_level) {
        let mut changed = false;
        let mut states = analyze(&lines);
        let mut liveness = analyze_liveness(&lines);
        let mut index = 0;
        while index < lines.len() {
            let mut applied = false;
            'rules: for set in sets {
                for rule in &set.rules {
                    let Some(slots) = pattern::match_window(rule, &lines, index) else {
                        continue;
                    };
                    if !pattern::check_preconditions(rule, index, &slots, &states, &liveness) {
                        continue;
                    }
                    let Some(replacement) =
                        pattern::build_replacement(rule, &lines, index, &slots)
                    else {
                        continue;
                    };
                    if let Some(bad) = replacement.iter().find(|line| {
                        !crate::addressing::legal_modes(line.opcode).contains(&line.mode)
                    }) {
                        job.diagnostics.error(
                            format!(
                                "optimization rule `{}` produced illegal {} / {:?}",
                                rule.name, bad.opcode, bad.mode
                            ),
                            None,
                        );
                        continue;
                    }
                    let window = index..index + rule.window.len();
                    if cost(&replacement, metric) > cost(&lines[window.clone()], metric) {
                        continue;
                    }
                    debug!(
                        "{}: {} applied `{}` at line {}",
                        function_name, set.name, rule.name, index
                    );
                    lines.splice(window, replacement);
                    states = analyze(&lines);
                    liveness = analyze_liveness(&lines);
                    index = index.saturating_sub(RESTART_WINDOW);
                    changed = true;
                    applied = true;
                    break 'rules;
                }
            }
            if !applied {
                index += 1;
            }
        }
        if !changed {
            break;
        }
    }
    remove_unused_labels(lines)
}

/// Deletes `LABEL` lines for local labels (leading `.`) that nothing
/// references. Global labels are linker-visible and always stay.
pub fn remove_unused_labels(lines: Vec<AssemblyLine>) -> Vec<AssemblyLine> {
    let mut referenced: HashSet<String> = HashSet::new();
    for line in &lines {
        if line.is_label() {
            continue;
        }
        let mut symbols = Vec::new();
        line.operand.collect_symbols(&mut symbols);
        for symbol in symbols {
            referenced.insert(symbol.to_string());
        }
    }
    lines
        .into_iter()
        .filter(|line| match (line.is_label(), line.label_name()) {
            (true, Some(name)) => !name.starts_with('.') || referenced.contains(name),
            _ => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::constant::Constant;
    use crate::opcode::Opcode;
    use crate::options::CompilationOptions;

    use super::*;

    fn job_at_level(level: u8) -> JobContext {
        JobContext::new(CompilationOptions::default().with_level(level))
    }

    #[test]
    fn store_then_reload_drops_the_load() {
        let job = job_at_level(2);
        let sets = rule_sets(&job.options);
        let lines = vec![
            AssemblyLine::immediate(Opcode::LDA, 7),
            AssemblyLine::absolute(Opcode::STA, Constant::addr("x")),
            AssemblyLine::absolute(Opcode::LDA, Constant::addr("x")),
            AssemblyLine::absolute(Opcode::STA, Constant::addr("y")),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let optimized = optimize_function(&job, "test", lines, &sets);
        let loads = optimized
            .iter()
            .filter(|line| line.opcode == Opcode::LDA)
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn constant_addition_folds_to_one_load() {
        let job = job_at_level(2);
        let sets = rule_sets(&job.options);
        let lines = vec![
            AssemblyLine::immediate(Opcode::LDA, 40),
            AssemblyLine::implied(Opcode::CLC),
            AssemblyLine::immediate(Opcode::ADC, 2),
            AssemblyLine::absolute(Opcode::STA, Constant::addr("out")),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let optimized = optimize_function(&job, "test", lines, &sets);
        assert!(optimized
            .iter()
            .any(|line| line.opcode == Opcode::LDA && line.operand.eval() == Some(42)));
        assert!(!optimized.iter().any(|line| line.opcode == Opcode::ADC));
    }

    #[test]
    fn tail_calls_become_jumps() {
        let job = job_at_level(2);
        let sets = rule_sets(&job.options);
        let lines = vec![
            AssemblyLine::absolute(Opcode::JSR, Constant::addr("helper")),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let optimized = optimize_function(&job, "test", lines, &sets);
        assert_eq!(optimized.len(), 1);
        assert_eq!(optimized[0].opcode, Opcode::JMP);
    }

    #[test]
    fn pinned_inline_assembly_survives_verbatim() {
        let job = job_at_level(3);
        let sets = rule_sets(&job.options);
        let lines = vec![
            AssemblyLine::absolute(Opcode::JSR, Constant::addr("helper")).pinned(),
            AssemblyLine::implied(Opcode::RTS).pinned(),
        ];
        let optimized = optimize_function(&job, "test", lines.clone(), &sets);
        assert_eq!(optimized, lines);
    }

    #[test]
    fn rules_producing_illegal_instructions_are_reported_and_skipped() {
        use crate::addressing::AddressingMode;
        use crate::opt::pattern::{LineMatcher, NewLine, OperandSpec};

        let job = job_at_level(2);
        let bogus = AssemblyRuleSet {
            name: "Bogus",
            rules: vec![AssemblyRule {
                name: "store-immediate",
                window: vec![LineMatcher::op(&[Opcode::LDA]).bind(0)],
                preconditions: vec![],
                replacement: vec![NewLine::fixed(
                    Opcode::STA,
                    AddressingMode::Immediate,
                    OperandSpec::Slot(0),
                )],
            }],
        };
        let lines = vec![
            AssemblyLine::immediate(Opcode::LDA, 5),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let optimized = optimize_function(&job, "test", lines.clone(), &[bogus]);
        assert_eq!(optimized, lines);
        assert!(job.diagnostics.error_count() > 0);
    }

    #[test]
    fn unreferenced_local_labels_disappear() {
        let lines = vec![
            AssemblyLine::label("entry").pinned(),
            AssemblyLine::label(".used"),
            AssemblyLine::relative(Opcode::BNE, ".used"),
            AssemblyLine::label(".orphan"),
            AssemblyLine::implied(Opcode::RTS),
        ];
        let cleaned = remove_unused_labels(lines);
        assert!(cleaned.iter().any(|l| l.label_name() == Some("entry")));
        assert!(cleaned.iter().any(|l| l.label_name() == Some(".used")));
        assert!(!cleaned.iter().any(|l| l.label_name() == Some(".orphan")));
    }
}
