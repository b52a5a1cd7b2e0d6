//! An ahead-of-time compiler core for the MOS 6502 family.
//!
//! The pipeline: a checked syntax tree is lowered per function into flat
//! pseudo-assembly, a dataflow-informed peephole optimizer rewrites it
//! to a fixpoint, and the assembler lays the survivors out into banks
//! and emits bytes plus a label listing. A reference simulator doubles
//! as the semantic oracle in the test suite.

use log::{debug, info};

pub use crate::asm::{format_label_file, parse_label_file, AssemblerOutput};
pub use crate::assembly::{AssemblyLine, Position};
pub use crate::ast::{
    ArrayDecl, BinOp, BoolExpr, CmpOp, Expr, ForDirection, FunctionDef, GlobalDecl, LValue,
    LocalDecl, ParamConvention, Program, Statement,
};
pub use crate::constant::{Constant, ConstantOp};
pub use crate::diag::CompileError;
pub use crate::env::{Environment, Type};
pub use crate::opcode::Opcode;
pub use crate::options::{
    CompilationOptions, CpuFamily, CpuFeature, JobContext, OptimizationMetric,
};
pub use crate::platform::{Bank, Platform};
pub use crate::sim::Simulator;

pub mod addressing;
pub mod asm;
pub mod assembly;
pub mod ast;
pub mod compiler;
pub mod constant;
pub mod dataflow;
pub mod diag;
pub mod env;
pub mod literal;
pub mod opcode;
pub mod opt;
pub mod options;
pub mod platform;
pub mod sim;

use crate::assembly::sequence_bytes;
use crate::compiler::{compile_function, qualified, runtime_function};

/// One compilation job: a program, a platform, a set of options.
pub struct Compiler {
    platform: Platform,
    options: CompilationOptions,
}

impl Compiler {
    pub fn new(platform: Platform, options: CompilationOptions) -> Compiler {
        Compiler { platform, options }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Runs the whole pipeline and returns the assembled image.
    pub fn compile(&self, program: &Program) -> Result<AssemblerOutput, CompileError> {
        let job = JobContext::new(self.options.clone());
        let env = self.build_environment(program, &job)?;

        // Lowering.
        let mut compiled: Vec<(String, Vec<AssemblyLine>)> = program
            .functions
            .iter()
            .map(|function| {
                (
                    function.name.clone(),
                    compile_function(&job, &env, function),
                )
            })
            .collect();
        job.diagnostics.assert_no_errors("codegen")?;

        // Runtime routines the lowering asked for.
        let mut env = env;
        for routine in job.runtime_routines() {
            env.declare_function(
                routine.name(),
                false,
                Vec::new(),
                ParamConvention::ByVariable,
            );
            compiled.push((routine.name().to_string(), runtime_function(routine, &env)));
        }

        // Per-function optimization, fanned out over scoped workers.
        let unoptimized_size: u32 = compiled
            .iter()
            .map(|(_, lines)| sequence_bytes(lines))
            .sum();
        let sets = opt::rule_sets(&job.options);
        let optimize_one = |name: String, lines: Vec<AssemblyLine>| {
            let mut lines = if job.options.optimization_level >= 1 {
                opt::optimize_function(&job, &name, lines, &sets)
            } else {
                lines
            };
            if job.options.optimization_level >= 9 {
                lines = opt::superoptimize(&job, &name, lines);
            }
            (name, lines)
        };
        let optimized: Vec<(String, Vec<AssemblyLine>)> =
            if job.options.single_threaded || compiled.len() <= 1 {
                compiled
                    .into_iter()
                    .map(|(name, lines)| optimize_one(name, lines))
                    .collect()
            } else {
                std::thread::scope(|scope| {
                    let workers: Vec<_> = compiled
                        .into_iter()
                        .map(|(name, lines)| scope.spawn(|| optimize_one(name, lines)))
                        .collect();
                    workers
                        .into_iter()
                        .map(|worker| worker.join().expect("optimization worker panicked"))
                        .collect()
                })
            };
        job.diagnostics.assert_no_errors("optimization")?;
        let optimized_size: u32 = optimized
            .iter()
            .map(|(_, lines)| sequence_bytes(lines))
            .sum();
        info!(
            "optimization: {} -> {} byte(s) at -O{}",
            unoptimized_size, optimized_size, job.options.optimization_level
        );

        // Reachability: dead functions emit nothing.
        let kept = reachable_functions(optimized, program);

        let output = asm::assemble(&job, kept, &env, &self.platform)?;
        job.diagnostics.assert_no_errors("link")?;
        Ok(output)
    }

    fn build_environment(
        &self,
        program: &Program,
        job: &JobContext,
    ) -> Result<Environment, CompileError> {
        let mut env = Environment::new(
            self.platform.zp_free_start,
            self.platform.ram_start,
            job.options.zp_register_size,
            self.platform.default_bank(),
        );
        for variable in &program.variables {
            match variable.address {
                Some(address) => env.declare_variable_at(&variable.name, variable.ty, address),
                None => env.declare_variable(&variable.name, variable.ty, variable.zero_page),
            }
        }
        for array in &program.arrays {
            env.declare_array(&array.name, array.length, array.address);
        }
        for function in &program.functions {
            env.declare_function(
                &function.name,
                function.interrupt,
                function
                    .params
                    .iter()
                    .map(|(name, _)| name.clone())
                    .collect(),
                function.convention,
            );
            for (param, ty) in &function.params {
                env.declare_variable(&qualified(&function.name, param), *ty, true);
            }
            for local in &function.locals {
                if !local.on_stack {
                    env.declare_variable(&qualified(&function.name, &local.name), local.ty, true);
                }
            }
        }
        job.diagnostics.assert_no_errors("environment")?;
        Ok(env)
    }
}

/// Keeps `main`, interrupt handlers, and everything transitively
/// referenced from those; the rest never reaches the assembler.
fn reachable_functions(
    compiled: Vec<(String, Vec<AssemblyLine>)>,
    program: &Program,
) -> Vec<(String, Vec<AssemblyLine>)> {
    use std::collections::{BTreeSet, VecDeque};

    let defined: BTreeSet<String> = compiled.iter().map(|(name, _)| name.clone()).collect();
    let mut roots: Vec<String> = program
        .functions
        .iter()
        .filter(|function| {
            function.name == "main" || function.interrupt || function.kernal_interrupt
        })
        .map(|function| function.name.clone())
        .collect();
    // A library without an entry point keeps everything.
    if roots.is_empty() {
        return compiled;
    }
    // Runtime routines are only reachable through calls, so they need no
    // special casing here.

    let mut alive: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<String> = roots.drain(..).collect();
    while let Some(name) = queue.pop_front() {
        if !alive.insert(name.clone()) {
            continue;
        }
        let Some((_, lines)) = compiled.iter().find(|(n, _)| *n == name) else {
            continue;
        };
        for line in lines {
            let mut symbols = Vec::new();
            line.operand.collect_symbols(&mut symbols);
            for symbol in symbols {
                if defined.contains(symbol) && !alive.contains(symbol) {
                    queue.push_back(symbol.to_string());
                }
            }
        }
    }

    let mut kept = Vec::new();
    for (name, lines) in compiled {
        if alive.contains(&name) {
            kept.push((name, lines));
        } else {
            debug!("dropping unreachable function {}", name);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_functions_emit_no_bytes() {
        let program = Program {
            variables: Vec::new(),
            arrays: vec![ArrayDecl {
                name: "output".to_string(),
                length: Some(256),
                address: Some(0xc000),
            }],
            functions: vec![
                FunctionDef::new(
                    "main",
                    vec![Statement::Assign(
                        LValue::Variable("output".to_string()),
                        Expr::num(1),
                    )],
                ),
                FunctionDef::new(
                    "orphan",
                    vec![Statement::Assign(
                        LValue::Variable("output".to_string()),
                        Expr::num(2),
                    )],
                ),
            ],
        };
        let compiler = Compiler::new(Platform::simulator(), CompilationOptions::default());
        let output = compiler.compile(&program).unwrap();
        assert!(output.labels.iter().any(|(name, _)| name == "main"));
        assert!(!output.labels.iter().any(|(name, _)| name == "orphan"));
    }

    #[test]
    fn size_does_not_grow_as_the_level_rises() {
        let program = Program {
            variables: vec![GlobalDecl {
                name: "a".to_string(),
                ty: Type::Byte,
                address: None,
                zero_page: true,
            }],
            arrays: vec![ArrayDecl {
                name: "output".to_string(),
                length: Some(256),
                address: Some(0xc000),
            }],
            functions: vec![FunctionDef::new(
                "main",
                vec![
                    Statement::Assign(LValue::Variable("a".to_string()), Expr::num(1)),
                    Statement::Assign(
                        LValue::Variable("output".to_string()),
                        Expr::binary(BinOp::Add, Expr::var("a"), Expr::var("a")),
                    ),
                ],
            )],
        };
        let mut previous = u32::MAX;
        for level in 0..=3 {
            let compiler = Compiler::new(
                Platform::simulator(),
                CompilationOptions::default().with_level(level),
            );
            let output = compiler.compile(&program).unwrap();
            let size: u32 = output.code.values().map(|bytes| bytes.len() as u32).sum();
            assert!(
                size <= previous,
                "-O{} grew the output: {} > {}",
                level,
                size,
                previous
            );
            previous = size;
        }
    }
}
