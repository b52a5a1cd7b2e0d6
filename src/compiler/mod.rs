//! Lowering from the checked syntax tree to pseudo-assembly.
//!
//! One [`FunctionCompiler`] spans one function. The surrounding
//! [`CompilationContext`] is a value: loop-label maps and the stack
//! offset are cloned, never shared, so nested statements cannot leak
//! their bookkeeping outward.

use std::collections::HashMap;

use log::trace;

use crate::addressing::AddressingMode;
use crate::assembly::AssemblyLine;
use crate::ast::{FunctionDef, Statement};
use crate::constant::Constant;
use crate::env::{Environment, ThingKind, Type};
use crate::opcode::Opcode;
use crate::options::{CpuFeature, JobContext};

mod expr;
mod runtime;
mod stmt;

pub use runtime::runtime_function;

#[derive(Clone)]
pub struct CompilationContext<'a> {
    pub job: &'a JobContext,
    pub env: &'a Environment,
    pub function: &'a FunctionDef,
    /// Bytes pushed on the hardware stack since the frame was set up;
    /// stack-resident locals move by this much.
    pub extra_stack_offset: u8,
    /// Loop label → break target; the empty key is the innermost loop.
    pub break_labels: HashMap<String, String>,
    pub continue_labels: HashMap<String, String>,
    pub never_check_array_bounds: bool,
}

impl<'a> CompilationContext<'a> {
    pub fn new(job: &'a JobContext, env: &'a Environment, function: &'a FunctionDef) -> Self {
        CompilationContext {
            job,
            env,
            function,
            extra_stack_offset: 0,
            break_labels: HashMap::new(),
            continue_labels: HashMap::new(),
            never_check_array_bounds: !job.options.check_array_bounds,
        }
    }

    /// A copy with the innermost (and optionally named) loop targets set.
    pub fn with_loop(&self, label: Option<&str>, break_to: &str, continue_to: &str) -> Self {
        let mut ctx = self.clone();
        ctx.break_labels
            .insert(String::new(), break_to.to_string());
        ctx.continue_labels
            .insert(String::new(), continue_to.to_string());
        if let Some(label) = label {
            ctx.break_labels
                .insert(label.to_string(), break_to.to_string());
            ctx.continue_labels
                .insert(label.to_string(), continue_to.to_string());
        }
        ctx
    }

    pub fn break_label(&self, key: &Option<String>) -> Option<&String> {
        self.break_labels.get(key.as_deref().unwrap_or(""))
    }

    pub fn continue_label(&self, key: &Option<String>) -> Option<&String> {
        self.continue_labels.get(key.as_deref().unwrap_or(""))
    }
}

/// Where a name lives, from this function's point of view.
pub(crate) enum VarAccess {
    /// Directly addressable, with the mode already chosen.
    Direct(AddressingMode, Constant),
    /// A zero-page pointer, reachable through `(zp),Y`.
    Pointer(Constant),
    /// Byte offset into this function's software stack frame.
    Stack(u8),
    /// A constant alias; no storage at all.
    Alias(Constant),
    Unknown,
}

pub(crate) struct FunctionCompiler<'a> {
    pub(crate) ctx: CompilationContext<'a>,
    pub(crate) lines: Vec<AssemblyLine>,
    pub(crate) frame_size: u8,
    /// How many zero-page stash slots are currently claimed.
    pub(crate) stash_depth: u8,
}

/// The storage name of a function's parameter or static local.
pub fn qualified(function: &str, var: &str) -> String {
    format!("{}${}", function, var)
}

/// Compiles one function body into pseudo-assembly.
pub fn compile_function(
    job: &JobContext,
    env: &Environment,
    function: &FunctionDef,
) -> Vec<AssemblyLine> {
    trace!("compiling function {}", function.name);
    let mut compiler = FunctionCompiler {
        ctx: CompilationContext::new(job, env, function),
        lines: Vec::new(),
        frame_size: function.stack_variables_size(),
        stash_depth: 0,
    };
    compiler.emit_prologue();
    for statement in &function.body {
        compiler.compile_statement(statement);
    }
    if !matches!(function.body.last(), Some(Statement::Return(_))) {
        compiler.emit_epilogue(false);
    }
    compiler.lines
}

impl<'a> FunctionCompiler<'a> {
    pub(crate) fn emit(&mut self, line: AssemblyLine) {
        self.lines.push(line);
    }

    pub(crate) fn emit_implied(&mut self, opcode: Opcode) {
        self.emit(AssemblyLine::implied(opcode));
    }

    pub(crate) fn cmos(&self) -> bool {
        self.ctx.job.options.has(CpuFeature::CMOS_OPS)
    }

    fn emit_prologue(&mut self) {
        let function = self.ctx.function;
        self.emit(AssemblyLine::label(&function.name).pinned());

        if function.interrupt {
            self.emit(AssemblyLine::implied(Opcode::PHA).pinned());
            if self.cmos() {
                self.emit(AssemblyLine::implied(Opcode::PHX).pinned());
                self.emit(AssemblyLine::implied(Opcode::PHY).pinned());
            } else {
                self.emit(AssemblyLine::implied(Opcode::TXA).pinned());
                self.emit(AssemblyLine::implied(Opcode::PHA).pinned());
                self.emit(AssemblyLine::implied(Opcode::TYA).pinned());
                self.emit(AssemblyLine::implied(Opcode::PHA).pinned());
            }
            self.emit(AssemblyLine::implied(Opcode::CLD).pinned());
        }

        let frame = self.frame_size;
        if frame > 0 {
            let illegals = self.ctx.job.options.has(CpuFeature::ILLEGALS);
            if illegals && frame > 4 {
                // Arithmetic on the stack pointer beats a run of pushes
                // once the frame passes four bytes.
                self.emit(AssemblyLine::implied(Opcode::TSX).pinned());
                self.emit(AssemblyLine::immediate(Opcode::LDA, 0xff).pinned());
                self.emit(AssemblyLine::immediate(Opcode::SBX, i64::from(frame)).pinned());
                self.emit(AssemblyLine::implied(Opcode::TXS).pinned());
            } else {
                for _ in 0..frame {
                    self.emit(AssemblyLine::implied(Opcode::PHA).pinned());
                }
            }
        }
    }

    /// Frame teardown plus the architectural return. `has_value` keeps A
    /// (the byte return register) alive across the teardown.
    pub(crate) fn emit_epilogue(&mut self, has_value: bool) {
        let function = self.ctx.function;
        if self.frame_size > 0 {
            if has_value {
                self.emit(AssemblyLine::implied(Opcode::TAY).pinned());
            }
            for _ in 0..self.frame_size {
                self.emit(AssemblyLine::implied(Opcode::PLA).pinned());
            }
            if has_value {
                self.emit(AssemblyLine::implied(Opcode::TYA).pinned());
            }
        }
        if function.interrupt {
            if self.cmos() {
                self.emit(AssemblyLine::implied(Opcode::PLY).pinned());
                self.emit(AssemblyLine::implied(Opcode::PLX).pinned());
            } else {
                self.emit(AssemblyLine::implied(Opcode::PLA).pinned());
                self.emit(AssemblyLine::implied(Opcode::TAY).pinned());
                self.emit(AssemblyLine::implied(Opcode::PLA).pinned());
                self.emit(AssemblyLine::implied(Opcode::TAX).pinned());
            }
            self.emit(AssemblyLine::implied(Opcode::PLA).pinned());
            self.emit(AssemblyLine::implied(Opcode::RTI).pinned());
        } else {
            self.emit(AssemblyLine::implied(Opcode::RTS));
        }
    }

    /// Resolves a name against the function's locals and parameters, then
    /// the environment.
    pub(crate) fn resolve(&self, name: &str) -> VarAccess {
        let function = self.ctx.function;
        let mut stack_offset = 0u8;
        for local in &function.locals {
            if local.name == name {
                if local.on_stack {
                    return VarAccess::Stack(stack_offset);
                }
                return self.direct_access(&qualified(&function.name, name));
            }
            if local.on_stack {
                stack_offset += local.ty.size() as u8;
            }
        }
        if function.params.iter().any(|(param, _)| param == name) {
            return self.direct_access(&qualified(&function.name, name));
        }
        match self.ctx.env.get(name).map(|thing| &thing.kind) {
            Some(ThingKind::Variable(Type::Pointer)) if self.ctx.env.is_zero_page(name) => {
                VarAccess::Pointer(Constant::addr(name))
            }
            Some(ThingKind::Variable(_)) | Some(ThingKind::Array { .. }) => {
                self.direct_access(name)
            }
            Some(ThingKind::ConstantAlias(value)) => VarAccess::Alias(value.clone()),
            Some(ThingKind::Function { .. }) | None => VarAccess::Unknown,
        }
    }

    fn direct_access(&self, name: &str) -> VarAccess {
        let mode = if self.ctx.env.is_zero_page(name) {
            AddressingMode::ZeroPage
        } else {
            AddressingMode::Absolute
        };
        VarAccess::Direct(mode, Constant::addr(name))
    }

    /// The declared type of a variable reachable from this function.
    pub(crate) fn var_type(&self, name: &str) -> Type {
        let function = self.ctx.function;
        if let Some(local) = function.locals.iter().find(|local| local.name == name) {
            return local.ty;
        }
        if let Some((_, ty)) = function.params.iter().find(|(param, _)| param == name) {
            return *ty;
        }
        match self.ctx.env.get(name).map(|thing| &thing.kind) {
            Some(ThingKind::Variable(ty)) => *ty,
            _ => Type::Byte,
        }
    }

    /// Absolute,X displacement of a stack local after a `TSX`.
    pub(crate) fn stack_displacement(&self, offset: u8) -> i64 {
        0x0101
            + i64::from(self.ctx.extra_stack_offset)
            + i64::from(self.frame_size - 1 - offset)
    }

    /// Claims a zero-page stash byte. Slots 0 and 1 belong to the runtime
    /// multiply routine, so stashing starts at slot 2.
    pub(crate) fn alloc_stash(&mut self) -> Option<Constant> {
        let slot = 2 + self.stash_depth;
        if slot >= self.ctx.job.options.zp_register_size {
            return None;
        }
        self.stash_depth += 1;
        Some(self.ctx.env.zp_register(slot))
    }

    pub(crate) fn free_stash(&mut self) {
        self.stash_depth -= 1;
    }

    pub(crate) fn codegen_error(&self, message: impl std::fmt::Display) {
        self.ctx.job.diagnostics.error(
            format!("in {}: {}", self.ctx.function.name, message),
            None,
        );
    }
}
