//! Statement lowering: assignments, control flow, loops.

use crate::addressing::AddressingMode;
use crate::assembly::AssemblyLine;
use crate::ast::{BoolExpr, CmpOp, Expr, ForDirection, LValue, Statement};
use crate::constant::Constant;
use crate::env::Type;
use crate::opcode::Opcode;

use super::{CompilationContext, FunctionCompiler, VarAccess};

fn mirror(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Eq => CmpOp::Eq,
        CmpOp::Ne => CmpOp::Ne,
        CmpOp::Lt => CmpOp::Gt,
        CmpOp::Gt => CmpOp::Lt,
        CmpOp::Le => CmpOp::Ge,
        CmpOp::Ge => CmpOp::Le,
    }
}

fn negate(op: CmpOp) -> CmpOp {
    match op {
        CmpOp::Eq => CmpOp::Ne,
        CmpOp::Ne => CmpOp::Eq,
        CmpOp::Lt => CmpOp::Ge,
        CmpOp::Ge => CmpOp::Lt,
        CmpOp::Gt => CmpOp::Le,
        CmpOp::Le => CmpOp::Gt,
    }
}

impl<'a> FunctionCompiler<'a> {
    pub(crate) fn compile_statement(&mut self, statement: &Statement) {
        match statement {
            Statement::Assign(target, value) => self.compile_assign(target, value),
            Statement::CompoundAssign(target, op, rhs) => {
                let current = match target {
                    LValue::Variable(name) => Expr::Variable(name.clone()),
                    LValue::Indexed { array, index } => Expr::Indexed {
                        array: array.clone(),
                        index: Box::new(index.clone()),
                    },
                };
                let value = Expr::Binary(*op, Box::new(current), Box::new(rhs.clone()));
                self.compile_assign(target, &value);
            }
            Statement::Expression(expr) => self.compile_expr_to_a(expr),
            Statement::If {
                condition,
                then_branch,
                else_branch,
            } => self.compile_if(condition, then_branch, else_branch),
            Statement::While {
                label,
                condition,
                body,
            } => self.compile_while(label.as_deref(), condition, body),
            Statement::DoWhile {
                label,
                body,
                condition,
            } => self.compile_do_while(label.as_deref(), body, condition),
            Statement::For {
                label,
                variable,
                start,
                direction,
                end,
                body,
            } => self.compile_for(label.as_deref(), variable, start, *direction, end, body),
            Statement::Break(key) => {
                let target = self.ctx.break_label(key).cloned();
                match target {
                    Some(target) => self.emit_jump(&target),
                    None => self.codegen_error("`break` outside of a matching loop"),
                }
            }
            Statement::Continue(key) => {
                let target = self.ctx.continue_label(key).cloned();
                match target {
                    Some(target) => self.emit_jump(&target),
                    None => self.codegen_error("`continue` outside of a matching loop"),
                }
            }
            Statement::Return(value) => {
                match value {
                    Some(expr) => {
                        if matches!(
                            self.ctx.function.return_type,
                            Some(Type::Word) | Some(Type::Pointer)
                        ) {
                            self.compile_expr_to_ax(expr);
                        } else {
                            self.compile_expr_to_a(expr);
                        }
                        self.emit_epilogue(true);
                    }
                    None => self.emit_epilogue(false),
                }
            }
            Statement::InlineAssembly(lines) => {
                for line in lines {
                    self.emit(line.clone().pinned());
                }
            }
        }
    }

    /// `JMP`, or the shorter `BRA` where the target CPU has it. The
    /// assembler turns an out-of-range `BRA` back into a `JMP`.
    pub(crate) fn emit_jump(&mut self, label: &str) {
        if self.cmos() {
            self.emit(AssemblyLine::relative(Opcode::BRA, label));
        } else {
            self.emit(AssemblyLine::absolute(Opcode::JMP, Constant::addr(label)));
        }
    }

    fn in_ctx(&mut self, ctx: CompilationContext<'a>, f: impl FnOnce(&mut Self)) {
        let saved = std::mem::replace(&mut self.ctx, ctx);
        f(self);
        self.ctx = saved;
    }

    fn compile_assign(&mut self, target: &LValue, value: &Expr) {
        match target {
            LValue::Variable(name) => {
                if self.var_type(name) == Type::Byte {
                    self.compile_expr_to_a(value);
                    self.store_a_in(name);
                } else {
                    self.compile_expr_to_ax(value);
                    self.store_ax_in(name);
                }
            }
            LValue::Indexed { array, index } => self.compile_indexed_store(array, index, value),
        }
    }

    fn store_a_in(&mut self, name: &str) {
        match self.resolve(name) {
            VarAccess::Direct(mode, operand) => {
                self.emit(AssemblyLine::new(Opcode::STA, mode, operand));
            }
            VarAccess::Pointer(operand) => {
                self.emit(AssemblyLine::new(Opcode::STA, AddressingMode::ZeroPage, operand));
            }
            VarAccess::Stack(offset) => {
                let displacement = self.stack_displacement(offset);
                self.emit_implied(Opcode::TSX);
                self.emit(AssemblyLine::absolute_x(Opcode::STA, Constant::num(displacement)));
            }
            VarAccess::Alias(_) | VarAccess::Unknown => {
                self.codegen_error(format!("cannot assign to `{}`", name));
            }
        }
    }

    fn store_ax_in(&mut self, name: &str) {
        match self.resolve(name) {
            VarAccess::Direct(mode, operand) => {
                self.emit(AssemblyLine::new(Opcode::STA, mode, operand.clone()));
                self.emit(AssemblyLine::new(Opcode::STX, mode, operand + 1));
            }
            VarAccess::Pointer(operand) => {
                self.emit(AssemblyLine::new(
                    Opcode::STA,
                    AddressingMode::ZeroPage,
                    operand.clone(),
                ));
                self.emit(AssemblyLine::new(
                    Opcode::STX,
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
                self.emit(AssemblyLine::zero_page(Opcode::STX, stash.clone()));
                self.emit_implied(Opcode::TSX);
                self.emit(AssemblyLine::absolute_x(Opcode::STA, Constant::num(lo)));
                self.emit(AssemblyLine::zero_page(Opcode::LDA, stash));
                self.emit(AssemblyLine::absolute_x(Opcode::STA, Constant::num(hi)));
                self.free_stash();
            }
            VarAccess::Alias(_) | VarAccess::Unknown => {
                self.codegen_error(format!("cannot assign to `{}`", name));
            }
        }
    }

    fn compile_indexed_store(&mut self, array: &str, index: &Expr, value: &Expr) {
        if let Some(offset) = self.const_eval(index) {
            match self.resolve(array) {
                VarAccess::Direct(mode, operand) => {
                    self.check_constant_index(array, offset);
                    self.compile_expr_to_a(value);
                    self.emit(AssemblyLine::new(Opcode::STA, mode, operand + offset));
                    return;
                }
                VarAccess::Pointer(pointer) => {
                    self.compile_expr_to_a(value);
                    self.emit(AssemblyLine::immediate(Opcode::LDY, offset & 0xff));
                    self.emit(AssemblyLine::indexed_y(Opcode::STA, pointer));
                    return;
                }
                _ => {
                    self.codegen_error(format!("unknown array `{}`", array));
                    return;
                }
            }
        }

        let simple_index = match index {
            Expr::Variable(name) => {
                matches!(self.resolve(name), VarAccess::Direct(_, _))
            }
            _ => false,
        };
        if simple_index {
            self.compile_expr_to_a(value);
            if let Expr::Variable(name) = index {
                if let VarAccess::Direct(mode, operand) = self.resolve(name) {
                    self.emit(AssemblyLine::new(Opcode::LDY, mode, operand));
                }
            }
        } else {
            // The index is computed first and parked on the stack while
            // the value takes A.
            self.compile_expr_to_a(index);
            self.emit_implied(Opcode::PHA);
            self.ctx.extra_stack_offset += 1;
            self.compile_expr_to_a(value);
            self.emit_implied(Opcode::TAX);
            self.emit_implied(Opcode::PLA);
            self.ctx.extra_stack_offset -= 1;
            self.emit_implied(Opcode::TAY);
            self.emit_implied(Opcode::TXA);
        }
        self.emit_bounds_check(array);
        match self.resolve(array) {
            VarAccess::Direct(_, operand) => {
                self.emit(AssemblyLine::absolute_y(Opcode::STA, operand));
            }
            VarAccess::Pointer(pointer) => {
                self.emit(AssemblyLine::indexed_y(Opcode::STA, pointer));
            }
            _ => self.codegen_error(format!("unknown array `{}`", array)),
        }
    }

    /// Emits code that jumps to `target` when the condition's truth
    /// equals `branch_when`, and falls through otherwise.
    fn compile_condition(&mut self, condition: &BoolExpr, target: &str, branch_when: bool) {
        match condition {
            BoolExpr::Not(inner) => self.compile_condition(inner, target, !branch_when),
            BoolExpr::And(a, b) => {
                if branch_when {
                    let skip = self.ctx.job.labels.next("cc");
                    self.compile_condition(a, &skip, false);
                    self.compile_condition(b, target, true);
                    self.emit(AssemblyLine::label(skip));
                } else {
                    self.compile_condition(a, target, false);
                    self.compile_condition(b, target, false);
                }
            }
            BoolExpr::Or(a, b) => {
                if branch_when {
                    self.compile_condition(a, target, true);
                    self.compile_condition(b, target, true);
                } else {
                    let skip = self.ctx.job.labels.next("cc");
                    self.compile_condition(a, &skip, true);
                    self.compile_condition(b, target, false);
                    self.emit(AssemblyLine::label(skip));
                }
            }
            BoolExpr::Cmp(op, lhs, rhs) => {
                let swapped = self.compile_compare(lhs, rhs);
                let op = if swapped { mirror(*op) } else { *op };
                self.emit_comparison_branch(op, target, branch_when);
            }
        }
    }

    fn emit_comparison_branch(&mut self, op: CmpOp, target: &str, branch_when: bool) {
        let effective = if branch_when { op } else { negate(op) };
        match effective {
            CmpOp::Eq => self.emit(AssemblyLine::relative(Opcode::BEQ, target)),
            CmpOp::Ne => self.emit(AssemblyLine::relative(Opcode::BNE, target)),
            CmpOp::Lt => self.emit(AssemblyLine::relative(Opcode::BCC, target)),
            CmpOp::Ge => self.emit(AssemblyLine::relative(Opcode::BCS, target)),
            CmpOp::Gt => {
                let skip = self.ctx.job.labels.next("cc");
                self.emit(AssemblyLine::relative(Opcode::BEQ, skip.clone()));
                self.emit(AssemblyLine::relative(Opcode::BCS, target));
                self.emit(AssemblyLine::label(skip));
            }
            CmpOp::Le => {
                self.emit(AssemblyLine::relative(Opcode::BCC, target));
                self.emit(AssemblyLine::relative(Opcode::BEQ, target));
            }
        }
    }

    fn compile_if(
        &mut self,
        condition: &BoolExpr,
        then_branch: &[Statement],
        else_branch: &[Statement],
    ) {
        if else_branch.is_empty() {
            let end = self.ctx.job.labels.next("if");
            self.compile_condition(condition, &end, false);
            for statement in then_branch {
                self.compile_statement(statement);
            }
            self.emit(AssemblyLine::label(end));
        } else {
            let else_label = self.ctx.job.labels.next("el");
            let end = self.ctx.job.labels.next("if");
            self.compile_condition(condition, &else_label, false);
            for statement in then_branch {
                self.compile_statement(statement);
            }
            self.emit_jump(&end);
            self.emit(AssemblyLine::label(else_label));
            for statement in else_branch {
                self.compile_statement(statement);
            }
            self.emit(AssemblyLine::label(end));
        }
    }

    fn compile_while(&mut self, label: Option<&str>, condition: &BoolExpr, body: &[Statement]) {
        let start = self.ctx.job.labels.next("wh");
        let end = self.ctx.job.labels.next("wh");
        self.emit(AssemblyLine::label(start.clone()));
        self.compile_condition(condition, &end, false);
        let ctx = self.ctx.with_loop(label, &end, &start);
        self.in_ctx(ctx, |compiler| {
            for statement in body {
                compiler.compile_statement(statement);
            }
        });
        self.emit_jump(&start);
        self.emit(AssemblyLine::label(end));
    }

    fn compile_do_while(&mut self, label: Option<&str>, body: &[Statement], condition: &BoolExpr) {
        let start = self.ctx.job.labels.next("do");
        let test = self.ctx.job.labels.next("do");
        let end = self.ctx.job.labels.next("do");
        self.emit(AssemblyLine::label(start.clone()));
        let ctx = self.ctx.with_loop(label, &end, &test);
        self.in_ctx(ctx, |compiler| {
            for statement in body {
                compiler.compile_statement(statement);
            }
        });
        self.emit(AssemblyLine::label(test));
        self.compile_condition(condition, &start, true);
        self.emit(AssemblyLine::label(end));
    }

    fn compile_for(
        &mut self,
        label: Option<&str>,
        variable: &str,
        start: &Expr,
        direction: ForDirection,
        end: &Expr,
        body: &[Statement],
    ) {
        self.compile_assign(&LValue::Variable(variable.to_string()), start);
        let VarAccess::Direct(mode, operand) = self.resolve(variable) else {
            self.codegen_error("for-loop counters need static storage");
            return;
        };
        let loop_label = self.ctx.job.labels.next("fo");
        let incr_label = self.ctx.job.labels.next("fo");
        let end_label = self.ctx.job.labels.next("fo");
        let counter = Expr::Variable(variable.to_string());

        // The `parallel` directions promise a data-parallel body; running
        // them in sequential order is one of the permitted orders.
        match direction {
            ForDirection::To | ForDirection::ParallelTo => {
                self.emit(AssemblyLine::label(loop_label.clone()));
                let ctx = self.ctx.with_loop(label, &end_label, &incr_label);
                self.in_ctx(ctx, |compiler| {
                    for statement in body {
                        compiler.compile_statement(statement);
                    }
                });
                self.emit(AssemblyLine::label(incr_label));
                self.compile_compare(&counter, end);
                self.emit(AssemblyLine::relative(Opcode::BEQ, end_label.clone()));
                self.emit(AssemblyLine::new(Opcode::INC, mode, operand));
                self.emit_jump(&loop_label);
                self.emit(AssemblyLine::label(end_label));
            }
            ForDirection::Until | ForDirection::ParallelUntil => {
                self.emit(AssemblyLine::label(loop_label.clone()));
                let swapped = self.compile_compare(&counter, end);
                let op = if swapped { CmpOp::Le } else { CmpOp::Ge };
                self.emit_comparison_branch(op, &end_label, true);
                let ctx = self.ctx.with_loop(label, &end_label, &incr_label);
                self.in_ctx(ctx, |compiler| {
                    for statement in body {
                        compiler.compile_statement(statement);
                    }
                });
                self.emit(AssemblyLine::label(incr_label));
                self.emit(AssemblyLine::new(Opcode::INC, mode, operand));
                self.emit_jump(&loop_label);
                self.emit(AssemblyLine::label(end_label));
            }
            ForDirection::DownTo => {
                self.emit(AssemblyLine::label(loop_label.clone()));
                let ctx = self.ctx.with_loop(label, &end_label, &incr_label);
                self.in_ctx(ctx, |compiler| {
                    for statement in body {
                        compiler.compile_statement(statement);
                    }
                });
                self.emit(AssemblyLine::label(incr_label));
                self.compile_compare(&counter, end);
                self.emit(AssemblyLine::relative(Opcode::BEQ, end_label.clone()));
                self.emit(AssemblyLine::new(Opcode::DEC, mode, operand));
                self.emit_jump(&loop_label);
                self.emit(AssemblyLine::label(end_label));
            }
        }
    }
}
