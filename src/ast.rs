//! The checked syntax tree the statement compiler consumes.
//!
//! Parsing and name/type resolution happen upstream; what arrives here is
//! already well-typed. The enums are closed on purpose: lowering is one
//! exhaustive match per node kind.

use crate::assembly::AssemblyLine;
use crate::env::Type;

#[derive(Debug, Clone)]
pub enum Expr {
    Number(i64),
    Variable(String),
    Indexed { array: String, index: Box<Expr> },
    Call(String, Vec<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `hi:lo` byte join into a word.
    Join(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn num(value: i64) -> Expr {
        Expr::Number(value)
    }

    pub fn var(name: &str) -> Expr {
        Expr::Variable(name.to_string())
    }

    pub fn index(array: &str, index: Expr) -> Expr {
        Expr::Indexed {
            array: array.to_string(),
            index: Box::new(index),
        }
    }

    pub fn call(function: &str, args: Vec<Expr>) -> Expr {
        Expr::Call(function.to_string(), args)
    }

    pub fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }
}

/// Binary operators; the `Decimal*` family is the primed (BCD) operators.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    DecimalAdd,
    DecimalSub,
    DecimalMul,
    DecimalShl,
    DecimalShr,
}

/// Unsigned comparisons.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum BoolExpr {
    Cmp(CmpOp, Expr, Expr),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Or(Box<BoolExpr>, Box<BoolExpr>),
    Not(Box<BoolExpr>),
}

impl BoolExpr {
    pub fn cmp(op: CmpOp, lhs: Expr, rhs: Expr) -> BoolExpr {
        BoolExpr::Cmp(op, lhs, rhs)
    }
}

#[derive(Debug, Clone)]
pub enum LValue {
    Variable(String),
    Indexed { array: String, index: Expr },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ForDirection {
    /// Inclusive upper bound.
    To,
    /// Exclusive upper bound.
    Until,
    /// Inclusive lower bound, counting down.
    DownTo,
    /// Like `To`, and the body is data-parallel so iterations may be
    /// reordered.
    ParallelTo,
    /// Like `Until`, reorderable.
    ParallelUntil,
}

#[derive(Debug, Clone)]
pub enum Statement {
    Assign(LValue, Expr),
    CompoundAssign(LValue, BinOp, Expr),
    Expression(Expr),
    If {
        condition: BoolExpr,
        then_branch: Vec<Statement>,
        else_branch: Vec<Statement>,
    },
    While {
        label: Option<String>,
        condition: BoolExpr,
        body: Vec<Statement>,
    },
    DoWhile {
        label: Option<String>,
        body: Vec<Statement>,
        condition: BoolExpr,
    },
    For {
        label: Option<String>,
        variable: String,
        start: Expr,
        direction: ForDirection,
        end: Expr,
        body: Vec<Statement>,
    },
    /// `break`, optionally naming an enclosing labelled loop.
    Break(Option<String>),
    Continue(Option<String>),
    Return(Option<Expr>),
    /// User-written assembly; enters the pipeline pinned.
    InlineAssembly(Vec<AssemblyLine>),
}

/// How the first parameter of an `asm` function travels.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParamConvention {
    /// Through the parameter's own variable (the default).
    ByVariable,
    ByA,
    ByX,
    ByY,
}

#[derive(Debug, Clone)]
pub struct LocalDecl {
    pub name: String,
    pub ty: Type,
    pub on_stack: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<(String, Type)>,
    pub return_type: Option<Type>,
    pub locals: Vec<LocalDecl>,
    pub body: Vec<Statement>,
    pub interrupt: bool,
    /// The ROM already saved registers; only the return differs.
    pub kernal_interrupt: bool,
    pub convention: ParamConvention,
    pub bank: Option<String>,
}

impl FunctionDef {
    pub fn new(name: &str, body: Vec<Statement>) -> FunctionDef {
        FunctionDef {
            name: name.to_string(),
            params: Vec::new(),
            return_type: None,
            locals: Vec::new(),
            body,
            interrupt: false,
            kernal_interrupt: false,
            convention: ParamConvention::ByVariable,
            bank: None,
        }
    }

    pub fn returning(mut self, ty: Type) -> FunctionDef {
        self.return_type = Some(ty);
        self
    }

    pub fn with_params(mut self, params: Vec<(&str, Type)>) -> FunctionDef {
        self.params = params
            .into_iter()
            .map(|(name, ty)| (name.to_string(), ty))
            .collect();
        self
    }

    pub fn with_locals(mut self, locals: Vec<LocalDecl>) -> FunctionDef {
        self.locals = locals;
        self
    }

    pub fn as_interrupt(mut self) -> FunctionDef {
        self.interrupt = true;
        self
    }

    /// Bytes of software stack frame this function needs.
    pub fn stack_variables_size(&self) -> u8 {
        self.locals
            .iter()
            .filter(|local| local.on_stack)
            .map(|local| local.ty.size() as u8)
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct GlobalDecl {
    pub name: String,
    pub ty: Type,
    pub address: Option<u16>,
    pub zero_page: bool,
}

#[derive(Debug, Clone)]
pub struct ArrayDecl {
    pub name: String,
    pub length: Option<u16>,
    pub address: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub variables: Vec<GlobalDecl>,
    pub arrays: Vec<ArrayDecl>,
    pub functions: Vec<FunctionDef>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}
