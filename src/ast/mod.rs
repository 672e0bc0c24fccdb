//! The abstract syntax tree handed to the bytecode compiler.
//!
//! Nodes are expression-shaped throughout: blocks, `if`, `while`, `for`,
//! `match`, declarations and jumps are all expressions, some of which
//! simply evaluate to `null`.

use crate::bytecode::instruction::TypeTag;
use crate::span::Span;

/// An expression with the span of its first token.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// A literal constant.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Num(f64),
    Str(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    DivFloor,
    Rem,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    In,
    And,
    Or,
}

/// Prefix operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
    BitNot,
}

/// `let` vs `const`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Const,
}

/// `break` / `continue` / `return`.
#[derive(Debug, Clone, PartialEq)]
pub enum JumpKind {
    Break,
    Continue,
    Return(Option<Box<Expr>>),
}

/// A `match` arm.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub body: Expr,
    pub span: Span,
}

/// Patterns for `match` arms and `let` destructuring.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// `_`
    Wildcard,
    /// A fresh binding.
    Binding(String),
    /// A literal compared with structural equality.
    Literal(Literal),
    /// `(a, _, b)`
    Tuple(Vec<Pattern>),
    /// `[a, b]`
    List(Vec<Pattern>),
    /// `.name` / `.name(inner)`
    Tagged {
        name: String,
        payload: Option<Box<Pattern>>,
    },
    /// `error(inner)` / `error`
    Error(Option<Box<Pattern>>),
}

/// Expression node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Identifier(String),
    /// `(e)`; kept distinct so the formatter can round-trip parentheses.
    Grouped(Box<Expr>),
    /// `{ e; e; ... }`, value of the last expression.
    Block(Vec<Expr>),
    Prefix {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Infix {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `e is ty` / `e as ty`.
    TypeInfix {
        is_cast: bool,
        operand: Box<Expr>,
        ty: TypeTag,
    },
    /// `let`/`const` with an identifier or destructuring pattern target.
    Decl {
        kind: DeclKind,
        pattern: Pattern,
        value: Box<Expr>,
    },
    /// `name = e`, `name op= e`, `c[i] = e`.
    Assign {
        target: Box<Expr>,
        op: Option<BinaryOp>,
        value: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then: Box<Expr>,
        els: Option<Box<Expr>>,
    },
    While {
        cond: Box<Expr>,
        body: Box<Expr>,
    },
    For {
        binding: String,
        iterable: Box<Expr>,
        body: Box<Expr>,
    },
    Jump(JumpKind),
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    /// `lo:hi` / `lo:hi:step`, end-exclusive.
    Range {
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
    },
    /// `_` in expression position (discard target).
    Discard,
    /// `fn(a, b) body`.
    Fn {
        params: Vec<String>,
        body: Box<Expr>,
    },
    /// `f(args...)`.
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    /// `recv.name(args...)`.
    MethodCall {
        recv: Box<Expr>,
        name: String,
        args: Vec<Expr>,
    },
    /// `c[i]`; `or_null` for `c[i]?`.
    Index {
        recv: Box<Expr>,
        index: Box<Expr>,
        or_null: bool,
    },
    /// `error(e)` / `error`.
    ErrorLit(Option<Box<Expr>>),
    /// `.name` / `.name(e)`.
    Tagged {
        name: String,
        payload: Option<Box<Expr>>,
    },
    /// `try e` with optional `catch |name| handler`.
    Try {
        expr: Box<Expr>,
        catch: Option<CatchClause>,
    },
    Import(String),
    /// `@name`: host-native callable.
    Native(String),
    This,
    Match {
        subject: Box<Expr>,
        cases: Vec<MatchCase>,
    },
}

/// The handler half of `try ... catch`.
#[derive(Debug, Clone, PartialEq)]
pub struct CatchClause {
    /// `|name|` binding; `None` when the handler ignores the error.
    pub binding: Option<String>,
    pub handler: Box<Expr>,
}

/// A parsed program: top-level expressions in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Expr>,
}
