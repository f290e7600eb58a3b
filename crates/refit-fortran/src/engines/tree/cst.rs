//! Concrete syntax tree of the tree engine.
//!
//! Statements come straight from the grammar; constructs wrap them the way
//! the standard's syntax rules do (`specification-part`, `execution-part`,
//! `do-construct` with its `loop-control`, `if-construct` with a chained
//! `else` part).

use refit_core::ir::{BinaryOp, Intent, TypeSpec, UnaryOp, UseItem};
use refit_core::types::Span;

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    IntLiteral(String),
    RealLiteral(String),
    CharLiteral(String),
    LogicalLiteral(String),
    /// Assumed-size extent `*`.
    Star,
    Name(String),
    /// `name(section-subscript-list)` or a function reference.
    Reference { name: String, args: Vec<Expr> },
    Triplet {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        stride: Option<Box<Expr>>,
    },
    Keyword { name: String, value: Box<Expr> },
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Parens(Box<Expr>),
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclAttr {
    Intent(Intent),
    Dimension(Vec<Expr>),
    /// Any other attribute spec, as written.
    Spec(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initialization {
    Value(Expr),
    Target(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDecl {
    pub name: String,
    pub array_spec: Option<Vec<Expr>>,
    pub init: Option<Initialization>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopControl {
    Counted {
        variable: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
    },
    While(Expr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    ModuleStmt {
        name: String,
    },
    ProgramStmt {
        name: String,
    },
    SubroutineStmt {
        prefixes: Vec<String>,
        name: String,
        dummies: Vec<String>,
    },
    FunctionStmt {
        prefixes: Vec<String>,
        type_spec: Option<TypeSpec>,
        name: String,
        dummies: Vec<String>,
        result: Option<String>,
    },
    ContainsStmt,
    /// `keyword` is lowercase, empty for a bare `end`.
    EndStmt {
        keyword: String,
    },
    UseStmt {
        intrinsic: bool,
        module: String,
        only: Option<Vec<UseItem>>,
    },
    ImplicitStmt {
        spec: String,
    },
    IncludeLine {
        path: String,
    },
    TypeDeclarationStmt {
        type_spec: TypeSpec,
        attrs: Vec<DeclAttr>,
        entities: Vec<EntityDecl>,
    },
    AssignmentStmt {
        target: Expr,
        value: Expr,
    },
    PointerAssignmentStmt {
        target: Expr,
        value: Expr,
    },
    CallStmt {
        name: String,
        args: Vec<Expr>,
    },
    DoStmt {
        control: Option<LoopControl>,
    },
    IfThenStmt {
        condition: Expr,
    },
    ElseIfStmt {
        condition: Expr,
    },
    ElseStmt,
    /// `if (cond) action`; the action is parsed separately.
    IfStmt {
        condition: Expr,
        action: String,
    },
    BlockStmt,
    ReturnStmt,
    ExitStmt,
    CycleStmt,
}

impl Statement {
    /// Does this statement belong to a specification part?
    pub fn is_specification(&self) -> bool {
        matches!(
            self,
            Statement::UseStmt { .. }
                | Statement::ImplicitStmt { .. }
                | Statement::IncludeLine { .. }
                | Statement::TypeDeclarationStmt { .. }
        )
    }
}

// ============================================================================
// Constructs
// ============================================================================

/// A node of the concrete tree with its source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub construct: Construct,
    pub span: Span,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Construct {
    Comment {
        text: String,
    },
    Directive {
        text: String,
    },
    Preprocessor {
        text: String,
    },
    /// Multi-line construct kept as text.
    Opaque {
        keyword: String,
    },
    /// Statement the grammar does not cover; `keyword` is its first word.
    Unparsed {
        keyword: String,
    },
    Statement(Statement),
    /// `if (cond) action`; `action` is `None` when it does not parse.
    IfStmt {
        condition: Expr,
        action: Option<Statement>,
        text: String,
    },
    ProgramUnit(ProgramUnit),
    Do(DoConstruct),
    If(IfConstruct),
    Block(BlockConstruct),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitHeader {
    Module {
        name: String,
    },
    Program {
        name: String,
    },
    Subroutine {
        prefixes: Vec<String>,
        name: String,
        dummies: Vec<String>,
    },
    Function {
        prefixes: Vec<String>,
        type_spec: Option<TypeSpec>,
        name: String,
        dummies: Vec<String>,
        result: Option<String>,
    },
}

impl UnitHeader {
    /// Keyword accepted after `end`.
    pub fn end_keyword(&self) -> &'static str {
        match self {
            UnitHeader::Module { .. } => "module",
            UnitHeader::Program { .. } => "program",
            UnitHeader::Subroutine { .. } => "subroutine",
            UnitHeader::Function { .. } => "function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpecificationPart(pub Vec<TreeNode>);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionPart(pub Vec<TreeNode>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalSubprogramPart {
    pub contains: Span,
    pub subprograms: Vec<TreeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramUnit {
    pub header: UnitHeader,
    pub head: Span,
    pub specification: SpecificationPart,
    pub execution: ExecutionPart,
    pub internal: Option<InternalSubprogramPart>,
    pub end: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoConstruct {
    /// `None` for an unbounded `do`.
    pub control: Option<LoopControl>,
    pub head: Span,
    pub block: ExecutionPart,
    pub end: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElsePart {
    ElseIf {
        condition: Expr,
        block: ExecutionPart,
        next: Option<Box<ElsePart>>,
    },
    Else {
        block: ExecutionPart,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfConstruct {
    pub condition: Expr,
    pub head: Span,
    pub block: ExecutionPart,
    pub else_part: Option<Box<ElsePart>>,
    pub end: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockConstruct {
    pub head: Span,
    pub specification: SpecificationPart,
    pub execution: ExecutionPart,
    pub end: Span,
}
