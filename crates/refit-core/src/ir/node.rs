//! Node variants of the unified IR.
//!
//! Every frontend normalizes its own tree into these variants. Child
//! references are [`NodeId`]s into the owning [`Arena`](super::Arena);
//! everything else is plain data.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::NodeId;

// ============================================================================
// Node Types
// ============================================================================

/// Discriminant of a [`NodeKind`], used for filters and rule subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Module,
    Routine,
    Use,
    Implicit,
    Declaration,
    Include,
    Assignment,
    Loop,
    WhileLoop,
    Conditional,
    Call,
    Block,
    Jump,
    Comment,
    Pragma,
    Verbatim,
    Literal,
    Variable,
    Subscript,
    Range,
    KeywordArg,
    Binary,
    Unary,
    Paren,
}

impl NodeType {
    /// Every node type, in declaration order.
    pub const ALL: [NodeType; 25] = [
        NodeType::File,
        NodeType::Module,
        NodeType::Routine,
        NodeType::Use,
        NodeType::Implicit,
        NodeType::Declaration,
        NodeType::Include,
        NodeType::Assignment,
        NodeType::Loop,
        NodeType::WhileLoop,
        NodeType::Conditional,
        NodeType::Call,
        NodeType::Block,
        NodeType::Jump,
        NodeType::Comment,
        NodeType::Pragma,
        NodeType::Verbatim,
        NodeType::Literal,
        NodeType::Variable,
        NodeType::Subscript,
        NodeType::Range,
        NodeType::KeywordArg,
        NodeType::Binary,
        NodeType::Unary,
        NodeType::Paren,
    ];

    /// Stable snake_case name.
    pub fn name(self) -> &'static str {
        match self {
            NodeType::File => "file",
            NodeType::Module => "module",
            NodeType::Routine => "routine",
            NodeType::Use => "use",
            NodeType::Implicit => "implicit",
            NodeType::Declaration => "declaration",
            NodeType::Include => "include",
            NodeType::Assignment => "assignment",
            NodeType::Loop => "loop",
            NodeType::WhileLoop => "while_loop",
            NodeType::Conditional => "conditional",
            NodeType::Call => "call",
            NodeType::Block => "block",
            NodeType::Jump => "jump",
            NodeType::Comment => "comment",
            NodeType::Pragma => "pragma",
            NodeType::Verbatim => "verbatim",
            NodeType::Literal => "literal",
            NodeType::Variable => "variable",
            NodeType::Subscript => "subscript",
            NodeType::Range => "range",
            NodeType::KeywordArg => "keyword_arg",
            NodeType::Binary => "binary",
            NodeType::Unary => "unary",
            NodeType::Paren => "paren",
        }
    }

    /// Parse a snake_case name back into a type.
    pub fn from_name(name: &str) -> Option<NodeType> {
        NodeType::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Bit used by [`NodeFilter`](crate::visit::NodeFilter).
    pub fn bit(self) -> u32 {
        1 << (self as u32)
    }

    /// True for expression nodes.
    pub fn is_expression(self) -> bool {
        matches!(
            self,
            NodeType::Literal
                | NodeType::Variable
                | NodeType::Subscript
                | NodeType::Range
                | NodeType::KeywordArg
                | NodeType::Binary
                | NodeType::Unary
                | NodeType::Paren
        )
    }

    /// True for modules and routines.
    pub fn is_program_unit(self) -> bool {
        matches!(self, NodeType::Module | NodeType::Routine)
    }

    /// True for nodes that own a scope.
    pub fn is_scoping(self) -> bool {
        matches!(
            self,
            NodeType::File | NodeType::Module | NodeType::Routine | NodeType::Block
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Supporting Data
// ============================================================================

/// Kind of a routine program unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutineKind {
    Subroutine,
    Function {
        result: Option<String>,
        return_type: Option<TypeSpec>,
    },
    Program,
}

impl RoutineKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            RoutineKind::Subroutine => "subroutine",
            RoutineKind::Function { .. } => "function",
            RoutineKind::Program => "program",
        }
    }
}

/// Declared type: base type plus optional kind/length selector.
///
/// Both parts are stored normalized (lowercase, no whitespace) so that
/// frontends agree on the representation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeSpec {
    /// `integer`, `real`, `double precision`, `type(point)`, ...
    pub base: String,
    /// Contents of the parenthesised selector, e.g. `kind=jprb` or `len=*`.
    pub selector: Option<String>,
}

impl TypeSpec {
    pub fn new(base: &str, selector: Option<&str>) -> Self {
        TypeSpec {
            base: normalize_base(base),
            selector: selector
                .map(|s| s.chars().filter(|c| !c.is_whitespace()).collect::<String>())
                .map(|s| s.to_ascii_lowercase())
                .filter(|s| !s.is_empty()),
        }
    }
}

fn normalize_base(base: &str) -> String {
    let lower = base.trim().to_ascii_lowercase();
    if let Some(open) = lower.find('(') {
        // type(foo) / class(foo): drop interior whitespace
        let (head, tail) = lower.split_at(open);
        let tail: String = tail.chars().filter(|c| !c.is_whitespace()).collect();
        format!("{}{}", head.trim(), tail)
    } else {
        lower.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.selector {
            Some(sel) => write!(f, "{}({})", self.base, sel),
            None => f.write_str(&self.base),
        }
    }
}

/// Dummy-argument intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intent {
    In,
    Out,
    InOut,
}

impl Intent {
    pub fn parse(text: &str) -> Option<Intent> {
        match text
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase()
            .as_str()
        {
            "in" => Some(Intent::In),
            "out" => Some(Intent::Out),
            "inout" => Some(Intent::InOut),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            Intent::In => "in",
            Intent::Out => "out",
            Intent::InOut => "inout",
        }
    }
}

/// Declaration attribute. `dimension(...)` is folded into entity shapes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Attr {
    Intent(Intent),
    Parameter,
    Allocatable,
    Pointer,
    Target,
    Optional,
    Save,
    Value,
    Contiguous,
    Public,
    Private,
    External,
    Intrinsic,
    /// Any other attribute, stored lowercase.
    Other(String),
}

impl Attr {
    /// Parse a bare attribute keyword (not `intent(...)` or `dimension(...)`).
    pub fn from_keyword(text: &str) -> Attr {
        let lower = text.trim().to_ascii_lowercase();
        match lower.as_str() {
            "parameter" => Attr::Parameter,
            "allocatable" => Attr::Allocatable,
            "pointer" => Attr::Pointer,
            "target" => Attr::Target,
            "optional" => Attr::Optional,
            "save" => Attr::Save,
            "value" => Attr::Value,
            "contiguous" => Attr::Contiguous,
            "public" => Attr::Public,
            "private" => Attr::Private,
            "external" => Attr::External,
            "intrinsic" => Attr::Intrinsic,
            _ => Attr::Other(lower.split_whitespace().collect::<Vec<_>>().join("")),
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attr::Intent(intent) => write!(f, "intent({})", intent.keyword()),
            Attr::Parameter => f.write_str("parameter"),
            Attr::Allocatable => f.write_str("allocatable"),
            Attr::Pointer => f.write_str("pointer"),
            Attr::Target => f.write_str("target"),
            Attr::Optional => f.write_str("optional"),
            Attr::Save => f.write_str("save"),
            Attr::Value => f.write_str("value"),
            Attr::Contiguous => f.write_str("contiguous"),
            Attr::Public => f.write_str("public"),
            Attr::Private => f.write_str("private"),
            Attr::External => f.write_str("external"),
            Attr::Intrinsic => f.write_str("intrinsic"),
            Attr::Other(text) => f.write_str(text),
        }
    }
}

/// One declared entity: `a(n, m) = init`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeclEntity {
    pub name: String,
    /// Extents, one expression (often a [`NodeKind::Range`]) per dimension.
    pub shape: Vec<NodeId>,
    pub init: Option<NodeId>,
    /// `=>` initialization (pointers).
    pub pointer_init: bool,
}

impl DeclEntity {
    pub fn scalar(name: impl Into<String>) -> Self {
        DeclEntity {
            name: name.into(),
            shape: Vec::new(),
            init: None,
            pointer_init: false,
        }
    }
}

/// Entry of a `use ..., only:` list. `rename` is the local name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UseItem {
    pub name: String,
    pub rename: Option<String>,
}

impl UseItem {
    /// Name under which the item is visible locally.
    pub fn local_name(&self) -> &str {
        self.rename.as_deref().unwrap_or(&self.name)
    }
}

/// One `if`/`else if` arm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Branch {
    pub condition: NodeId,
    pub body: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JumpKind {
    Return,
    Exit,
    Cycle,
}

impl JumpKind {
    pub fn keyword(self) -> &'static str {
        match self {
            JumpKind::Return => "return",
            JumpKind::Exit => "exit",
            JumpKind::Cycle => "cycle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiteralKind {
    Integer,
    Real,
    Logical,
    String,
}

/// Binary operators, normalized across spellings (`.eq.` and `==` are both `Eq`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Pow,
    Mul,
    Div,
    Add,
    Sub,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Eqv,
    Neqv,
}

impl BinaryOp {
    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            BinaryOp::Eqv | BinaryOp::Neqv => 1,
            BinaryOp::Or => 2,
            BinaryOp::And => 3,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 5,
            BinaryOp::Concat => 6,
            BinaryOp::Add | BinaryOp::Sub => 7,
            BinaryOp::Mul | BinaryOp::Div => 8,
            BinaryOp::Pow => 9,
        }
    }

    /// Only exponentiation groups right to left.
    pub fn is_right_assoc(self) -> bool {
        matches!(self, BinaryOp::Pow)
    }

    /// Canonical spelling used by the regenerator.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Pow => "**",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Concat => "//",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "/=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => ".and.",
            BinaryOp::Or => ".or.",
            BinaryOp::Eqv => ".eqv.",
            BinaryOp::Neqv => ".neqv.",
        }
    }

    /// Parse any accepted spelling (case-insensitive for dotted forms).
    pub fn from_symbol(text: &str) -> Option<BinaryOp> {
        let lower = text.to_ascii_lowercase();
        Some(match lower.as_str() {
            "**" => BinaryOp::Pow,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "//" => BinaryOp::Concat,
            "==" | ".eq." => BinaryOp::Eq,
            "/=" | ".ne." => BinaryOp::Ne,
            "<" | ".lt." => BinaryOp::Lt,
            "<=" | ".le." => BinaryOp::Le,
            ">" | ".gt." => BinaryOp::Gt,
            ">=" | ".ge." => BinaryOp::Ge,
            ".and." => BinaryOp::And,
            ".or." => BinaryOp::Or,
            ".eqv." => BinaryOp::Eqv,
            ".neqv." => BinaryOp::Neqv,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

impl UnaryOp {
    pub fn precedence(self) -> u8 {
        match self {
            UnaryOp::Not => 4,
            UnaryOp::Neg | UnaryOp::Plus => 7,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => ".not.",
        }
    }
}

/// Precedence of atoms (literals, names, parenthesised expressions).
pub const ATOM_PRECEDENCE: u8 = 10;

// ============================================================================
// Node Kinds
// ============================================================================

/// The semantic content of one IR node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Root of a source unit.
    File { items: Vec<NodeId> },
    Module {
        name: String,
        spec: Vec<NodeId>,
        routines: Vec<NodeId>,
    },
    Routine {
        name: String,
        kind: RoutineKind,
        /// `pure`, `elemental`, `recursive`, ... (lowercase).
        prefixes: Vec<String>,
        params: Vec<String>,
        spec: Vec<NodeId>,
        body: Vec<NodeId>,
        /// Internal procedures after `contains`.
        routines: Vec<NodeId>,
    },
    Use {
        module: String,
        intrinsic: bool,
        only: Option<Vec<UseItem>>,
    },
    /// `implicit none` is stored as `spec: "none"`.
    Implicit { spec: String },
    Declaration {
        type_spec: TypeSpec,
        attrs: Vec<Attr>,
        entities: Vec<DeclEntity>,
    },
    Include { path: String },
    Assignment {
        target: NodeId,
        value: NodeId,
        pointer: bool,
    },
    Loop {
        variable: String,
        start: NodeId,
        end: NodeId,
        step: Option<NodeId>,
        body: Vec<NodeId>,
    },
    /// `do while (cond)`, or an unbounded `do` when `condition` is `None`.
    WhileLoop {
        condition: Option<NodeId>,
        body: Vec<NodeId>,
    },
    Conditional {
        branches: Vec<Branch>,
        else_body: Option<Vec<NodeId>>,
        /// Single-line `if (cond) stmt`.
        inline: bool,
    },
    Call { name: String, args: Vec<NodeId> },
    /// `block ... end block` with its own scope.
    Block {
        spec: Vec<NodeId>,
        body: Vec<NodeId>,
    },
    Jump { kind: JumpKind },
    /// Full comment line, including the leading `!`.
    Comment { text: String },
    /// Directive comment such as `!$acc parallel loop`.
    Pragma { keyword: String, content: String },
    /// A statement or construct kept as opaque text.
    Verbatim { text: String },

    // Expressions
    Literal { kind: LiteralKind, text: String },
    Variable { name: String },
    /// Array element or function reference: `name(indices)`.
    Subscript { name: String, indices: Vec<NodeId> },
    Range {
        lower: Option<NodeId>,
        upper: Option<NodeId>,
        stride: Option<NodeId>,
    },
    KeywordArg { name: String, value: NodeId },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Unary { op: UnaryOp, operand: NodeId },
    Paren { inner: NodeId },
}

impl NodeKind {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeKind::File { .. } => NodeType::File,
            NodeKind::Module { .. } => NodeType::Module,
            NodeKind::Routine { .. } => NodeType::Routine,
            NodeKind::Use { .. } => NodeType::Use,
            NodeKind::Implicit { .. } => NodeType::Implicit,
            NodeKind::Declaration { .. } => NodeType::Declaration,
            NodeKind::Include { .. } => NodeType::Include,
            NodeKind::Assignment { .. } => NodeType::Assignment,
            NodeKind::Loop { .. } => NodeType::Loop,
            NodeKind::WhileLoop { .. } => NodeType::WhileLoop,
            NodeKind::Conditional { .. } => NodeType::Conditional,
            NodeKind::Call { .. } => NodeType::Call,
            NodeKind::Block { .. } => NodeType::Block,
            NodeKind::Jump { .. } => NodeType::Jump,
            NodeKind::Comment { .. } => NodeType::Comment,
            NodeKind::Pragma { .. } => NodeType::Pragma,
            NodeKind::Verbatim { .. } => NodeType::Verbatim,
            NodeKind::Literal { .. } => NodeType::Literal,
            NodeKind::Variable { .. } => NodeType::Variable,
            NodeKind::Subscript { .. } => NodeType::Subscript,
            NodeKind::Range { .. } => NodeType::Range,
            NodeKind::KeywordArg { .. } => NodeType::KeywordArg,
            NodeKind::Binary { .. } => NodeType::Binary,
            NodeKind::Unary { .. } => NodeType::Unary,
            NodeKind::Paren { .. } => NodeType::Paren,
        }
    }

    /// Name of a module or routine.
    pub fn unit_name(&self) -> Option<&str> {
        match self {
            NodeKind::Module { name, .. } | NodeKind::Routine { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Program units nested directly under this node.
    pub fn unit_children(&self) -> &[NodeId] {
        match self {
            NodeKind::File { items } => items,
            NodeKind::Module { routines, .. } | NodeKind::Routine { routines, .. } => routines,
            _ => &[],
        }
    }

    /// Convenience: a variable reference.
    pub fn var(name: impl Into<String>) -> NodeKind {
        NodeKind::Variable { name: name.into() }
    }

    /// Convenience: an integer literal.
    pub fn int(value: i64) -> NodeKind {
        NodeKind::Literal {
            kind: LiteralKind::Integer,
            text: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_names_round_trip() {
        for ty in NodeType::ALL {
            assert_eq!(NodeType::from_name(ty.name()), Some(ty));
        }
        assert_eq!(NodeType::from_name("nope"), None);
    }

    #[test]
    fn node_type_bits_are_distinct() {
        let mut seen = 0u32;
        for ty in NodeType::ALL {
            assert_eq!(seen & ty.bit(), 0);
            seen |= ty.bit();
        }
    }

    #[test]
    fn type_spec_normalizes() {
        let a = TypeSpec::new("REAL", Some(" KIND = JPRB "));
        assert_eq!(a.base, "real");
        assert_eq!(a.selector.as_deref(), Some("kind=jprb"));
        let b = TypeSpec::new("Double   Precision", None);
        assert_eq!(b.base, "double precision");
        let c = TypeSpec::new("TYPE( Point )", None);
        assert_eq!(c.base, "type(point)");
        assert_eq!(a.to_string(), "real(kind=jprb)");
    }

    #[test]
    fn operator_spellings_normalize() {
        assert_eq!(BinaryOp::from_symbol(".EQ."), Some(BinaryOp::Eq));
        assert_eq!(BinaryOp::from_symbol("=="), Some(BinaryOp::Eq));
        assert_eq!(BinaryOp::from_symbol(".Neqv."), Some(BinaryOp::Neqv));
        assert_eq!(BinaryOp::from_symbol("%"), None);
        assert!(BinaryOp::Pow.precedence() > BinaryOp::Mul.precedence());
        assert!(BinaryOp::Pow.is_right_assoc());
    }

    #[test]
    fn intent_parse_ignores_case_and_space() {
        assert_eq!(Intent::parse("IN OUT"), Some(Intent::InOut));
        assert_eq!(Intent::parse("in"), Some(Intent::In));
        assert_eq!(Intent::parse("sideways"), None);
    }
}
