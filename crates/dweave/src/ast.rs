//! The compiler-input boundary.
//!
//! The D parser and type checker are external; what crosses the
//! boundary is a tree of typed nodes in an arena. Each node carries a
//! kind tag, a source position, up to three operand node ids, a
//! resolved type, and an optional literal payload. Variable references
//! arrive with their ids already assigned (built-ins below the reserved
//! base, user variables at or above it); this layer never inspects
//! source text.

use dweave_dif::entity::PrimaryMap;
use dweave_dif::entity_ref;
use dweave_dif::vartab::{Builtin, DifType, VarScope};

/// A node in the expression arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(u32);
entity_ref!(NodeId, "n");

/// An opaque source position, carried through for diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SrcPos(pub String);

impl core::fmt::Display for SrcPos {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Binary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `&`
    And,
    /// `|`
    Or,
    /// `^`
    Xor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<` (signed)
    Lt,
    /// `<=` (signed)
    Le,
    /// `>` (signed)
    Gt,
    /// `>=` (signed)
    Ge,
}

/// Unary operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Neg,
    /// Bitwise complement.
    BitNot,
    /// Logical not: zero becomes one, nonzero becomes zero.
    Not,
}

/// The kind tag and operands of one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// An integer literal.
    Int(i64),
    /// A string literal.
    Str(String),
    /// A built-in variable.
    Builtin(Builtin),
    /// A scalar variable reference; scope is global or thread-local.
    Var {
        /// The assigned variable id.
        id: u32,
        /// Global or thread-local.
        scope: VarScope,
    },
    /// An associative-array element reference.
    Elem {
        /// The assigned variable id.
        id: u32,
        /// Global or thread-local array.
        scope: VarScope,
        /// Key tuple components, in order.
        key: Vec<NodeId>,
    },
    /// A unary operation.
    Unary(UnaryOp, NodeId),
    /// A binary operation.
    Binary(BinOp, NodeId, NodeId),
    /// An assignment; the target must be a `Var` or `Elem` node. The
    /// expression's value is the stored value.
    Assign(NodeId, NodeId),
}

/// One typed node.
#[derive(Clone, Debug)]
pub struct Node {
    /// The kind tag and operands.
    pub kind: NodeKind,
    /// Source position for diagnostics.
    pub pos: SrcPos,
    /// The resolved type.
    pub ty: DifType,
}

/// The expression arena for one compilation.
#[derive(Debug, Default)]
pub struct Ast {
    nodes: PrimaryMap<NodeId, Node>,
}

impl Ast {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node, returning its id.
    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node)
    }

    /// The node behind `id`.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Is the arena empty?
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Convenience: an untyped-integer node with no position.
    pub fn int(&mut self, value: i64) -> NodeId {
        self.push(Node {
            kind: NodeKind::Int(value),
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }

    /// Convenience: a string-literal node.
    pub fn str_lit(&mut self, value: &str) -> NodeId {
        self.push(Node {
            kind: NodeKind::Str(value.to_string()),
            pos: SrcPos::default(),
            ty: DifType::string(value.len() as u32),
        })
    }

    /// Convenience: a built-in reference.
    pub fn builtin(&mut self, b: Builtin) -> NodeId {
        self.push(Node {
            kind: NodeKind::Builtin(b),
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }

    /// Convenience: a scalar variable reference.
    pub fn var(&mut self, id: u32, scope: VarScope) -> NodeId {
        self.push(Node {
            kind: NodeKind::Var { id, scope },
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }

    /// Convenience: an associative element reference.
    pub fn elem(&mut self, id: u32, scope: VarScope, key: Vec<NodeId>) -> NodeId {
        self.push(Node {
            kind: NodeKind::Elem { id, scope, key },
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }

    /// Convenience: a binary operation.
    pub fn binary(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId) -> NodeId {
        self.push(Node {
            kind: NodeKind::Binary(op, lhs, rhs),
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }

    /// Convenience: a unary operation.
    pub fn unary(&mut self, op: UnaryOp, operand: NodeId) -> NodeId {
        self.push(Node {
            kind: NodeKind::Unary(op, operand),
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }

    /// Convenience: an assignment.
    pub fn assign(&mut self, target: NodeId, value: NodeId) -> NodeId {
        self.push(Node {
            kind: NodeKind::Assign(target, value),
            pos: SrcPos::default(),
            ty: DifType::i64(),
        })
    }
}
