//! Error types for the AST loader/retrocycler and the lowering engine.

use thiserror::Error;

/// Errors raised while loading or retrocycling the JSON AST.
#[derive(Debug, Error)]
pub enum AstError {
    /// Two `var` nodes in the same `scope` share an id.
    #[error("duplicate definition: id {id} already bound in this scope")]
    DuplicateDefinition { id: u32 },

    /// A `var` or `ref` carried a negative id.
    #[error("negative id reserved: {id}")]
    NegativeIdReserved { id: i64 },

    /// A `ref`/`break` node's `(reference_level, id)` pair does not resolve
    /// to a `var` in any enclosing scope.
    #[error("unresolved reference: level {level}, id {id}")]
    UnresolvedReference { level: i32, id: u32 },

    /// The document failed to deserialize against the schema at all. This
    /// also covers a node with an unrecognised `"type"` tag: `serde`'s
    /// tagged-enum deserialization rejects it before any loader code runs.
    #[error("malformed AST document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors raised while lowering a retrocycled AST into SSA IR.
#[derive(Debug, Error)]
pub enum LowerError {
    /// The left-hand side of an `assign` was not a `ref` node.
    #[error("assignment left-hand side must be a reference")]
    NonRefLvalue,

    /// A `call`'s `head` was not a `builtin` node.
    #[error("call head must be a builtin")]
    NonBuiltinCallHead,

    /// A `builtin` name outside the closed set in the `call` position.
    #[error("unknown builtin: {0}")]
    UnknownBuiltin(String),

    /// A builtin was called with the wrong number of arguments.
    #[error("builtin '{builtin}' expects {expected} argument(s), found {found}")]
    WrongArity {
        builtin: String,
        expected: usize,
        found: usize,
    },

    /// A `ref` that survived retrocycling without a resolved pointer (an AST
    /// invariant violation -- should be unreachable after a clean load).
    #[error("reference used before resolution")]
    UnresolvedReference,

    /// A `var`/`builtin` node reached `compile` outside the position the
    /// grammar allows it in.
    #[error("unexpected node in expression position: {0}")]
    UnexpectedNode(&'static str),

    /// A node with no implemented lowering (currently only `break`).
    #[error("unimplemented node: {0}")]
    UnimplementedNode(&'static str),

    /// A `while` loop attempted to install a back-edge phi for a variable
    /// that an enclosing, still-open `while` has already claimed.
    #[error("loop already claimed variable for back-edge phi")]
    LoopAlreadyClaimed,

    /// A phi instruction was found outside the head of its block.
    #[error("phi instruction found outside the head of its block")]
    MisplacedPhi,
}
