//! Core data model for the slzprog compiler: the AST loader/retrocycler and
//! the SSA intermediate representation produced by lowering.
//!
//! # Modules
//!
//! - [`ast`] -- on-disk AST schema, arena-resolved AST, retrocycling.
//! - [`error`] -- error types for schema and lowering failures.
//! - [`ir`] -- SSA instruction arena, use-chains, renumbering.
//! - [`lower`] -- the AST-to-SSA lowering engine with structured control flow.

pub mod ast;
pub mod error;
pub mod ir;
pub mod lower;

pub use ast::{Ast, NodeId, RawNode, ResolvedNode, VarRef};
pub use error::{AstError, LowerError};
pub use ir::{Function, InstrId, Instruction, Opcode};
pub use lower::{lower_program, JoinObserver, LowerEnv, NullObserver};
