//! Textual assembly emission and external-assembler invocation.
//!
//! Code generation here never touches an in-process assembler backend --
//! it emits NASM-syntax text and shells out to a real `nasm`-compatible
//! binary, the way this stack's link step always has.

pub mod assemble;
pub mod emit;

use thiserror::Error;

pub use assemble::assemble;
pub use emit::emit_function;

/// Errors raised while turning a lowered function into machine code.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error(transparent)]
    Lower(#[from] slzprog_core::LowerError),

    /// The external assembler exited with a non-zero status.
    #[error("assembler exited with status {status}: {stderr}")]
    AssemblerFailed { status: i32, stderr: String },

    /// The external assembler could not be spawned at all (missing binary,
    /// no exec permission, ...).
    #[error("failed to invoke assembler: {0}")]
    Io(#[from] std::io::Error),
}
