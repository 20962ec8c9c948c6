//! PE32 executable writer: byte-level primitives, the import table, the
//! resource directory tree, and the top-level image layout.
//!
//! This crate only ever constructs a PE image byte-for-byte from already
//! assembled machine code -- it never parses one, so it has no use for a
//! `Pread`/`Pwrite`-style parsing crate; a plain little-endian
//! [`bytes::ByteWriter`] is the idiomatic fit for a write-only format.

pub mod bytes;
pub mod import;
pub mod resource;
pub mod section;
pub mod writer;

use thiserror::Error;

pub use import::{build_idata, ImportEntry};
pub use resource::{build_rsrc, default_resource_tree, VersionInfo};
pub use section::Section;
pub use writer::{write_pe, PeInput, PeVariant};

/// Errors the PE writer can raise while laying out or serialising an image.
#[derive(Debug, Error)]
pub enum PeError {
    #[error("section `{name}` file offset mismatch: expected {expected:#x}, writer is at {actual:#x}")]
    SectionOffsetMismatch { name: String, expected: u32, actual: u32 },

    #[error(".rsrc section content ({size} bytes) exceeds the fixed 4096-byte budget")]
    ResourceBudgetExceeded { size: usize },

    #[error("failed to write output file: {0}")]
    Io(#[from] std::io::Error),
}
