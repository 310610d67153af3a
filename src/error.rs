//! Recoverable error kinds. Corruption and internal-invariant failures are
//! deliberately not variants here: they are always fatal, so they go
//! through [`crate::fatal`] instead of a `Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    /// The OS denied a mapping, or the host allocator returned null.
    #[error("out of memory")]
    OutOfMemory,

    /// A caller-observable misuse that the stdlib adaptor reports instead
    /// of aborting (the bitmap allocator treats the same condition as
    /// fatal).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}
