//! vitte-core — bytecode chunk format for the Vitte language.
//!
//! This crate owns the wire-level representation of compiled Vitte
//! programs: the [`Op`] instruction set, the [`bytecode::chunk::Chunk`]
//! container (instructions, constant pool, line table, debug info), and a
//! versioned, hash-checked binary serialization of that container. It does
//! not know how to run a chunk (see `vitte-vm`) or how to produce one from
//! source (see `vitte-compiler`).
//!
//! ## Features
//! - **std** *(default)* — enables `std::io`-based file helpers.
//! - **serde** — binary (de)serialization of [`bytecode::chunk::Chunk`] via
//!   `serde` + `bincode`, with an FNV-1a content hash checked on load.
//! - **tracing** — emits a short `tracing` event summarizing a chunk.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod bytecode;
mod error;

pub use bytecode::chunk::{Chunk, ChunkFlags, ConstPool, ConstValue, LineTable};
pub use bytecode::ops::Op;
pub use error::{Error, Result};

/// Crate version, exposed for CLI banners and bytecode-container metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    //! Convenience re-exports for crates consuming `vitte-core`.
    pub use crate::{
        bytecode::{chunk, ops},
        Chunk, ChunkFlags, ConstPool, ConstValue, Error, LineTable, Op, Result,
    };
}

#[cfg(feature = "tracing")]
/// Emits a one-line `tracing` summary of a chunk (op/const counts).
pub fn log_chunk_short(c: &Chunk, tag: &str) {
    tracing::debug!(target: "vitte-core", tag, ops = c.ops.len(), consts = c.consts.len(), "chunk summary");
}

#[cfg(all(feature = "std", feature = "serde"))]
/// Reads a `.vlc` bytecode container from disk.
pub fn read_chunk_from_file(path: impl AsRef<std::path::Path>) -> Result<Chunk> {
    let bytes = std::fs::read(path)?;
    Chunk::from_bytes(&bytes).map_err(|e| Error::Chunk(e.to_string()))
}

#[cfg(all(feature = "std", feature = "serde"))]
/// Writes a `.vlc` bytecode container to disk.
pub fn write_chunk_to_file(chunk: &Chunk, path: impl AsRef<std::path::Path>) -> Result<()> {
    let bytes = chunk.to_bytes();
    std::fs::write(path, bytes)?;
    Ok(())
}
