//! Bytecode core for Vitte: opcodes, chunk format.

pub mod chunk;
pub mod ops;

pub use chunk::{Chunk, ChunkFlags, ConstPool, ConstValue, LineTable};
pub use ops::Op;
