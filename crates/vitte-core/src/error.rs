use thiserror::Error;

/// Errors surfaced by chunk loading/saving and the small file-IO helpers.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O failure reading or writing a bytecode container.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Chunk container is structurally invalid (bad magic, version, or hash).
    #[error("chunk: {0}")]
    Chunk(String),

    /// Catch-all for messages that don't fit another variant.
    #[error("{0}")]
    Msg(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
