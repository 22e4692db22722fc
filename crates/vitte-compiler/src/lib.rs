//! vitte-compiler — single-pass Pratt compiler for Vitte.
//!
//! There is no separate AST stage: [`compiler`] parses and emits
//! [`vitte_core::bytecode::chunk::Chunk`] bytecode in the same walk, the way
//! clox's `compiler.c` does. [`lexer`] is the hand-written scanner feeding it
//! tokens.
//!
//! Callers want [`compile_str`] (or [`compile_file`] for a path on disk).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

use std::fs;
use std::path::Path;

mod compiler;
mod lexer;

pub use compiler::CompileError;
pub use lexer::{Lexer, Token, TokenKind};
pub use vitte_core::bytecode::chunk::Chunk;

/// Compiles a source string into a top-level function [`Chunk`].
pub fn compile_str(source: &str) -> Result<Chunk, CompileError> {
    compiler::compile(source)
}

/// Reads and compiles a `.vitte` source file.
///
/// I/O failures are reported the same way a compile error is: as a single
/// diagnostic message, so callers only have one error type to print.
pub fn compile_file(path: &Path) -> Result<Chunk, CompileError> {
    let source = fs::read_to_string(path).map_err(|e| CompileError {
        messages: vec![format!("Could not read '{}': {e}", path.display())],
    })?;
    compile_str(&source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_a_trivial_program() {
        assert!(compile_str("print 1 + 2;").is_ok());
    }

    #[test]
    fn reports_parse_errors() {
        let err = compile_str("var;").unwrap_err();
        assert!(!err.messages.is_empty());
    }

    #[test]
    fn missing_file_is_reported_as_a_compile_error() {
        let err = compile_file(Path::new("/nonexistent/path/does-not-exist.vitte")).unwrap_err();
        assert!(!err.messages.is_empty());
    }
}
