//! `vitte-cli` — the `vitte` binary: `run`, `repl`, and `disasm`.
//!
//! Thin over `vitte-compiler`/`vitte-vm`: every subcommand just wires
//! stdin/argv/files into `compile_str`/`compile_file` and `Vm::interpret`.
//! There is no project manifest or build graph here — a Vitte program is
//! one source file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use vitte_core::bytecode::chunk::{Chunk, ConstValue};
use vitte_vm::{InterpretResult, Vm};

#[derive(Parser, Debug)]
#[command(name = "vitte", version, about = "Vitte language tool: run, repl, and disasm")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Compile and execute a `.vl` source file.
    Run {
        file: PathBuf,
        /// Print each executed instruction and the value stack before it runs.
        #[arg(long)]
        trace: bool,
    },
    /// Interactive prompt; the VM (and its globals) stays alive across lines.
    Repl {
        #[arg(long)]
        trace: bool,
    },
    /// Compile a source file and print its disassembled bytecode without running it.
    Disasm { file: PathBuf },
}

/// Entry point called from `main.rs`.
pub fn run() -> Result<()> {
    match Cli::parse().cmd {
        Cmd::Run { file, trace } => cmd_run(&file, trace),
        Cmd::Repl { trace } => cmd_repl(trace),
        Cmd::Disasm { file } => cmd_disasm(&file),
    }
}

fn cmd_run(file: &Path, trace: bool) -> Result<()> {
    let source =
        fs::read_to_string(file).with_context(|| format!("reading '{}'", file.display()))?;
    let mut vm = Vm::new().with_trace(trace);
    let result = vm.interpret(&source);
    if result != InterpretResult::Ok {
        std::process::exit(result.exit_code());
    }
    Ok(())
}

fn cmd_repl(trace: bool) -> Result<()> {
    println!("vitte {} -- Ctrl-D to exit", vitte_core::VERSION);
    let mut vm = Vm::new().with_trace(trace);
    let mut editor = DefaultEditor::new().context("starting the line editor")?;
    loop {
        match editor.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line.as_str());
                vm.interpret(&line);
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => break,
            Err(e) => {
                eprintln!("readline error: {e}");
                break;
            }
        }
    }
    Ok(())
}

fn cmd_disasm(file: &Path) -> Result<()> {
    let chunk = vitte_compiler::compile_file(file).map_err(|e| anyhow::anyhow!("{e}"))?;
    let title = file.file_name().and_then(|n| n.to_str()).unwrap_or("script");
    let mut out = String::new();
    disassemble_recursive(&chunk, title, &mut out);
    print!("{out}");
    Ok(())
}

/// `Chunk::disassemble` only lists one function's own instructions; this
/// walks nested `ConstValue::Function` constants (one per `fun`/method
/// declaration) and prints each of their bodies too.
fn disassemble_recursive(chunk: &Chunk, title: &str, out: &mut String) {
    out.push_str(&chunk.disassemble(title));
    for c in chunk.consts.iter() {
        if let ConstValue::Function { name, chunk: inner, .. } = c {
            let label = if name.is_empty() { "<fn>".to_string() } else { format!("fn {name}") };
            out.push('\n');
            disassemble_recursive(inner, &label, out);
        }
    }
}
