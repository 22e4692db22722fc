//! vitte-vm — stack-based bytecode virtual machine and mark-sweep collector
//! for the Vitte language.
//!
//! The crate is split the way clox's single `vm.c`/`memory.c`/`object.c`
//! would be if Rust's ownership rules forced the object graph apart:
//!
//! - [`heap`] — the object arena ([`Heap`], [`ObjRef`], [`Obj`] and its
//!   variants): every heap-allocated value lives here, addressed by a
//!   generational handle rather than a pointer.
//! - [`value`] — the tagged-union [`Value`] the stack and every slot in the
//!   interpreter is built from.
//! - [`table`] — the open-addressed hash table backing globals, class
//!   method tables, and instance field tables.
//! - [`gc`] — the tri-color mark-sweep collector over the heap.
//! - [`vm`] — the [`Vm`] itself: call frames, the call protocol, and the
//!   opcode dispatch loop.
//!
//! Callers needing only to run a source string want [`Vm::interpret`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

mod gc;
mod heap;
mod table;
mod value;
mod vm;

pub use heap::{Heap, ObjRef};
pub use table::Table;
pub use value::Value;
pub use vm::{DefaultHost, Host, InterpretResult, RuntimeError, Vm};
