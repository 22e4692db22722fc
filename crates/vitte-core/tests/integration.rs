//! Integration tests for the bytecode chunk container: building a `Chunk`
//! by hand (no compiler dependency here — `vitte-core` sits below
//! `vitte-compiler` in the workspace), disassembling it, and round-tripping
//! it through the `.vlc` binary format.

use vitte_core::bytecode::chunk::{Chunk, ChunkFlags, ConstValue};
use vitte_core::bytecode::ops::Op;

fn sample_chunk() -> Chunk {
    let mut c = Chunk::new(ChunkFlags::default());
    let msg = c.add_const(ConstValue::Str("hello".into()));
    let one = c.add_const(ConstValue::Number(1.0));
    c.push_op(Op::Constant(msg), 1);
    c.push_op(Op::Print, 1);
    c.push_op(Op::Constant(one), 2);
    c.push_op(Op::Constant(one), 2);
    c.push_op(Op::Add, 2);
    c.push_op(Op::Pop, 2);
    c.push_op(Op::Nil, 3);
    c.push_op(Op::Return, 3);
    c
}

#[test]
fn disassembly_lists_every_instruction_with_its_source_line() {
    let chunk = sample_chunk();
    let text = chunk.disassemble("sample");
    assert!(text.contains("== sample =="));
    assert!(text.contains("OP_CONSTANT"));
    assert!(text.contains("; \"hello\""));
    assert!(text.contains("OP_PRINT"));
    assert!(text.contains("OP_RETURN"));
    // one line per instruction, plus the title line
    assert_eq!(text.lines().count(), chunk.len() + 1);
}

#[test]
fn const_pool_dedups_strings_across_unrelated_instructions() {
    let mut chunk = Chunk::new(ChunkFlags::default());
    let a = chunk.add_const(ConstValue::Str("dup".into()));
    let b = chunk.add_const(ConstValue::Str("dup".into()));
    let c = chunk.add_const(ConstValue::Str("other".into()));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(chunk.consts.len(), 2);
}

#[test]
fn nested_function_constants_survive_a_vlc_roundtrip() {
    let mut inner = Chunk::new(ChunkFlags::default());
    let k = inner.add_const(ConstValue::Number(42.0));
    inner.push_op(Op::Constant(k), 10);
    inner.push_op(Op::Return, 10);

    let mut outer = Chunk::new(ChunkFlags::default());
    let f = outer.add_const(ConstValue::Function {
        name: "inner".into(),
        arity: 0,
        upvalue_count: 0,
        chunk: Box::new(inner),
    });
    outer.push_op(Op::Closure(f, Vec::new()), 1);
    outer.push_op(Op::Return, 1);

    let bytes = outer.to_bytes();
    let loaded = Chunk::from_bytes(&bytes).expect("roundtrip ok");
    assert_eq!(loaded.ops.len(), outer.ops.len());
    match loaded.const_at(f) {
        Some(ConstValue::Function { name, chunk, .. }) => {
            assert_eq!(name, "inner");
            assert_eq!(chunk.ops.len(), 2);
        }
        other => panic!("expected a nested Function constant, got {other:?}"),
    }
}

#[test]
fn corrupted_container_is_rejected_by_hash_check() {
    let chunk = sample_chunk();
    let mut bytes = chunk.to_bytes();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xFF;
    let err = Chunk::from_bytes(&bytes).unwrap_err();
    assert!(format!("{err}").to_lowercase().contains("hash"));
}

#[test]
fn truncated_container_is_rejected_rather_than_panicking() {
    let chunk = sample_chunk();
    let bytes = chunk.to_bytes();
    let err = Chunk::from_bytes(&bytes[..2]).unwrap_err();
    assert!(format!("{err}").contains("short") || format!("{err}").contains("chunk"));
}
