//! Binary representation of a Vitte bytecode chunk.
//!
//! A `Chunk` bundles the instruction stream for one function body with its
//! constant pool, a run-length-encoded line table (one entry per
//! instruction index, not per byte — the addressable unit here is an
//! [`Op`], not a byte), and light debug metadata. With the `serde` feature
//! it can round-trip through a small versioned, magic-tagged, FNV-1a
//! hash-checked container (`.vlc`).

use std::fmt::{self, Write as _};

use crate::bytecode::ops::Op;

/// Bytecode container format version. Bump when the serialized shape changes.
pub const CHUNK_VERSION: u16 = 1;

/// Magic file header.
pub const CHUNK_MAGIC: [u8; 4] = *b"VLC1";

/// Reserved for future chunk-level options (e.g. stripped debug info).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChunkFlags {
    pub stripped: bool,
}

/// A constant pool entry. Strings and numbers are the only literal forms
/// the language's grammar produces; functions become constants once
/// compiled (see `vitte-compiler`), carried here as an opaque serialized
/// sub-chunk so `vitte-core` need not know about closures or runtime values.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConstValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    /// A nested function: name (empty for anonymous), arity, upvalue count,
    /// and its own chunk.
    Function {
        name: String,
        arity: u8,
        upvalue_count: u8,
        chunk: Box<Chunk>,
    },
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Null => write!(f, "nil"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::Number(n) => write!(f, "{n}"),
            ConstValue::Str(s) => write!(f, "{s:?}"),
            ConstValue::Function { name, arity, .. } => {
                if name.is_empty() {
                    write!(f, "<fn>({arity})")
                } else {
                    write!(f, "<fn {name}>({arity})")
                }
            }
        }
    }
}

/// Constant pool with string deduplication: two `add(ConstValue::Str(..))`
/// calls for equal content return the same index.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConstPool {
    values: Vec<ConstValue>,
    #[cfg_attr(feature = "serde", serde(skip))]
    string_index: ahash::AHashMap<String, u32>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constant, returning its index. String constants are
    /// deduplicated by content.
    pub fn add(&mut self, value: ConstValue) -> u32 {
        if let ConstValue::Str(ref s) = value {
            if let Some(&ix) = self.string_index.get(s) {
                return ix;
            }
        }
        let ix = self.values.len() as u32;
        if let ConstValue::Str(ref s) = value {
            self.string_index.insert(s.clone(), ix);
        }
        self.values.push(value);
        ix
    }

    pub fn get(&self, ix: u32) -> Option<&ConstValue> {
        self.values.get(ix as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConstValue> {
        self.values.iter()
    }

    /// Rebuilds the string dedup index. Needed after deserializing, since
    /// the index itself is not carried over the wire.
    pub fn rebuild_string_index(&mut self) {
        self.string_index.clear();
        for (ix, v) in self.values.iter().enumerate() {
            if let ConstValue::Str(s) = v {
                self.string_index.entry(s.clone()).or_insert(ix as u32);
            }
        }
    }
}

/// One run of consecutive instructions sharing a source line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
struct LineRun {
    start_pc: u32,
    line: u32,
    len: u32,
}

/// Run-length-encoded map from instruction index to source line.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the line for the instruction about to be pushed at `pc`.
    pub fn push_line(&mut self, pc: u32, line: u32) {
        if let Some(last) = self.runs.last_mut() {
            if last.line == line && last.start_pc + last.len == pc {
                last.len += 1;
                return;
            }
        }
        self.runs.push(LineRun { start_pc: pc, line, len: 1 });
    }

    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        self.runs
            .iter()
            .find(|r| pc >= r.start_pc && pc < r.start_pc + r.len)
            .map(|r| r.line)
    }
}

/// Misc non-essential debug info: the source file name, for error messages.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugInfo {
    pub main_file: Option<String>,
}

/// A compiled function body: its instructions, constants, and line table.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Chunk {
    pub flags: ChunkFlags,
    pub ops: Vec<Op>,
    pub consts: ConstPool,
    pub lines: LineTable,
    pub debug: DebugInfo,
}

impl Chunk {
    pub fn new(flags: ChunkFlags) -> Self {
        Self { flags, ..Default::default() }
    }

    /// Appends an instruction, recording its source line.
    pub fn push_op(&mut self, op: Op, line: u32) {
        let pc = self.ops.len() as u32;
        self.lines.push_line(pc, line);
        self.ops.push(op);
    }

    pub fn add_const(&mut self, value: ConstValue) -> u32 {
        self.consts.add(value)
    }

    pub fn const_at(&self, ix: u32) -> Option<&ConstValue> {
        self.consts.get(ix)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Human-readable disassembly: one line per instruction, with resolved
    /// constants and source lines.
    pub fn disassemble(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "== {title} ==");
        for (pc, op) in self.ops.iter().enumerate() {
            let line = self.lines.line_for_pc(pc as u32).unwrap_or(0);
            let _ = write!(out, "{pc:04} {line:>5} {op}");
            match op.operand_kind() {
                crate::bytecode::ops::OperandKind::Const => {
                    if let Some(ix) = const_operand(op) {
                        if let Some(v) = self.const_at(ix) {
                            let _ = write!(out, "  ; {v}");
                        }
                    }
                }
                crate::bytecode::ops::OperandKind::Invoke => {
                    if let Op::Invoke(ix, _) | Op::SuperInvoke(ix, _) = op {
                        if let Some(v) = self.const_at(*ix) {
                            let _ = write!(out, "  ; {v}");
                        }
                    }
                }
                _ => {}
            }
            let _ = writeln!(out);
        }
        out
    }
}

fn const_operand(op: &Op) -> Option<u32> {
    match op {
        Op::Constant(i)
        | Op::GetGlobal(i)
        | Op::SetGlobal(i)
        | Op::DefineGlobal(i)
        | Op::GetProperty(i)
        | Op::SetProperty(i)
        | Op::GetSuper(i)
        | Op::Class(i)
        | Op::Method(i) => Some(*i),
        _ => None,
    }
}

#[cfg(feature = "serde")]
mod persist {
    use super::*;
    use crate::{Error, Result};

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    struct ChunkHeader {
        magic: [u8; 4],
        version: u16,
        flags: ChunkFlags,
        hash_fnv1a_64: u64,
    }

    struct Fnv1a64(u64);
    impl Fnv1a64 {
        const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
        const PRIME: u64 = 0x100000001b3;
        fn new() -> Self {
            Self(Self::OFFSET_BASIS)
        }
        fn write(&mut self, bytes: &[u8]) {
            for &b in bytes {
                self.0 ^= b as u64;
                self.0 = self.0.wrapping_mul(Self::PRIME);
            }
        }
        fn finish(&self) -> u64 {
            self.0
        }
    }

    impl Chunk {
        fn body_bytes(&self) -> Vec<u8> {
            bincode::serialize(&(&self.ops, &self.consts, &self.lines, &self.debug))
                .expect("chunk body is always serializable")
        }

        fn compute_hash(body: &[u8]) -> u64 {
            let mut h = Fnv1a64::new();
            h.write(body);
            h.finish()
        }

        /// Serializes this chunk into a versioned, hash-checked byte container.
        pub fn to_bytes(&self) -> Vec<u8> {
            let body = self.body_bytes();
            let header = ChunkHeader {
                magic: CHUNK_MAGIC,
                version: CHUNK_VERSION,
                flags: self.flags,
                hash_fnv1a_64: Self::compute_hash(&body),
            };
            let mut out = bincode::serialize(&header).expect("header is always serializable");
            out.extend_from_slice(&body);
            out
        }

        /// Parses a byte container produced by [`Chunk::to_bytes`], verifying
        /// the magic, version, and content hash.
        pub fn from_bytes(bytes: &[u8]) -> Result<Chunk> {
            let header_size = bincode::serialized_size(&ChunkHeader {
                magic: CHUNK_MAGIC,
                version: CHUNK_VERSION,
                flags: ChunkFlags::default(),
                hash_fnv1a_64: 0,
            })
            .map_err(|e| Error::Chunk(e.to_string()))? as usize;

            if bytes.len() < header_size {
                return Err(Error::Chunk("chunk too short".into()));
            }
            let (header_bytes, body) = bytes.split_at(header_size);
            let header: ChunkHeader =
                bincode::deserialize(header_bytes).map_err(|e| Error::Chunk(e.to_string()))?;

            if header.magic != CHUNK_MAGIC {
                return Err(Error::Chunk("bad magic".into()));
            }
            if header.version != CHUNK_VERSION {
                return Err(Error::Chunk(format!(
                    "unsupported chunk version {}",
                    header.version
                )));
            }
            let actual_hash = Self::compute_hash(body);
            if actual_hash != header.hash_fnv1a_64 {
                return Err(Error::Chunk("content hash mismatch".into()));
            }

            let (ops, mut consts, lines, debug): (Vec<Op>, ConstPool, LineTable, DebugInfo) =
                bincode::deserialize(body).map_err(|e| Error::Chunk(e.to_string()))?;
            consts.rebuild_string_index();

            Ok(Chunk { flags: header.flags, ops, consts, lines, debug })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn roundtrip_detects_corruption() {
            let mut c = Chunk::new(ChunkFlags::default());
            let k = c.add_const(ConstValue::Str("hi".into()));
            c.push_op(Op::Constant(k), 1);
            c.push_op(Op::Print, 1);
            c.push_op(Op::Return, 1);

            let mut bytes = c.to_bytes();
            let c2 = Chunk::from_bytes(&bytes).expect("roundtrip ok");
            assert_eq!(c2.ops.len(), 3);

            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            let err = Chunk::from_bytes(&bytes).unwrap_err();
            assert!(format!("{err}").to_lowercase().contains("hash"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_pool_dedups_strings() {
        let mut pool = ConstPool::new();
        let a = pool.add(ConstValue::Str("x".into()));
        let b = pool.add(ConstValue::Str("x".into()));
        let c = pool.add(ConstValue::Str("y".into()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn line_table_coalesces_runs() {
        let mut lt = LineTable::new();
        lt.push_line(0, 1);
        lt.push_line(1, 1);
        lt.push_line(2, 2);
        assert_eq!(lt.line_for_pc(0), Some(1));
        assert_eq!(lt.line_for_pc(1), Some(1));
        assert_eq!(lt.line_for_pc(2), Some(2));
        assert_eq!(lt.runs.len(), 2);
    }

    #[test]
    fn disassemble_resolves_constants() {
        let mut c = Chunk::new(ChunkFlags::default());
        let k = c.add_const(ConstValue::Number(7.0));
        c.push_op(Op::Constant(k), 3);
        c.push_op(Op::Print, 3);
        c.push_op(Op::Return, 3);
        let text = c.disassemble("test");
        assert!(text.contains("OP_CONSTANT"));
        assert!(text.contains("; 7"));
    }
}
