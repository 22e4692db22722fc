//! The object heap: a generational arena holding every Vitte heap object,
//! plus the string intern table.
//!
//! Objects are addressed through [`ObjRef`], a small `Copy` handle, rather
//! than a pointer or `Rc`: the workspace forbids `unsafe`, and the object
//! graph this language builds (classes capturing closures, instances
//! pointing back at their class, closures sharing upvalues) can contain
//! cycles that reference counting alone cannot reclaim. The arena, not any
//! single owner, is what keeps objects alive; [`crate::gc`] decides when a
//! slot may be reused.

use std::fmt;

use vitte_core::bytecode::chunk::Chunk;

use crate::table::Table;
use crate::value::Value;

/// FNV-1a over UTF-8 bytes, used both for the string intern table and as the
/// precomputed hash stored on every string object.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut h = OFFSET_BASIS;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(PRIME);
    }
    h
}

/// A `Copy` handle into the [`Heap`] arena. Equality is by identity
/// (index + generation), which is exactly what interned strings need:
/// equal content always yields the same handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef {
    index: u32,
    generation: u32,
}

impl ObjRef {
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub name: Option<ObjRef>,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
    /// `chunk.consts` materialized into runtime [`Value`]s once, when the
    /// chunk is loaded: strings interned, nested functions recursively
    /// turned into their own `Obj::Function` (see `vm::load_function`).
    /// Index-aligned with `chunk.consts`.
    pub consts: Vec<Value>,
}

pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

#[derive(Clone, Copy)]
pub struct NativeObj {
    pub name: ObjRef,
    pub arity: u8,
    pub func: NativeFn,
}

impl fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeObj").field("arity", &self.arity).finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

/// An upvalue is open while it observes a live stack slot, and closed once
/// the frame that owned that slot returns.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct ClassObj {
    pub name: ObjRef,
    pub methods: Table<Value>,
}

#[derive(Debug, Clone)]
pub struct InstanceObj {
    pub class: ObjRef,
    pub fields: Table<Value>,
}

#[derive(Debug, Clone)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug, Clone)]
pub enum Obj {
    Str { data: String, hash: u64 },
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueState),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
}

impl Obj {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Obj::Str { .. } => "string",
            Obj::Function(_) => "function",
            Obj::Native(_) => "native",
            Obj::Closure(_) => "closure",
            Obj::Upvalue(_) => "upvalue",
            Obj::Class(_) => "class",
            Obj::Instance(_) => "instance",
            Obj::BoundMethod(_) => "bound method",
        }
    }
}

struct Slot {
    generation: u32,
    marked: bool,
    data: Option<Obj>,
}

/// Intern-table entry. `Tombstone` keeps the probe chain intact after a
/// collected string is removed (see [`Heap::remove_white_strings`]).
enum InternSlot {
    Empty,
    Tombstone,
    Occupied(ObjRef),
}

/// The object arena plus the string intern table. Owned exclusively by the
/// [`crate::vm::Vm`].
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    intern: Vec<InternSlot>,
    intern_live: usize,
    pub bytes_allocated: usize,
    pub next_gc: usize,
}

const INITIAL_NEXT_GC: usize = 1024 * 1024;

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            intern: vec![InternSlot::Empty; 0],
            intern_live: 0,
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
        }
    }

    fn rough_size(obj: &Obj) -> usize {
        match obj {
            Obj::Str { data, .. } => 24 + data.len(),
            Obj::Function(f) => 64 + f.chunk.ops.len() * 16,
            Obj::Native(_) => 32,
            Obj::Closure(c) => 24 + c.upvalues.len() * 4,
            Obj::Upvalue(_) => 16,
            Obj::Class(_) => 48,
            Obj::Instance(_) => 48,
            Obj::BoundMethod(_) => 24,
        }
    }

    /// Allocates a new object, reusing a freed slot when available.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += Self::rough_size(&obj);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.marked = false;
            slot.data = Some(obj);
            return ObjRef { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, marked: false, data: Some(obj) });
        ObjRef { index, generation: 0 }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        let slot = &self.slots[r.index as usize];
        assert_eq!(slot.generation, r.generation, "stale object handle");
        slot.data.as_ref().expect("dangling object handle")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        let slot = &mut self.slots[r.index as usize];
        assert_eq!(slot.generation, r.generation, "stale object handle");
        slot.data.as_mut().expect("dangling object handle")
    }

    pub fn as_str(&self, r: ObjRef) -> Option<&str> {
        match self.get(r) {
            Obj::Str { data, .. } => Some(data.as_str()),
            _ => None,
        }
    }

    pub fn str_hash(&self, r: ObjRef) -> u64 {
        match self.get(r) {
            Obj::Str { hash, .. } => *hash,
            _ => panic!("str_hash on non-string object"),
        }
    }

    pub fn display_obj(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::Str { data, .. } => data.clone(),
            Obj::Function(f) => match &f.name {
                Some(n) => format!("<fn {}>", self.as_str(*n).unwrap_or("?")),
                None => "<script>".to_string(),
            },
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::Closure(c) => {
                let f = self.get(c.function);
                if let Obj::Function(f) = f {
                    match &f.name {
                        Some(n) => format!("<fn {}>", self.as_str(*n).unwrap_or("?")),
                        None => "<script>".to_string(),
                    }
                } else {
                    "<closure>".to_string()
                }
            }
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Class(c) => format!("{}", self.as_str(c.name).unwrap_or("?")),
            Obj::Instance(i) => {
                let cls = self.get(i.class);
                if let Obj::Class(c) = cls {
                    format!("{} instance", self.as_str(c.name).unwrap_or("?"))
                } else {
                    "<instance>".to_string()
                }
            }
            Obj::BoundMethod(_) => "<bound method>".to_string(),
        }
    }

    // ---------------- String interning ----------------

    const INTERN_MIN_CAPACITY: usize = 8;

    /// Interns `s`, returning the unique handle for its content. Equal
    /// content always yields an equal (by identity) handle.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        let hash = fnv1a(s.as_bytes());
        if !self.intern.is_empty() {
            if let Some(existing) = self.find_interned(s, hash) {
                return existing;
            }
        }
        let handle = self.alloc(Obj::Str { data: s.to_string(), hash });
        self.intern_insert(handle, hash, s);
        handle
    }

    fn find_interned(&self, s: &str, hash: u64) -> Option<ObjRef> {
        let cap = self.intern.len();
        if cap == 0 {
            return None;
        }
        let mut idx = (hash as usize) & (cap - 1);
        loop {
            match &self.intern[idx] {
                InternSlot::Empty => return None,
                InternSlot::Tombstone => {}
                InternSlot::Occupied(r) => {
                    if let Obj::Str { data, hash: h } = self.get(*r) {
                        if *h == hash && data == s {
                            return Some(*r);
                        }
                    }
                }
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn intern_insert(&mut self, handle: ObjRef, hash: u64, s: &str) {
        if self.intern.is_empty()
            || (self.intern_live + 1) as f64 / self.intern.len() as f64 > 0.75
        {
            self.grow_intern();
        }
        let cap = self.intern.len();
        let mut idx = (hash as usize) & (cap - 1);
        loop {
            match &self.intern[idx] {
                InternSlot::Empty | InternSlot::Tombstone => {
                    self.intern[idx] = InternSlot::Occupied(handle);
                    self.intern_live += 1;
                    return;
                }
                InternSlot::Occupied(r) => {
                    if let Obj::Str { data, hash: h } = self.get(*r) {
                        if *h == hash && data == s {
                            return;
                        }
                    }
                }
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn grow_intern(&mut self) {
        let new_cap = (self.intern.len() * 2).max(Self::INTERN_MIN_CAPACITY);
        let old = std::mem::replace(
            &mut self.intern,
            (0..new_cap).map(|_| InternSlot::Empty).collect(),
        );
        self.intern_live = 0;
        for slot in old {
            if let InternSlot::Occupied(r) = slot {
                if let Obj::Str { hash, .. } = self.get(r) {
                    let hash = *hash;
                    let cap = self.intern.len();
                    let mut idx = (hash as usize) & (cap - 1);
                    loop {
                        if matches!(self.intern[idx], InternSlot::Empty) {
                            self.intern[idx] = InternSlot::Occupied(r);
                            self.intern_live += 1;
                            break;
                        }
                        idx = (idx + 1) & (cap - 1);
                    }
                }
            }
        }
    }

    // ---------------- GC hooks ----------------

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.slots[r.index as usize].marked
    }

    pub fn mark(&mut self, r: ObjRef) -> bool {
        let slot = &mut self.slots[r.index as usize];
        if slot.marked {
            false
        } else {
            slot.marked = true;
            true
        }
    }

    /// Tombstones intern-table entries whose string object was not marked
    /// during the last trace, so dead strings don't leave dangling keys
    /// behind for future probes to trip over.
    pub fn remove_white_strings(&mut self) {
        for slot in &mut self.intern {
            if let InternSlot::Occupied(r) = slot {
                if !self.slots[r.index as usize].marked {
                    *slot = InternSlot::Tombstone;
                    self.intern_live -= 1;
                }
            }
        }
    }

    /// Frees every unmarked slot and clears marks on survivors. Returns the
    /// number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if slot.data.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                if let Some(obj) = slot.data.take() {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::rough_size(&obj));
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                freed += 1;
            }
        }
        freed
    }

    /// Every allocated object's handle, for root-tracing callers that need
    /// to walk "everything" (used only by tests / stress mode).
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.data.is_some()).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
