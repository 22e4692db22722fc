//! Tri-color mark-sweep over the [`Heap`] arena.
//!
//! Roots: every slot on the value stack, every live frame's closure, every
//! open upvalue, every entry of the globals table, and the interned `init`
//! string. There is no separate "compiler chain" root here — unlike clox,
//! compilation in this crate runs to completion as a pure `vitte_core`
//! value (a [`vitte_core::bytecode::chunk::Chunk`], no heap object) before
//! the VM ever touches the heap, so a running compiler can never be mid-GC
//! (see `DESIGN.md`).
//!
//! White/gray/black follow `Heap`'s own bookkeeping: white is
//! `!marked`, gray is `marked && on the gray stack`, black is
//! `marked && removed from the gray stack`. The gray stack lives outside
//! the arena so growing it never re-enters collection.

use crate::heap::{Heap, Obj, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

pub(crate) fn collect(vm: &mut Vm) -> GcStats {
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("gc_collect").entered();

    let before = vm.heap.bytes_allocated;
    let mut gray: Vec<ObjRef> = Vec::new();

    mark_roots(vm, &mut gray);
    trace(&mut vm.heap, &mut gray);
    vm.heap.remove_white_strings();
    let freed = vm.heap.sweep();

    vm.heap.next_gc = (vm.heap.bytes_allocated * 2).max(1024 * 1024);

    let stats = GcStats { before, after: vm.heap.bytes_allocated, objects_freed: freed };
    #[cfg(feature = "tracing")]
    tracing::debug!(
        target: "vitte-vm",
        before = stats.before,
        after = stats.after,
        objects_freed = stats.objects_freed,
        next_gc = vm.heap.next_gc,
        "gc cycle"
    );
    stats
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct GcStats {
    pub before: usize,
    pub after: usize,
    pub objects_freed: usize,
}

fn mark_value(heap: &mut Heap, gray: &mut Vec<ObjRef>, v: &Value) {
    if let Value::Obj(r) = v {
        mark_object(heap, gray, *r);
    }
}

fn mark_object(heap: &mut Heap, gray: &mut Vec<ObjRef>, r: ObjRef) {
    if heap.mark(r) {
        gray.push(r);
    }
}

fn mark_roots(vm: &mut Vm, gray: &mut Vec<ObjRef>) {
    for v in &vm.stack {
        mark_value(&mut vm.heap, gray, v);
    }
    for frame in &vm.frames {
        mark_object(&mut vm.heap, gray, frame.closure);
    }
    for upvalue in &vm.open_upvalues {
        mark_object(&mut vm.heap, gray, *upvalue);
    }
    for (key, value) in vm.globals.iter() {
        mark_object(&mut vm.heap, gray, key);
        mark_value(&mut vm.heap, gray, value);
    }
    if let Some(init) = vm.init_string {
        mark_object(&mut vm.heap, gray, init);
    }
}

/// Pops objects off the gray stack and blackens them by marking whatever
/// they reference, until no gray objects remain.
fn trace(heap: &mut Heap, gray: &mut Vec<ObjRef>) {
    while let Some(r) = gray.pop() {
        blacken(heap, gray, r);
    }
}

/// Referents of one object, pulled out by reference before any mutable
/// marking happens — avoids cloning a `Function`'s whole `Chunk` just to
/// walk its constant pool.
enum Referents {
    None,
    Refs(Vec<ObjRef>),
    RefsAndValues(Vec<ObjRef>, Vec<Value>),
}

fn blacken(heap: &mut Heap, gray: &mut Vec<ObjRef>, r: ObjRef) {
    let referents = match heap.get(r) {
        Obj::Str { .. } => Referents::None,
        Obj::Function(f) => {
            let mut refs: Vec<ObjRef> = f.name.into_iter().collect();
            refs.extend(f.consts.iter().filter_map(|c| match c {
                Value::Obj(o) => Some(*o),
                _ => None,
            }));
            Referents::Refs(refs)
        }
        Obj::Native(n) => Referents::Refs(vec![n.name]),
        Obj::Closure(c) => {
            let mut refs = c.upvalues.clone();
            refs.push(c.function);
            Referents::Refs(refs)
        }
        Obj::Upvalue(state) => match state {
            crate::heap::UpvalueState::Closed(v) => Referents::RefsAndValues(Vec::new(), vec![*v]),
            crate::heap::UpvalueState::Open(_) => Referents::None,
        },
        Obj::Class(c) => {
            let mut refs = vec![c.name];
            let mut vals = Vec::new();
            for (k, v) in c.methods.iter() {
                refs.push(k);
                vals.push(*v);
            }
            Referents::RefsAndValues(refs, vals)
        }
        Obj::Instance(i) => {
            let mut refs = vec![i.class];
            let mut vals = Vec::new();
            for (k, v) in i.fields.iter() {
                refs.push(k);
                vals.push(*v);
            }
            Referents::RefsAndValues(refs, vals)
        }
        Obj::BoundMethod(b) => Referents::RefsAndValues(vec![b.method], vec![b.receiver]),
    };

    match referents {
        Referents::None => {}
        Referents::Refs(refs) => {
            for o in refs {
                mark_object(heap, gray, o);
            }
        }
        Referents::RefsAndValues(refs, vals) => {
            for o in refs {
                mark_object(heap, gray, o);
            }
            for v in &vals {
                mark_value(heap, gray, v);
            }
        }
    }
}
