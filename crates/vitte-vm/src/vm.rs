//! The stack VM: call frames over a shared value stack, the call protocol
//! for closures/classes/bound methods/natives, and the opcode dispatch loop.
//!
//! Unlike clox, compilation here produces a pure `vitte_core` [`Chunk`] —
//! no heap object is ever allocated until the VM *loads* that chunk (see
//! [`Vm::load_function`]). That means a running compiler is never a GC
//! root: by the time any object exists on this VM's heap, compilation has
//! already finished. `collect_if_needed` is therefore checked once per
//! dispatch-loop iteration rather than inside every allocation primitive —
//! safe because every opcode handler finishes pushing whatever it
//! allocated onto the stack (or into a reachable table) before the loop
//! comes back around, which is the same invariant clox's inline
//! allocation-site checks protect, just enforced at a coarser grain.

use std::time::Instant;

use once_cell::sync::Lazy;

use vitte_core::bytecode::chunk::{Chunk, ConstValue};
use vitte_core::bytecode::ops::{Op, UpvalueDesc};

use crate::gc;
use crate::heap::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, Heap, InstanceObj, NativeFn, NativeObj, Obj,
    ObjRef, UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

pub(crate) const FRAMES_MAX: usize = 64;
pub(crate) const STACK_MAX: usize = FRAMES_MAX * 256;

/// Forced in [`Vm::with_host`] so the baseline is process start, not the
/// timestamp of whichever call site first invokes the `clock()` native.
static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Result of [`Vm::interpret`], mirroring clox's `InterpretResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl InterpretResult {
    /// Process exit code for a file-driver frontend: 0/65/70.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretResult::Ok => 0,
            InterpretResult::CompileError => 65,
            InterpretResult::RuntimeError => 70,
        }
    }
}

/// Host hooks for the two effects the language can perform outside its own
/// value model: `print` and the `clock` native.
pub trait Host {
    fn print(&mut self, line: &str);
}

/// Prints to stdout, one line per `print` statement.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, line: &str) {
        println!("{line}");
    }
}

pub(crate) struct CallFrame {
    pub(crate) closure: ObjRef,
    pub(crate) ip: usize,
    pub(crate) slots_base: usize,
}

/// A Vitte runtime error: the in-language failure message plus the
/// per-frame stack trace `SPEC_FULL.md` §7 requires printed alongside it.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    pub trace: String,
}

#[derive(PartialEq)]
enum Flow {
    Continue,
    Halt,
}

/// The virtual machine: value stack, call-frame stack, heap, globals, and
/// the open-upvalue list, plus the host it reports effects to.
pub struct Vm {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) heap: Heap,
    pub(crate) globals: Table<Value>,
    /// Sorted strictly descending by the stack slot each upvalue observes.
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) init_string: Option<ObjRef>,
    stress_gc: bool,
    trace: bool,
    host: Box<dyn Host>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_host(Box::new(DefaultHost))
    }

    pub fn with_host(host: Box<dyn Host>) -> Self {
        Lazy::force(&PROCESS_START);
        let mut vm = Self {
            stack: Vec::with_capacity(1024),
            frames: Vec::with_capacity(FRAMES_MAX),
            heap: Heap::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string: None,
            stress_gc: false,
            trace: false,
            host,
        };
        let init = vm.heap.intern("init");
        vm.init_string = Some(init);
        vm.install_stdlib();
        vm
    }

    /// Collects on every GC checkpoint rather than only past the
    /// `bytes_allocated > next_gc` threshold. Used by tests to flush out
    /// dangling-reference bugs that a cold heap would never trigger.
    pub fn with_stress_gc(mut self, on: bool) -> Self {
        self.stress_gc = on;
        self
    }

    /// When set, prints the value stack and the instruction about to run
    /// before every dispatch-loop step, for CLI `--trace` debugging.
    pub fn with_trace(mut self, on: bool) -> Self {
        self.trace = on;
        self
    }

    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = host;
    }

    fn install_stdlib(&mut self) {
        self.define_native("clock", 0, native_clock);
    }

    fn define_native(&mut self, name: &str, arity: u8, func: NativeFn) {
        let name_ref = self.heap.intern(name);
        let native_ref = self.heap.alloc(Obj::Native(NativeObj { name: name_ref, arity, func }));
        self.globals.set(&self.heap, name_ref, Value::Obj(native_ref));
    }

    // ---------------- entry point ----------------

    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let chunk = match vitte_compiler::compile_str(source) {
            Ok(chunk) => chunk,
            Err(err) => {
                for line in err.messages {
                    eprintln!("{line}");
                }
                return InterpretResult::CompileError;
            }
        };
        self.run_chunk(chunk)
    }

    fn run_chunk(&mut self, chunk: Chunk) -> InterpretResult {
        self.reset_stack();
        let function_ref = self.load_function("", 0, 0, &chunk);
        let closure_ref =
            self.heap.alloc(Obj::Closure(ClosureObj { function: function_ref, upvalues: Vec::new() }));
        if self.push(Value::Obj(closure_ref)).is_err() {
            return InterpretResult::RuntimeError;
        }
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base: 0 });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(e) => {
                eprintln!("{}", e.message);
                eprint!("{}", e.trace);
                self.reset_stack();
                InterpretResult::RuntimeError
            }
        }
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    // ---------------- chunk loading: IR -> heap objects ----------------

    /// Materializes a compiled [`Chunk`] into a heap `Function` object:
    /// interns its name, and recursively turns every constant (strings,
    /// nested function bodies) into a runtime [`Value`] once, up front.
    fn load_function(&mut self, name: &str, arity: u8, upvalue_count: u8, chunk: &Chunk) -> ObjRef {
        let name_ref = if name.is_empty() { None } else { Some(self.heap.intern(name)) };
        let mut consts = Vec::with_capacity(chunk.consts.len());
        for cv in chunk.consts.iter() {
            let v = self.materialize_const(cv);
            consts.push(v);
        }
        self.heap.alloc(Obj::Function(FunctionObj {
            name: name_ref,
            arity,
            upvalue_count,
            chunk: chunk.clone(),
            consts,
        }))
    }

    fn materialize_const(&mut self, cv: &ConstValue) -> Value {
        match cv {
            ConstValue::Null => Value::Nil,
            ConstValue::Bool(b) => Value::Bool(*b),
            ConstValue::Number(n) => Value::Number(*n),
            ConstValue::Str(s) => Value::Obj(self.heap.intern(s)),
            ConstValue::Function { name, arity, upvalue_count, chunk } => {
                Value::Obj(self.load_function(name, *arity, *upvalue_count, chunk))
            }
        }
    }

    // ---------------- stack primitives ----------------

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| self.runtime_error("Stack underflow."))
    }

    fn peek(&self, depth_from_top: usize) -> Result<&Value, RuntimeError> {
        let len = self.stack.len();
        if depth_from_top >= len {
            return Err(RuntimeError { message: "Stack underflow.".into(), trace: String::new() });
        }
        Ok(&self.stack[len - 1 - depth_from_top])
    }

    // ---------------- GC ----------------

    fn collect_if_needed(&mut self) {
        if self.stress_gc || self.heap.bytes_allocated > self.heap.next_gc {
            gc::collect(self);
        }
    }

    // ---------------- dispatch loop ----------------

    fn fetch(&mut self) -> Option<Op> {
        let frame = self.frames.last_mut()?;
        let function_ref = match self.heap.get(frame.closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!("frame.closure is always a Closure"),
        };
        let op = match self.heap.get(function_ref) {
            Obj::Function(f) => f.chunk.ops.get(frame.ip).cloned(),
            _ => unreachable!("closure.function is always a Function"),
        };
        if op.is_some() {
            frame.ip += 1;
        }
        op
    }

    fn current_const(&self, ix: u32) -> Value {
        let frame = self.frames.last().expect("run() always has a frame");
        let function_ref = match self.heap.get(frame.closure) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        match self.heap.get(function_ref) {
            Obj::Function(f) => f.consts[ix as usize],
            _ => unreachable!(),
        }
    }

    fn const_str(&self, ix: u32) -> ObjRef {
        match self.current_const(ix) {
            Value::Obj(r) => r,
            _ => unreachable!("name/identifier constants are always strings"),
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            self.collect_if_needed();
            let op = match self.fetch() {
                Some(op) => op,
                None => return Ok(()),
            };
            if self.trace {
                self.trace_before(&op);
            }
            if self.execute(op)? == Flow::Halt {
                return Ok(());
            }
        }
    }

    /// Prints the current stack and the instruction about to execute, in
    /// clox's `--trace` style. `frame.ip` has already been advanced past
    /// `op` by [`Vm::fetch`], so the printed pc is `ip - 1`.
    fn trace_before(&self, op: &Op) {
        let mut stack_line = String::from("          ");
        for v in &self.stack {
            stack_line.push_str(&format!("[ {} ]", v.display(&self.heap)));
        }
        eprintln!("{stack_line}");
        let pc = self.frames.last().map(|f| f.ip.saturating_sub(1)).unwrap_or(0);
        eprintln!("{pc:04} {op}");
    }

    fn execute(&mut self, op: Op) -> Result<Flow, RuntimeError> {
        match op {
            Op::Constant(ix) => self.push(self.current_const(ix))?,
            Op::Nil => self.push(Value::Nil)?,
            Op::True => self.push(Value::Bool(true))?,
            Op::False => self.push(Value::Bool(false))?,
            Op::Pop => {
                self.pop()?;
            }

            Op::GetLocal(slot) => {
                let base = self.frames.last().unwrap().slots_base;
                let v = self.stack[base + slot as usize];
                self.push(v)?;
            }
            Op::SetLocal(slot) => {
                let base = self.frames.last().unwrap().slots_base;
                let v = *self.peek(0)?;
                self.stack[base + slot as usize] = v;
            }
            Op::GetGlobal(ix) => {
                let name = self.const_str(ix);
                match self.globals.get(&self.heap, name) {
                    Some(v) => {
                        let v = *v;
                        self.push(v)?;
                    }
                    None => {
                        let msg = format!(
                            "Undefined variable '{}'.",
                            self.heap.as_str(name).unwrap_or("?")
                        );
                        return Err(self.runtime_error(msg));
                    }
                }
            }
            Op::DefineGlobal(ix) => {
                let name = self.const_str(ix);
                let v = self.pop()?;
                self.globals.set(&self.heap, name, v);
            }
            Op::SetGlobal(ix) => {
                let name = self.const_str(ix);
                let v = *self.peek(0)?;
                if self.globals.set(&self.heap, name, v) {
                    self.globals.delete(&self.heap, name);
                    let msg = format!(
                        "Undefined variable '{}'.",
                        self.heap.as_str(name).unwrap_or("?")
                    );
                    return Err(self.runtime_error(msg));
                }
            }
            Op::GetUpvalue(slot) => {
                let up_ref = self.current_upvalue(slot);
                let v = self.read_upvalue(up_ref);
                self.push(v)?;
            }
            Op::SetUpvalue(slot) => {
                let up_ref = self.current_upvalue(slot);
                let v = *self.peek(0)?;
                self.write_upvalue(up_ref, v);
            }
            Op::GetProperty(ix) => self.op_get_property(ix)?,
            Op::SetProperty(ix) => self.op_set_property(ix)?,
            Op::GetSuper(ix) => self.op_get_super(ix)?,

            Op::Equal => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::Bool(a.values_equal(&b)))?;
            }
            Op::Greater => {
                let (a, b) = self.pop_two_numbers()?;
                self.push(Value::Bool(a > b))?;
            }
            Op::Less => {
                let (a, b) = self.pop_two_numbers()?;
                self.push(Value::Bool(a < b))?;
            }
            Op::Add => self.op_add()?,
            Op::Subtract => {
                let (a, b) = self.pop_two_numbers()?;
                self.push(Value::Number(a - b))?;
            }
            Op::Multiply => {
                let (a, b) = self.pop_two_numbers()?;
                self.push(Value::Number(a * b))?;
            }
            Op::Divide => {
                let (a, b) = self.pop_two_numbers()?;
                self.push(Value::Number(a / b))?;
            }
            Op::Not => {
                let v = self.pop()?;
                self.push(Value::Bool(!v.is_truthy()))?;
            }
            Op::Negate => {
                let v = self.pop()?;
                match v {
                    Value::Number(n) => self.push(Value::Number(-n))?,
                    _ => return Err(self.runtime_error("Operand must be a number.")),
                }
            }

            Op::Print => {
                let v = self.pop()?;
                let text = v.display(&self.heap);
                self.host.print(&text);
            }

            Op::Jump(target) => self.frames.last_mut().unwrap().ip = target as usize,
            Op::JumpIfFalse(target) => {
                if !self.peek(0)?.is_truthy() {
                    self.frames.last_mut().unwrap().ip = target as usize;
                }
            }
            Op::Loop(target) => self.frames.last_mut().unwrap().ip = target as usize,

            Op::Call(argc) => {
                let argc = argc as usize;
                let callee = *self.peek(argc)?;
                self.call_value(callee, argc)?;
            }
            Op::Invoke(ix, argc) => self.op_invoke(ix, argc as usize)?,
            Op::SuperInvoke(ix, argc) => self.op_super_invoke(ix, argc as usize)?,

            Op::Closure(ix, upvalues) => self.op_closure(ix, &upvalues)?,
            Op::CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues(top);
                self.pop()?;
            }
            Op::Return => return self.op_return(),

            Op::Class(ix) => {
                let name = self.const_str(ix);
                let r = self.heap.alloc(Obj::Class(ClassObj { name, methods: Table::new() }));
                self.push(Value::Obj(r))?;
            }
            Op::Inherit => self.op_inherit()?,
            Op::Method(ix) => self.op_method(ix)?,
        }
        Ok(Flow::Continue)
    }

    // ---------------- arithmetic helpers ----------------

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok((x, y)),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn op_add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            (Value::Obj(ra), Value::Obj(rb))
                if self.heap.as_str(ra).is_some() && self.heap.as_str(rb).is_some() =>
            {
                let mut s = self.heap.as_str(ra).unwrap().to_string();
                s.push_str(self.heap.as_str(rb).unwrap());
                let r = self.heap.intern(&s);
                self.push(Value::Obj(r))
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.")),
        }
    }

    // ---------------- upvalues ----------------

    fn current_upvalue(&self, slot: u8) -> ObjRef {
        let closure_ref = self.frames.last().unwrap().closure;
        match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.upvalues[slot as usize],
            _ => unreachable!(),
        }
    }

    fn read_upvalue(&self, up_ref: ObjRef) -> Value {
        match self.heap.get(up_ref) {
            Obj::Upvalue(UpvalueState::Open(slot)) => self.stack[*slot],
            Obj::Upvalue(UpvalueState::Closed(v)) => *v,
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, up_ref: ObjRef, value: Value) {
        let slot_if_open = match self.heap.get(up_ref) {
            Obj::Upvalue(UpvalueState::Open(s)) => Some(*s),
            Obj::Upvalue(UpvalueState::Closed(_)) => None,
            _ => unreachable!(),
        };
        match slot_if_open {
            Some(slot) => self.stack[slot] = value,
            None => {
                if let Obj::Upvalue(state) = self.heap.get_mut(up_ref) {
                    *state = UpvalueState::Closed(value);
                }
            }
        }
    }

    /// Finds or creates the open upvalue observing `stack_slot`, keeping
    /// `open_upvalues` sorted strictly descending by the slot it observes.
    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, &up_ref) in self.open_upvalues.iter().enumerate() {
            let loc = match self.heap.get(up_ref) {
                Obj::Upvalue(UpvalueState::Open(l)) => *l,
                _ => unreachable!(),
            };
            if loc == stack_slot {
                return up_ref;
            }
            if loc < stack_slot {
                insert_at = i;
                break;
            }
        }
        let new_ref = self.heap.alloc(Obj::Upvalue(UpvalueState::Open(stack_slot)));
        self.open_upvalues.insert(insert_at, new_ref);
        new_ref
    }

    /// Closes every open upvalue observing a slot `>= limit`.
    fn close_upvalues(&mut self, limit: usize) {
        while let Some(&up_ref) = self.open_upvalues.first() {
            let loc = match self.heap.get(up_ref) {
                Obj::Upvalue(UpvalueState::Open(l)) => *l,
                _ => unreachable!(),
            };
            if loc < limit {
                break;
            }
            let value = self.stack[loc];
            if let Obj::Upvalue(state) = self.heap.get_mut(up_ref) {
                *state = UpvalueState::Closed(value);
            }
            self.open_upvalues.remove(0);
        }
    }

    fn op_closure(&mut self, func_ix: u32, descs: &[UpvalueDesc]) -> Result<(), RuntimeError> {
        let function_ref = match self.current_const(func_ix) {
            Value::Obj(r) => r,
            _ => unreachable!("closure constant is always a Function"),
        };
        let mut upvalues = Vec::with_capacity(descs.len());
        for d in descs {
            let up_ref = if d.is_local {
                let base = self.frames.last().unwrap().slots_base;
                self.capture_upvalue(base + d.index as usize)
            } else {
                let closure_ref = self.frames.last().unwrap().closure;
                match self.heap.get(closure_ref) {
                    Obj::Closure(c) => c.upvalues[d.index as usize],
                    _ => unreachable!(),
                }
            };
            upvalues.push(up_ref);
        }
        let r = self.heap.alloc(Obj::Closure(ClosureObj { function: function_ref, upvalues }));
        self.push(Value::Obj(r))
    }

    // ---------------- calls ----------------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        let r = match callee {
            Value::Obj(r) => r,
            _ => return Err(self.runtime_error("Can only call functions and classes.")),
        };
        match self.heap.get(r) {
            Obj::Closure(_) => self.call_closure(r, argc),
            Obj::Class(_) => self.call_class(r, argc),
            Obj::BoundMethod(b) => {
                let receiver = b.receiver;
                let method = b.method;
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_closure(method, argc)
            }
            Obj::Native(n) => {
                let arity = n.arity as usize;
                let func = n.func;
                if argc != arity {
                    return Err(self
                        .runtime_error(format!("Expected {arity} arguments but got {argc}.")));
                }
                let args_start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = func(&args).map_err(|msg| self.runtime_error(msg))?;
                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let function_ref = match self.heap.get(closure_ref) {
            Obj::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let arity = match self.heap.get(function_ref) {
            Obj::Function(f) => f.arity,
            _ => unreachable!(),
        };
        if argc != arity as usize {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slots_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, slots_base });
        Ok(())
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let instance_ref =
            self.heap.alloc(Obj::Instance(InstanceObj { class: class_ref, fields: Table::new() }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance_ref);

        let init = self.init_string.unwrap();
        let initializer = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&self.heap, init).copied(),
            _ => unreachable!(),
        };
        match initializer {
            Some(Value::Obj(init_closure)) => self.call_closure(init_closure, argc),
            _ => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                }
                Ok(())
            }
        }
    }

    fn op_invoke(&mut self, name_ix: u32, argc: usize) -> Result<(), RuntimeError> {
        let name = self.const_str(name_ix);
        let receiver = *self.peek(argc)?;
        let inst_ref = match receiver {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };

        let field = match self.heap.get(inst_ref) {
            Obj::Instance(i) => i.fields.get(&self.heap, name).copied(),
            _ => unreachable!(),
        };
        if let Some(v) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = v;
            return self.call_value(v, argc);
        }

        let class_ref = match self.heap.get(inst_ref) {
            Obj::Instance(i) => i.class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class_ref, name, argc)
    }

    fn op_super_invoke(&mut self, name_ix: u32, argc: usize) -> Result<(), RuntimeError> {
        let name = self.const_str(name_ix);
        let superclass = self.pop()?;
        let super_ref = match superclass {
            Value::Obj(r) => r,
            _ => unreachable!("superclass operand is always a Class"),
        };
        self.invoke_from_class(super_ref, name, argc)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name: ObjRef, argc: usize) -> Result<(), RuntimeError> {
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&self.heap, name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(closure_ref)) => self.call_closure(closure_ref, argc),
            _ => {
                let msg = format!("Undefined property '{}'.", self.heap.as_str(name).unwrap_or("?"));
                Err(self.runtime_error(msg))
            }
        }
    }

    fn op_return(&mut self) -> Result<Flow, RuntimeError> {
        let result = self.pop()?;
        let slots_base = self.frames.last().unwrap().slots_base;
        self.close_upvalues(slots_base);
        self.frames.pop();
        if self.frames.is_empty() {
            self.stack.clear();
            return Ok(Flow::Halt);
        }
        self.stack.truncate(slots_base);
        self.push(result)?;
        Ok(Flow::Continue)
    }

    // ---------------- properties / classes ----------------

    fn op_get_property(&mut self, name_ix: u32) -> Result<(), RuntimeError> {
        let name = self.const_str(name_ix);
        let inst_val = self.pop()?;
        let inst_ref = match inst_val {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have properties.")),
        };

        let field = match self.heap.get(inst_ref) {
            Obj::Instance(i) => i.fields.get(&self.heap, name).copied(),
            _ => unreachable!(),
        };
        if let Some(v) = field {
            return self.push(v);
        }

        let class_ref = match self.heap.get(inst_ref) {
            Obj::Instance(i) => i.class,
            _ => unreachable!(),
        };
        let method = match self.heap.get(class_ref) {
            Obj::Class(c) => c.methods.get(&self.heap, name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let bound = self
                    .heap
                    .alloc(Obj::BoundMethod(BoundMethodObj { receiver: inst_val, method: method_ref }));
                self.push(Value::Obj(bound))
            }
            _ => {
                let msg = format!("Undefined property '{}'.", self.heap.as_str(name).unwrap_or("?"));
                Err(self.runtime_error(msg))
            }
        }
    }

    fn op_set_property(&mut self, name_ix: u32) -> Result<(), RuntimeError> {
        let name = self.const_str(name_ix);
        let value = self.pop()?;
        let inst_val = self.pop()?;
        let inst_ref = match inst_val {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Instance(_)) => r,
            _ => return Err(self.runtime_error("Only instances have fields.")),
        };
        let mut fields = self.take_instance_fields(inst_ref);
        fields.set(&self.heap, name, value);
        self.put_instance_fields(inst_ref, fields);
        self.push(value)
    }

    fn op_get_super(&mut self, name_ix: u32) -> Result<(), RuntimeError> {
        let name = self.const_str(name_ix);
        let superclass = self.pop()?;
        let receiver = self.pop()?;
        let super_ref = match superclass {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let method = match self.heap.get(super_ref) {
            Obj::Class(c) => c.methods.get(&self.heap, name).copied(),
            _ => unreachable!(),
        };
        match method {
            Some(Value::Obj(method_ref)) => {
                let bound =
                    self.heap.alloc(Obj::BoundMethod(BoundMethodObj { receiver, method: method_ref }));
                self.push(Value::Obj(bound))
            }
            _ => {
                let msg = format!("Undefined property '{}'.", self.heap.as_str(name).unwrap_or("?"));
                Err(self.runtime_error(msg))
            }
        }
    }

    fn op_inherit(&mut self) -> Result<(), RuntimeError> {
        let sub_val = self.pop()?;
        let super_val = *self.peek(0)?;
        let super_ref = match super_val {
            Value::Obj(r) if matches!(self.heap.get(r), Obj::Class(_)) => r,
            _ => return Err(self.runtime_error("Superclass must be a class.")),
        };
        let sub_ref = match sub_val {
            Value::Obj(r) => r,
            _ => unreachable!(),
        };
        let entries: Vec<(ObjRef, Value)> = match self.heap.get(super_ref) {
            Obj::Class(c) => c.methods.iter().map(|(k, v)| (k, *v)).collect(),
            _ => unreachable!(),
        };
        let mut methods = self.take_class_methods(sub_ref);
        for (k, v) in entries {
            methods.set(&self.heap, k, v);
        }
        self.put_class_methods(sub_ref, methods);
        Ok(())
    }

    fn op_method(&mut self, name_ix: u32) -> Result<(), RuntimeError> {
        let name = self.const_str(name_ix);
        let closure = self.pop()?;
        let class_ref = match *self.peek(0)? {
            Value::Obj(r) => r,
            _ => unreachable!("OP_METHOD always runs with a Class on the stack"),
        };
        let mut methods = self.take_class_methods(class_ref);
        methods.set(&self.heap, name, closure);
        self.put_class_methods(class_ref, methods);
        Ok(())
    }

    // `Table`'s probing needs `&Heap` for hashing, but the table itself
    // lives *inside* a heap object — these swap it out so the hashing
    // borrow and the owning `get_mut` borrow never overlap.
    fn take_class_methods(&mut self, class_ref: ObjRef) -> Table<Value> {
        match self.heap.get_mut(class_ref) {
            Obj::Class(c) => std::mem::take(&mut c.methods),
            _ => unreachable!(),
        }
    }

    fn put_class_methods(&mut self, class_ref: ObjRef, methods: Table<Value>) {
        if let Obj::Class(c) = self.heap.get_mut(class_ref) {
            c.methods = methods;
        }
    }

    fn take_instance_fields(&mut self, inst_ref: ObjRef) -> Table<Value> {
        match self.heap.get_mut(inst_ref) {
            Obj::Instance(i) => std::mem::take(&mut i.fields),
            _ => unreachable!(),
        }
    }

    fn put_instance_fields(&mut self, inst_ref: ObjRef, fields: Table<Value>) {
        if let Obj::Instance(i) = self.heap.get_mut(inst_ref) {
            i.fields = fields;
        }
    }

    // ---------------- error reporting ----------------

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let mut trace = String::new();
        for frame in self.frames.iter().rev() {
            let function_ref = match self.heap.get(frame.closure) {
                Obj::Closure(c) => c.function,
                _ => continue,
            };
            if let Obj::Function(f) = self.heap.get(function_ref) {
                let pc = frame.ip.saturating_sub(1) as u32;
                let line = f.chunk.lines.line_for_pc(pc).unwrap_or(0);
                let name = match f.name {
                    Some(n) => format!("{}()", self.heap.as_str(n).unwrap_or("?")),
                    None => "script".to_string(),
                };
                trace.push_str(&format!("[line {line}] in {name}\n"));
            }
        }
        RuntimeError { message, trace }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn native_clock(_args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(PROCESS_START.elapsed().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(src: &str) -> InterpretResult {
        let mut vm = Vm::new();
        vm.interpret(src)
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run_ok("print 1 + 2 * 3;"), InterpretResult::Ok);
    }

    #[test]
    fn string_concat() {
        assert_eq!(
            run_ok("var a = \"hi\"; var b = \" there\"; print a + b;"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn closures_capture_by_reference() {
        assert_eq!(
            run_ok(
                "fun outer(){var x = 1; fun inner(){x = x + 1; return x;} return inner;} \
                 var c = outer(); print c(); print c(); print c();"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn classes_inheritance_and_super() {
        assert_eq!(
            run_ok(
                "class A{greet(){print \"A\";}} \
                 class B < A{greet(){super.greet(); print \"B\";}} \
                 B().greet();"
            ),
            InterpretResult::Ok
        );
    }

    #[test]
    fn initializer_and_this() {
        assert_eq!(
            run_ok("class C{init(n){this.n=n;} sq(){return this.n*this.n;}} print C(6).sq();"),
            InterpretResult::Ok
        );
    }

    #[test]
    fn runtime_error_on_bad_add() {
        assert_eq!(run_ok("print \"a\" + 1;"), InterpretResult::RuntimeError);
    }

    #[test]
    fn arity_mismatch_is_runtime_error() {
        assert_eq!(run_ok("fun f(){return 1;} f(1);"), InterpretResult::RuntimeError);
    }

    #[test]
    fn stress_gc_survives_closures_and_classes() {
        let mut vm = Vm::new().with_stress_gc(true);
        let result = vm.interpret(
            "class Counter { init() { this.n = 0; } \
             bump() { this.n = this.n + 1; return this.n; } } \
             var c = Counter(); \
             fun make(x) { fun get() { return x; } return get; } \
             var g = make(\"kept alive\"); \
             print c.bump(); print c.bump(); print g();",
        );
        assert_eq!(result, InterpretResult::Ok);
    }

    #[derive(Default)]
    struct CapturingHost(std::rc::Rc<std::cell::RefCell<Vec<String>>>);

    impl Host for CapturingHost {
        fn print(&mut self, line: &str) {
            self.0.borrow_mut().push(line.to_string());
        }
    }

    fn run_captured(src: &str) -> (InterpretResult, Vec<String>) {
        let lines = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut vm = Vm::with_host(Box::new(CapturingHost(lines.clone())));
        let result = vm.interpret(src);
        let printed = lines.borrow().clone();
        (result, printed)
    }

    #[test]
    fn prints_exact_text_for_arithmetic() {
        let (result, printed) = run_captured("print 1 + 2 * 3;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(printed, vec!["7"]);
    }

    #[test]
    fn prints_exact_text_for_string_concat() {
        let (result, printed) = run_captured("var a = \"hi\"; var b = \" there\"; print a + b;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(printed, vec!["hi there"]);
    }

    #[test]
    fn prints_exact_text_for_closure_counter() {
        let (result, printed) = run_captured(
            "fun outer(){var x = 1; fun inner(){x = x + 1; return x;} return inner;} \
             var c = outer(); print c(); print c(); print c();",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(printed, vec!["2", "3", "4"]);
    }

    #[test]
    fn prints_exact_text_for_inheritance_and_super() {
        let (result, printed) = run_captured(
            "class A{greet(){print \"A\";}} \
             class B < A{greet(){super.greet(); print \"B\";}} \
             B().greet();",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(printed, vec!["A", "B"]);
    }

    #[test]
    fn prints_exact_text_for_initializer_and_this() {
        let (result, printed) =
            run_captured("class C{init(n){this.n=n;} sq(){return this.n*this.n;}} print C(6).sq();");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(printed, vec!["36"]);
    }

    #[test]
    fn prints_nil_false_true_literals() {
        let (result, printed) = run_captured("print nil; print false; print true;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(printed, vec!["nil", "false", "true"]);
    }

    #[test]
    fn equality_and_ordering_are_consistent() {
        let (result, printed) = run_captured(
            "print 1 == 1; print !(1 != 1); \
             print 2 < 3; print 3 > 2; \
             print 2 <= 2; print !(2 > 2); \
             print \"a\" == \"a\"; print nil == nil;",
        );
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(
            printed,
            vec!["true", "true", "true", "true", "true", "true", "true", "true"]
        );
    }

    #[test]
    fn gc_reclaims_unreachable_objects_under_stress() {
        let mut vm = Vm::new().with_stress_gc(true);
        let result = vm.interpret(
            "fun make(n) { return n; } \
             var i = 0; \
             while (i < 200) { \
                 var s = make(i) + 0; \
                 i = i + 1; \
             } \
             print i;",
        );
        assert_eq!(result, InterpretResult::Ok);
        // Only long-lived state remains reachable: globals (incl. the
        // `clock` native) plus whatever the loop's final iteration still
        // has on the stack. The 200 throwaway closures/strings allocated
        // along the way must not accumulate.
        assert!(
            vm.heap.object_count() < 20,
            "expected stress GC to reclaim throwaway allocations, found {} live objects",
            vm.heap.object_count()
        );
    }

    #[test]
    fn open_upvalues_stay_sorted_strictly_descending_by_slot() {
        let mut vm = Vm::new();
        // Five stack values to be captured out of insertion order, as
        // `OP_CLOSURE` does when a nested function closes over locals
        // declared at various points in an enclosing scope.
        for i in 0..5 {
            vm.stack.push(Value::Number(i as f64));
        }
        for &slot in &[1usize, 3, 0, 4, 2] {
            vm.capture_upvalue(slot);
        }

        let slot_of = |vm: &Vm, r: ObjRef| match vm.heap.get(r) {
            Obj::Upvalue(UpvalueState::Open(slot)) => *slot,
            _ => unreachable!("freshly captured upvalues are always Open"),
        };
        let slots: Vec<usize> = vm.open_upvalues.iter().map(|&r| slot_of(&vm, r)).collect();
        assert_eq!(slots, vec![4, 3, 2, 1, 0]);

        // Re-capturing an already-open slot must return the existing
        // upvalue rather than inserting a duplicate.
        let again = vm.capture_upvalue(3);
        assert_eq!(vm.open_upvalues.iter().filter(|&&r| r == again).count(), 1);
        assert_eq!(vm.open_upvalues.len(), 5);

        // Closing everything at or above slot 2 should drop exactly the
        // upvalues observing slots 4, 3, 2, leaving 1 and 0 open.
        vm.close_upvalues(2);
        let remaining: Vec<usize> =
            vm.open_upvalues.iter().map(|&r| slot_of(&vm, r)).collect();
        assert_eq!(remaining, vec![1, 0]);
        for pair in vm.open_upvalues.windows(2) {
            assert!(slot_of(&vm, pair[0]) > slot_of(&vm, pair[1]));
        }
    }
}
