//! The bytecode virtual machine: register-window value stack, dispatch
//! loop with inline caches, cooperative fibers and the embedder
//! surface.
//!
//! The compiler front end is an external collaborator; it hands the VM
//! compiled [`Chunk`]s. The VM owns the instruction buffer after load
//! because inline caching and loop specialisation rewrite opcode bytes
//! in place.

pub mod embed;
mod error;
mod fiber;
mod host;
mod interpreter;
mod methods;
mod ops;
mod stack;

use std::any::Any;
use std::collections::HashMap;

use bytecode::{Chunk, ChunkString, DebugSym, FuncInfo};
use heap::{GcStats, Heap};
use object::{
    frame, KeyContext, TypeId, TYPE_ASTRING, TYPE_STRING_SLICE, TYPE_USTRING,
};
use tracing::trace;

pub use embed::{CompileFail, Compiler, PrintFn};
pub use error::{EvalError, PanicKind, ResultCode, RuntimePanic};
pub use host::{
    HostFuncFn, HostMethodFn, MethodEntry, Module, ModuleLoaderFn,
    ModuleResolverFn, ModuleSource, StaticFuncEntry,
};
pub use object::{FiberState, Value};

/// Embedder-tunable settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Value-stack capacity in slots.
    pub stack_slots: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_slots: 10_240,
        }
    }
}

pub struct VM {
    pub heap: Heap,

    // Execution state. `stack` is always the active fiber's buffer;
    // suspended fibers own theirs.
    pub(crate) stack: Box<[Value]>,
    pub(crate) fp: usize,
    pub(crate) pc: usize,
    pub(crate) cur_fiber: Value,
    pub(crate) main_saved: Option<fiber::SavedCtx>,

    // Loaded program.
    pub(crate) ops: Vec<u8>,
    pub(crate) consts: Vec<Value>,
    pub(crate) strings: Vec<ChunkString>,
    pub(crate) funcs: Vec<FuncInfo>,
    pub(crate) func_by_pc: HashMap<u32, u16>,
    pub(crate) method_names: Vec<String>,
    pub(crate) static_syms: Vec<String>,
    pub(crate) static_vars: Vec<Value>,
    pub(crate) static_funcs: Vec<Option<StaticFuncEntry>>,
    pub(crate) error_syms: Vec<String>,
    pub(crate) err_out_of_bounds: u32,
    pub(crate) err_invalid_rune: u32,
    pub(crate) debug: Vec<DebugSym>,
    pub(crate) main_retained: Vec<u8>,

    // Host bindings.
    pub(crate) methods: host::MethodTable,
    pub(crate) fields: host::FieldTable,
    pub(crate) host_static_funcs: HashMap<String, (HostFuncFn, u8)>,
    pub(crate) host_static_vars: HashMap<String, Value>,
    pub(crate) modules: Vec<Module>,
    pub(crate) resolver: ModuleResolverFn,
    pub(crate) loader: Option<ModuleLoaderFn>,
    pub(crate) compiler: Option<Box<dyn Compiler>>,
    pub(crate) print: Option<PrintFn>,
    pub(crate) user_data: Option<Box<dyn Any>>,
    pub(crate) last_error: Option<String>,
    pub(crate) verbose: bool,
    pub(crate) config: Config,
}

impl VM {
    pub fn new(config: Config) -> Self {
        let stack = vec![Value::NONE; config.stack_slots].into_boxed_slice();
        let mut vm = Self {
            heap: Heap::new(),
            stack,
            fp: 0,
            pc: 0,
            cur_fiber: Value::NONE,
            main_saved: None,
            ops: Vec::new(),
            consts: Vec::new(),
            strings: Vec::new(),
            funcs: Vec::new(),
            func_by_pc: HashMap::new(),
            method_names: Vec::new(),
            static_syms: Vec::new(),
            static_vars: Vec::new(),
            static_funcs: Vec::new(),
            error_syms: Vec::new(),
            err_out_of_bounds: 0,
            err_invalid_rune: 0,
            debug: Vec::new(),
            main_retained: Vec::new(),
            methods: host::MethodTable::default(),
            fields: host::FieldTable::default(),
            host_static_funcs: HashMap::new(),
            host_static_vars: HashMap::new(),
            modules: Vec::new(),
            resolver: host::default_resolver,
            loader: None,
            compiler: None,
            print: None,
            user_data: None,
            last_error: None,
            verbose: false,
            config,
        };
        // Built-in error symbols exist before any chunk is loaded; a
        // load rebuilds the table and re-interns them.
        vm.error_syms =
            vec!["OutOfBounds".to_string(), "InvalidRune".to_string()];
        vm.err_out_of_bounds = 0;
        vm.err_invalid_rune = 1;
        methods::register_builtins(&mut vm);
        vm
    }

    // ── Program loading ────────────────────────────────────────────

    /// Installs a chunk: takes over its instruction buffer (dispatch
    /// self-modifies it), relocates symbol-table state and sets up the
    /// root frame. Statics from a previously loaded chunk are released.
    pub fn load_chunk(&mut self, chunk: Chunk) {
        self.release_statics();

        let Chunk {
            consts,
            ops,
            strings,
            funcs,
            method_syms,
            static_syms,
            mut error_syms,
            main_stack_size,
            main_retained_locals,
            debug,
        } = chunk;

        self.consts = consts;
        self.ops = ops;
        self.strings = strings;
        self.method_names = method_syms;
        self.debug = debug;
        self.main_retained = main_retained_locals;

        self.func_by_pc = funcs
            .iter()
            .enumerate()
            .map(|(i, f)| (f.pc, i as u16))
            .collect();

        // Built-in error symbols are always addressable.
        self.err_out_of_bounds = intern_sym(&mut error_syms, "OutOfBounds");
        self.err_invalid_rune = intern_sym(&mut error_syms, "InvalidRune");
        self.error_syms = error_syms;

        // Bind static symbols: script functions from the chunk's table,
        // host functions and vars by name.
        self.static_vars = vec![Value::NONE; static_syms.len()];
        self.static_funcs = vec![None; static_syms.len()];
        for (i, f) in funcs.iter().enumerate() {
            if f.sym != u16::MAX {
                self.static_funcs[f.sym as usize] =
                    Some(StaticFuncEntry::Script { func_id: i as u16 });
            }
        }
        for (i, name) in static_syms.iter().enumerate() {
            if let Some(&(func, num_params)) =
                self.host_static_funcs.get(name)
            {
                self.static_funcs[i] = Some(StaticFuncEntry::Host {
                    func,
                    num_params,
                });
            }
            if let Some(&v) = self.host_static_vars.get(name) {
                self.heap.retain(v);
                self.static_vars[i] = v;
            }
        }
        self.static_syms = static_syms;
        self.funcs = funcs;

        // Root frame: four header slots, then `main_stack_size - 4`
        // locals initialised to none.
        self.stack.fill(Value::NONE);
        self.fp = 0;
        self.pc = 0;
        self.cur_fiber = Value::NONE;
        self.main_saved = None;
        self.stack[1] =
            frame::pack_frame_meta(1, true, main_stack_size, frame::NO_FUNC);
        self.stack[2] = frame::pc_to_value(0);
        self.stack[3] = frame::fp_to_value(0);

        trace!(target: "vm", ops = self.ops.len(), consts = self.consts.len(), "chunk loaded");
    }

    /// Executes the loaded chunk from the top. On success the root
    /// frame's retained locals are released, so a clean program leaves
    /// the global refcount where it started.
    pub fn run(&mut self) -> Result<Value, RuntimePanic> {
        let result = interpreter::exec(self);
        if result.is_ok() {
            for i in 0..self.main_retained.len() {
                let slot = self.main_retained[i] as usize;
                let v = self.stack[slot];
                self.stack[slot] = Value::NONE;
                self.heap.release(v);
            }
        }
        result
    }

    pub fn run_chunk(
        &mut self,
        chunk: Chunk,
    ) -> Result<Value, RuntimePanic> {
        self.load_chunk(chunk);
        self.run()
    }

    fn release_statics(&mut self) {
        for i in 0..self.static_vars.len() {
            let v = self.static_vars[i];
            self.static_vars[i] = Value::NONE;
            self.heap.release(v);
        }
        for i in 0..self.static_funcs.len() {
            if let Some(StaticFuncEntry::Bound(v)) = self.static_funcs[i] {
                self.static_funcs[i] = None;
                self.heap.release(v);
            }
        }
    }

    // ── Reference counting & GC ────────────────────────────────────

    pub fn retain(&mut self, v: Value) {
        self.heap.retain(v);
    }

    pub fn release(&mut self, v: Value) {
        self.heap.release(v);
    }

    /// Sum of all live refcounts; zero after a clean teardown.
    pub fn global_rc(&self) -> i64 {
        self.heap.global_rc()
    }

    /// Runs the cycle collector over the current roots.
    pub fn perform_gc(&mut self) -> GcStats {
        let roots = self.gc_roots();
        self.heap.collect_cycles(&roots)
    }

    pub(crate) fn gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::new();
        let top = self.stack_top();
        roots.extend_from_slice(&self.stack[..top]);
        // While a fiber runs, the parked main stack is a root too;
        // parked fibers are heap objects and get traced instead.
        if let Some(saved) = &self.main_saved {
            let meta = saved.stack[saved.fp + 1];
            let top = (saved.fp + frame::frame_stack_size(meta) as usize)
                .min(saved.stack.len());
            roots.extend_from_slice(&saved.stack[..top]);
        }
        roots.extend_from_slice(&self.static_vars);
        for f in self.static_funcs.iter().flatten() {
            if let StaticFuncEntry::Bound(v) = f {
                roots.push(*v);
            }
        }
        roots.push(self.cur_fiber);
        for m in &self.modules {
            roots.extend(m.vars.values().copied());
        }
        roots
    }

    /// Current opcode byte at an instruction offset. Call sites start
    /// as the generic opcode and are rewritten in place by the inline
    /// caches, which this exposes for inspection.
    pub fn op_byte_at(&self, pc: usize) -> u8 {
        self.ops[pc]
    }

    /// One-past-the-end of the active frame.
    pub(crate) fn stack_top(&self) -> usize {
        if self.stack.is_empty() {
            return 0;
        }
        let size = frame::frame_stack_size(self.stack[self.fp + 1]) as usize;
        (self.fp + size).min(self.stack.len())
    }

    // ── Host registration ──────────────────────────────────────────

    /// Registers a user object type; returns its runtime id.
    pub fn register_object_type(
        &mut self,
        name: &str,
        num_fields: u16,
    ) -> TypeId {
        self.heap.types.add_object_type(name, num_fields)
    }

    pub fn register_method(
        &mut self,
        type_id: TypeId,
        name: &str,
        entry: MethodEntry,
    ) {
        self.methods.insert(type_id, name, entry);
    }

    pub fn register_field(&mut self, type_id: TypeId, name: &str, idx: u8) {
        self.fields.insert(type_id, name, idx);
    }

    /// Binds a host function to a static symbol name; takes effect at
    /// the next chunk load.
    pub fn register_func(
        &mut self,
        name: &str,
        func: HostFuncFn,
        num_params: u8,
    ) {
        self.host_static_funcs
            .insert(name.to_string(), (func, num_params));
    }

    /// Binds a value (retained per load) to a static symbol name.
    pub fn register_var(&mut self, name: &str, v: Value) {
        self.host_static_vars.insert(name.to_string(), v);
    }

    // ── Strings & symbols ──────────────────────────────────────────

    /// Bytes, ASCII-ness and rune count of any of the five string
    /// shapes; `None` for non-strings.
    pub fn string_view(&self, v: Value) -> Option<StringView<'_>> {
        if v.is_static_astring() {
            let s = self.strings.get(v.payload() as usize)?;
            return Some(StringView {
                bytes: &s.bytes,
                ascii: true,
                char_len: s.char_len,
            });
        }
        if v.is_static_ustring() {
            let s = self.strings.get(v.payload() as usize)?;
            return Some(StringView {
                bytes: &s.bytes,
                ascii: false,
                char_len: s.char_len,
            });
        }
        if !v.is_heap() {
            return None;
        }
        // SAFETY: live values point to live objects, which stay live at
        // least as long as this borrow of the VM; the references are
        // rebuilt from the raw pointer so they carry &self's lifetime
        // rather than the local value's.
        unsafe {
            match (*v.as_ptr()).type_id {
                TYPE_ASTRING => {
                    let s = &*(v.as_ptr() as *const object::Astring);
                    Some(StringView {
                        bytes: s.bytes(),
                        ascii: true,
                        char_len: s.len,
                    })
                }
                TYPE_USTRING => {
                    let s = &*(v.as_ptr() as *const object::Ustring);
                    Some(StringView {
                        bytes: s.bytes(),
                        ascii: false,
                        char_len: s.char_len,
                    })
                }
                TYPE_STRING_SLICE => {
                    let s = &*(v.as_ptr() as *const object::StringSlice);
                    Some(StringView {
                        bytes: s.bytes(),
                        ascii: s.ascii,
                        char_len: s.char_len,
                    })
                }
                _ => None,
            }
        }
    }

    // ── Aggregate accessors (embedder surface) ─────────────────────

    pub fn list_len(&self, v: Value) -> Option<usize> {
        (v.is_heap() && self.type_of(v) == object::TYPE_LIST).then(|| {
            // SAFETY: type id checked.
            unsafe { v.as_heap_ref::<object::List>().elems.len() }
        })
    }

    /// Element at `idx`, retained for the caller.
    pub fn list_get(&mut self, v: Value, idx: usize) -> Option<Value> {
        if !v.is_heap() || self.type_of(v) != object::TYPE_LIST {
            return None;
        }
        // SAFETY: type id checked.
        let elem =
            unsafe { v.as_heap_ref::<object::List>().elems.get(idx).copied() };
        if let Some(e) = elem {
            self.heap.retain(e);
        }
        elem
    }

    /// Appends `elem`; the list takes one reference.
    pub fn list_append(&mut self, v: Value, elem: Value) -> bool {
        if !v.is_heap() || self.type_of(v) != object::TYPE_LIST {
            return false;
        }
        self.heap.retain(elem);
        // SAFETY: type id checked.
        unsafe { v.as_heap_mut::<object::List>().elems.push(elem) };
        true
    }

    pub fn map_len(&self, v: Value) -> Option<usize> {
        (v.is_heap() && self.type_of(v) == object::TYPE_MAP).then(|| {
            // SAFETY: type id checked.
            unsafe { v.as_heap_ref::<object::Map>().inner.len() }
        })
    }

    /// Value for `key`, retained for the caller.
    pub fn map_get(&mut self, v: Value, key: Value) -> Option<Value> {
        if !v.is_heap() || self.type_of(v) != object::TYPE_MAP {
            return None;
        }
        let got = {
            // SAFETY: type id checked.
            let map = unsafe { v.as_heap_ref::<object::Map>() };
            let ctx = VmKeyContext { vm: self };
            map.inner.get(&ctx, key)
        };
        if let Some(g) = got {
            self.heap.retain(g);
        }
        got
    }

    /// Name of an error/tag symbol id.
    pub fn error_sym_name(&self, id: u32) -> &str {
        self.error_syms
            .get(id as usize)
            .map(|s| s.as_str())
            .unwrap_or("?")
    }

    /// Runtime type id of any value.
    pub fn type_of(&self, v: Value) -> TypeId {
        // SAFETY: live values point to live objects.
        unsafe { object::type_id(v) }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for VM {
    fn drop(&mut self) {
        self.release_statics();
        // Module tables own one reference per bound var; the name →
        // value bindings in `host_static_vars` own nothing (loads
        // retain per chunk).
        let mod_vars: Vec<Value> = self
            .modules
            .iter()
            .flat_map(|m| m.vars.values().copied())
            .collect();
        for v in mod_vars {
            self.heap.release(v);
        }
    }
}

/// Borrowed view of a string value's payload.
#[derive(Debug, Clone, Copy)]
pub struct StringView<'a> {
    pub bytes: &'a [u8],
    pub ascii: bool,
    pub char_len: u32,
}

impl StringView<'_> {
    pub fn as_str(&self) -> &str {
        // All string shapes hold valid UTF-8.
        core::str::from_utf8(self.bytes).expect("string payload not UTF-8")
    }
}

fn intern_sym(syms: &mut Vec<String>, name: &str) -> u32 {
    if let Some(i) = syms.iter().position(|s| s == name) {
        return i as u32;
    }
    syms.push(name.to_string());
    (syms.len() - 1) as u32
}

/// Map-key semantics: primitives by bit pattern, strings by content,
/// other heap objects by identity.
pub(crate) struct VmKeyContext<'a> {
    pub vm: &'a VM,
}

impl KeyContext for VmKeyContext<'_> {
    fn hash_key(&self, key: Value) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut h = std::collections::hash_map::DefaultHasher::new();
        if let Some(view) = self.vm.string_view(key) {
            view.bytes.hash(&mut h);
        } else {
            key.raw().hash(&mut h);
        }
        h.finish()
    }

    fn keys_equal(&self, a: Value, b: Value) -> bool {
        if a.raw() == b.raw() {
            return true;
        }
        match (self.vm.string_view(a), self.vm.string_view(b)) {
            (Some(x), Some(y)) => x.bytes == y.bytes,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vm_is_clean() {
        let vm = VM::new(Config::default());
        assert_eq!(vm.global_rc(), 0);
        assert_eq!(vm.stack.len(), 10_240);
    }

    #[test]
    fn string_view_resolves_every_shape() {
        let mut vm = VM::new(Config::default());
        let mut b = bytecode::ChunkBuilder::new();
        b.add_string_const("abc");
        b.add_string_const("🦊");
        b.end(4);
        vm.load_chunk(b.finish(8));

        let a = Value::static_astring(0);
        let u = Value::static_ustring(1);
        assert_eq!(vm.string_view(a).unwrap().as_str(), "abc");
        assert!(vm.string_view(a).unwrap().ascii);
        assert_eq!(vm.string_view(u).unwrap().char_len, 1);

        let h = vm.heap.new_string("heap").unwrap();
        assert_eq!(vm.string_view(h).unwrap().as_str(), "heap");
        vm.heap.release(h);

        assert!(vm.string_view(Value::from_integer(1)).is_none());
    }

    #[test]
    fn key_context_compares_strings_by_content() {
        let mut vm = VM::new(Config::default());
        let h1 = vm.heap.new_string("same").unwrap();
        let h2 = vm.heap.new_string("same").unwrap();
        let ctx = VmKeyContext { vm: &vm };
        assert!(ctx.keys_equal(h1, h2));
        assert_eq!(ctx.hash_key(h1), ctx.hash_key(h2));
        assert!(!ctx.keys_equal(h1, Value::from_integer(1)));
        vm.heap.release(h1);
        vm.heap.release(h2);
        assert_eq!(vm.global_rc(), 0);
    }
}
