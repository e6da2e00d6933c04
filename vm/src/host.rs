//! Host bindings: function pointer types, the method table and the
//! module registry the loader callbacks populate.

use std::collections::HashMap;

use object::{TypeId, Value};

use crate::VM;

/// A host function callable as a static function. Returns the result
/// value, or [`Value::PANIC`] to unwind the VM.
pub type HostFuncFn = fn(&mut VM, args: &[Value]) -> Value;

/// A host function callable as a method; the receiver arrives
/// separately from the remaining arguments.
pub type HostMethodFn = fn(&mut VM, recv: Value, args: &[Value]) -> Value;

/// Resolution target of a method symbol on a concrete receiver type.
#[derive(Debug, Clone, Copy)]
pub enum MethodEntry {
    Host { func: HostMethodFn, num_params: u8 },
    /// Bytecode function, by function-table id.
    Script { func_id: u16 },
}

/// Resolution target of a static function symbol.
#[derive(Debug, Clone, Copy)]
pub enum StaticFuncEntry {
    Host { func: HostFuncFn, num_params: u8 },
    Script { func_id: u16 },
    /// Rebound at run time to a lambda/closure value (retained).
    Bound(Value),
}

/// Method registry keyed by receiver type and symbol name. Call sites
/// resolve through the chunk's symbol table once, then the inline cache
/// takes over.
#[derive(Default)]
pub struct MethodTable {
    entries: HashMap<(TypeId, String), MethodEntry>,
}

impl MethodTable {
    pub fn insert(&mut self, type_id: TypeId, name: &str, entry: MethodEntry) {
        self.entries.insert((type_id, name.to_string()), entry);
    }

    pub fn get(&self, type_id: TypeId, name: &str) -> Option<MethodEntry> {
        self.entries.get(&(type_id, name.to_string())).copied()
    }
}

/// Field symbol registry: (receiver type, field symbol name) → slot
/// index inside the object.
#[derive(Default)]
pub struct FieldTable {
    entries: HashMap<(TypeId, String), u8>,
}

impl FieldTable {
    pub fn insert(&mut self, type_id: TypeId, name: &str, idx: u8) {
        self.entries.insert((type_id, name.to_string()), idx);
    }

    pub fn get(&self, type_id: TypeId, name: &str) -> Option<u8> {
        self.entries.get(&(type_id, name.to_string())).copied()
    }
}

/// One registered module: host functions and variables the compiler can
/// bind imports against, keyed by name.
#[derive(Default)]
pub struct Module {
    pub uri: String,
    pub funcs: HashMap<String, (HostFuncFn, u8)>,
    pub vars: HashMap<String, Value>,
}

/// Resolves an import specifier to a loadable URI. The default keeps
/// the specifier as-is.
pub type ModuleResolverFn =
    fn(vm: &VM, cur_uri: &str, spec: &str) -> Option<String>;

/// Loads a module by resolved URI: returns its source plus binding
/// callbacks to run after registration.
pub type ModuleLoaderFn = fn(vm: &mut VM, uri: &str) -> Option<ModuleSource>;

pub struct ModuleSource {
    pub src: String,
    /// Invoked with the fresh module id so the embedder can bind host
    /// funcs/vars into it.
    pub post_load: Option<fn(vm: &mut VM, mod_id: u32)>,
}

pub fn default_resolver(_vm: &VM, _cur: &str, spec: &str) -> Option<String> {
    Some(spec.to_string())
}
