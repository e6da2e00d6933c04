//! The runtime type table and the per-type size / trace / destruct
//! dispatch the heap consults when objects die or the collector walks
//! the graph.

use object::{
    frame, Astring, BoxObject, Closure, Dir, DirIter, Fiber, FiberState,
    File, HeapHeader, HostFunc, Lambda, List, ListIter, Map, MapIter,
    MetaType, Object, Pointer, RawString, RawStringSlice, StringSlice,
    TypeId, Ustring, Value, FIRST_USER_TYPE, TYPE_ASTRING, TYPE_BOX,
    TYPE_CLOSURE, TYPE_DIR, TYPE_DIR_ITER, TYPE_FIBER, TYPE_FILE,
    TYPE_HOST_FUNC, TYPE_LAMBDA, TYPE_LIST, TYPE_LIST_ITER, TYPE_MAP,
    TYPE_MAP_ITER, TYPE_METATYPE, TYPE_POINTER, TYPE_RAWSTRING,
    TYPE_RAWSTRING_SLICE, TYPE_STRING_SLICE, TYPE_USTRING,
};

use crate::heap::Heap;

/// How a destructor treats child references.
#[derive(Debug, Clone, Copy)]
pub enum DestructMode {
    /// Release children normally; `depth` bounds destructor recursion
    /// before the heap falls back to its deferred worklist.
    Normal { depth: u32 },
    /// Cycle-sweep: children condemned by the same sweep are skipped
    /// entirely, everything else is released normally.
    Sweep,
}

/// Static names and field counts per type id. Built-in entries are
/// fixed; the embedder appends user object types.
pub struct TypeTable {
    entries: Vec<TypeInfo>,
}

pub struct TypeInfo {
    pub name: String,
    pub num_fields: u16,
}

impl TypeTable {
    pub fn new() -> Self {
        let names: [&str; FIRST_USER_TYPE as usize] = [
            "none",
            "boolean",
            "error",
            "staticAstring",
            "staticUstring",
            "symbol",
            "int",
            "float",
            "List",
            "ListIterator",
            "Map",
            "MapIterator",
            "Closure",
            "Lambda",
            "Astring",
            "Ustring",
            "StringSlice",
            "RawString",
            "RawStringSlice",
            "Fiber",
            "Box",
            "HostFunc",
            "Pointer",
            "File",
            "Dir",
            "DirIterator",
            "MetaType",
        ];
        Self {
            entries: names
                .iter()
                .map(|n| TypeInfo {
                    name: n.to_string(),
                    num_fields: 0,
                })
                .collect(),
        }
    }

    /// Registers a user object type and returns its runtime id.
    pub fn add_object_type(&mut self, name: &str, num_fields: u16) -> TypeId {
        self.entries.push(TypeInfo {
            name: name.to_string(),
            num_fields,
        });
        (self.entries.len() - 1) as TypeId
    }

    pub fn name(&self, type_id: TypeId) -> &str {
        &self.entries[type_id as usize].name
    }

    pub fn num_fields(&self, type_id: TypeId) -> u16 {
        self.entries[type_id as usize].num_fields
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether objects of this type can participate in reference cycles and
/// therefore join the collector's candidate list. Strings, numbers and
/// plain function values cannot point back into the graph.
#[inline]
pub fn is_cyclable(type_id: TypeId) -> bool {
    matches!(
        type_id,
        TYPE_LIST | TYPE_MAP | TYPE_CLOSURE | TYPE_BOX | TYPE_FIBER
    ) || type_id >= FIRST_USER_TYPE
}

/// Total allocation size of a heap object, header included.
///
/// # Safety
///
/// `obj` must point to a live object whose length fields are intact
/// (destructors do not touch them).
pub unsafe fn object_size(types: &TypeTable, obj: *const HeapHeader) -> usize {
    let type_id = (*obj).type_id;
    match type_id {
        TYPE_LIST => size_of::<List>(),
        TYPE_LIST_ITER => size_of::<ListIter>(),
        TYPE_MAP => size_of::<Map>(),
        TYPE_MAP_ITER => size_of::<MapIter>(),
        TYPE_CLOSURE => {
            let c = &*(obj as *const Closure);
            Closure::allocation_size(c.num_captured as usize)
        }
        TYPE_LAMBDA => size_of::<Lambda>(),
        TYPE_ASTRING => {
            Astring::allocation_size((*(obj as *const Astring)).len as usize)
        }
        TYPE_USTRING => {
            Ustring::allocation_size((*(obj as *const Ustring)).len as usize)
        }
        TYPE_STRING_SLICE => size_of::<StringSlice>(),
        TYPE_RAWSTRING => RawString::allocation_size(
            (*(obj as *const RawString)).len as usize,
        ),
        TYPE_RAWSTRING_SLICE => size_of::<RawStringSlice>(),
        TYPE_FIBER => size_of::<Fiber>(),
        TYPE_BOX => size_of::<BoxObject>(),
        TYPE_HOST_FUNC => size_of::<HostFunc>(),
        TYPE_POINTER => size_of::<Pointer>(),
        TYPE_FILE => size_of::<File>(),
        TYPE_DIR => size_of::<Dir>(),
        TYPE_DIR_ITER => size_of::<DirIter>(),
        TYPE_METATYPE => size_of::<MetaType>(),
        _ => Object::allocation_size(types.num_fields(type_id) as usize),
    }
}

/// Calls `visitor` for every child value a heap object holds. Only the
/// cycle-capable types and the retaining handles have children.
///
/// # Safety
///
/// `obj` must point to a valid, live heap object.
pub unsafe fn trace_object(
    types: &TypeTable,
    obj: *mut HeapHeader,
    visitor: &mut dyn FnMut(Value),
) {
    let type_id = (*obj).type_id;
    match type_id {
        TYPE_LIST => {
            for &e in (*(obj as *mut List)).elems.iter() {
                visitor(e);
            }
        }
        TYPE_LIST_ITER => visitor((*(obj as *mut ListIter)).list),
        TYPE_MAP => {
            (*(obj as *mut Map)).inner.for_each(|k, v| {
                visitor(k);
                visitor(v);
            });
        }
        TYPE_MAP_ITER => visitor((*(obj as *mut MapIter)).map),
        TYPE_CLOSURE => {
            for &c in (*(obj as *mut Closure)).captured() {
                visitor(c);
            }
        }
        TYPE_STRING_SLICE => visitor((*(obj as *mut StringSlice)).parent),
        TYPE_RAWSTRING_SLICE => {
            visitor((*(obj as *mut RawStringSlice)).parent)
        }
        TYPE_FIBER => {
            let f = &*(obj as *mut Fiber);
            visitor(f.prev_fiber);
            fiber_live_slots(f, &mut |v| visitor(v));
        }
        TYPE_BOX => visitor((*(obj as *mut BoxObject)).val),
        TYPE_DIR_ITER => visitor((*(obj as *mut DirIter)).dir),
        TYPE_LAMBDA | TYPE_ASTRING | TYPE_USTRING | TYPE_RAWSTRING
        | TYPE_HOST_FUNC | TYPE_POINTER | TYPE_FILE | TYPE_DIR
        | TYPE_METATYPE => {}
        _ => {
            let o = &*(obj as *mut Object);
            for &f in o.fields(types.num_fields(type_id) as usize) {
                visitor(f);
            }
        }
    }
}

/// Runs a heap object's destructor: releases every owned child (per
/// `mode`) and frees auxiliary buffers. The object's memory itself is
/// freed by the caller afterwards.
///
/// # Safety
///
/// `obj` must point to a valid object with `rc == 0` (or condemned by
/// the sweep); it must not be destructed twice.
pub unsafe fn destruct_object(
    heap: &mut Heap,
    obj: *mut HeapHeader,
    mode: DestructMode,
) {
    let type_id = (*obj).type_id;
    match type_id {
        TYPE_LIST => {
            let list = obj as *mut List;
            for i in 0..(*list).elems.len() {
                release_child(heap, (&(*list).elems)[i], mode);
            }
            core::ptr::drop_in_place(&mut (*list).elems);
        }
        TYPE_LIST_ITER => {
            release_child(heap, (*(obj as *mut ListIter)).list, mode);
        }
        TYPE_MAP => {
            let map = obj as *mut Map;
            let mut children = Vec::new();
            (*map).inner.for_each(|k, v| {
                children.push(k);
                children.push(v);
            });
            for c in children {
                release_child(heap, c, mode);
            }
            core::ptr::drop_in_place(&mut (*map).inner);
        }
        TYPE_MAP_ITER => {
            release_child(heap, (*(obj as *mut MapIter)).map, mode);
        }
        TYPE_CLOSURE => {
            let c = obj as *mut Closure;
            for i in 0..(*c).num_captured as usize {
                release_child(heap, (*c).captured_at(i), mode);
            }
        }
        TYPE_STRING_SLICE => {
            release_child(heap, (*(obj as *mut StringSlice)).parent, mode);
        }
        TYPE_RAWSTRING_SLICE => {
            release_child(heap, (*(obj as *mut RawStringSlice)).parent, mode);
        }
        TYPE_FIBER => {
            let f = obj as *mut Fiber;
            release_child(heap, (*f).prev_fiber, mode);
            let mut slots = Vec::new();
            fiber_live_slots(&*f, &mut |v| slots.push(v));
            for v in slots {
                release_child(heap, v, mode);
            }
            core::ptr::drop_in_place(&mut (*f).stack);
        }
        TYPE_BOX => {
            release_child(heap, (*(obj as *mut BoxObject)).val, mode);
        }
        TYPE_POINTER => {
            let p = obj as *mut Pointer;
            if let Some(fin) = (*p).finalizer {
                fin((*p).ptr);
            }
        }
        TYPE_FILE => {
            core::ptr::drop_in_place(&mut (*(obj as *mut File)).file);
        }
        TYPE_DIR => {
            core::ptr::drop_in_place(&mut (*(obj as *mut Dir)).path);
        }
        TYPE_DIR_ITER => {
            let d = obj as *mut DirIter;
            core::ptr::drop_in_place(&mut (*d).iter);
            release_child(heap, (*d).dir, mode);
        }
        TYPE_LAMBDA | TYPE_ASTRING | TYPE_USTRING | TYPE_RAWSTRING
        | TYPE_HOST_FUNC | TYPE_METATYPE => {}
        _ => {
            let o = obj as *mut Object;
            let n = heap.types.num_fields(type_id) as usize;
            for i in 0..n {
                release_child(heap, (*o).field(i), mode);
            }
        }
    }
}

#[inline]
unsafe fn release_child(heap: &mut Heap, v: Value, mode: DestructMode) {
    match mode {
        DestructMode::Normal { depth } => {
            heap.release_at_depth(v, depth + 1)
        }
        DestructMode::Sweep => heap.release_in_sweep(v),
    }
}

/// Walks a suspended fiber's frames from the saved frame pointer down
/// to the root, visiting every local slot. Frame sizes come from the
/// packed meta in slot 1; slot 3 links to the previous frame.
///
/// # Safety
///
/// The fiber must be suspended (its stack owned by the object) with
/// every frame's locals initialised.
unsafe fn fiber_live_slots(f: &Fiber, visit: &mut dyn FnMut(Value)) {
    if f.stack.is_empty() || f.state == FiberState::Done {
        return;
    }
    let mut fp = f.fp as usize;
    loop {
        let meta = f.stack[fp + 1];
        let size = frame::frame_stack_size(meta) as usize;
        for i in fp + frame::FRAME_HEADER_SLOTS..fp + size {
            visit(f.stack[i]);
        }
        if frame::frame_is_root(meta) {
            break;
        }
        fp = frame::value_to_fp(f.stack[fp + 3]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclable_covers_exactly_the_cycle_formers() {
        for t in [TYPE_LIST, TYPE_MAP, TYPE_CLOSURE, TYPE_BOX, TYPE_FIBER] {
            assert!(is_cyclable(t));
        }
        for t in [
            TYPE_ASTRING,
            TYPE_USTRING,
            TYPE_STRING_SLICE,
            TYPE_RAWSTRING,
            TYPE_LAMBDA,
            TYPE_HOST_FUNC,
            TYPE_POINTER,
            TYPE_FILE,
            TYPE_METATYPE,
        ] {
            assert!(!is_cyclable(t));
        }
        assert!(is_cyclable(FIRST_USER_TYPE));
        assert!(is_cyclable(FIRST_USER_TYPE + 5));
    }

    #[test]
    fn table_registers_user_types() {
        let mut t = TypeTable::new();
        assert_eq!(t.len(), FIRST_USER_TYPE as usize);
        let id = t.add_object_type("Node", 2);
        assert_eq!(id, FIRST_USER_TYPE);
        assert_eq!(t.name(id), "Node");
        assert_eq!(t.num_fields(id), 2);
        assert_eq!(t.name(TYPE_LIST), "List");
    }
}
