//! Value representation and heap object layouts.
//!
//! A [`Value`] is a NaN-boxed 64-bit word; heap objects are `#[repr(C)]`
//! structs whose first field is a [`HeapHeader`]. This crate only defines
//! layouts and encoding; allocation and lifetime live in the `heap` crate.

pub mod frame;
mod header;
mod map;
mod objects;
mod value;

pub use header::{
    HeaderFlags, HeapHeader, TypeId, FIRST_HEAP_TYPE, FIRST_USER_TYPE,
    TYPE_ASTRING, TYPE_BOOLEAN, TYPE_BOX, TYPE_CLOSURE, TYPE_DIR,
    TYPE_DIR_ITER, TYPE_ERROR, TYPE_FIBER, TYPE_FILE, TYPE_FLOAT,
    TYPE_HOST_FUNC, TYPE_INTEGER, TYPE_LAMBDA, TYPE_LIST, TYPE_LIST_ITER,
    TYPE_MAP, TYPE_MAP_ITER, TYPE_METATYPE, TYPE_NONE, TYPE_POINTER,
    TYPE_RAWSTRING, TYPE_RAWSTRING_SLICE, TYPE_STATIC_ASTRING,
    TYPE_STATIC_USTRING, TYPE_STRING_SLICE, TYPE_SYMBOL, TYPE_USTRING,
};
pub use map::{BitwiseContext, KeyContext, ValueMap};
pub use objects::{
    Astring, BoxObject, Closure, Dir, DirIter, Fiber, FiberState, File,
    FinalizerFn, HostFunc, Lambda, List, ListIter, Map, MapIter, MetaType,
    Object, Pointer, RawString, RawStringSlice, StringSlice, Ustring,
};
pub use value::{Value, QNAN};

/// Primitive type id of a non-heap value. Heap values report the type id
/// stored in their header instead; see [`heap_type_id`].
pub fn primitive_type_id(v: Value) -> TypeId {
    if v.is_float() {
        TYPE_FLOAT
    } else if v.is_integer() {
        TYPE_INTEGER
    } else if v.is_bool() {
        TYPE_BOOLEAN
    } else if v.is_error() {
        TYPE_ERROR
    } else if v.is_symbol() {
        TYPE_SYMBOL
    } else if v.is_static_astring() {
        TYPE_STATIC_ASTRING
    } else if v.is_static_ustring() {
        TYPE_STATIC_USTRING
    } else {
        TYPE_NONE
    }
}

/// Type id of any value.
///
/// # Safety
///
/// If `v` is a heap value it must point to a live object.
pub unsafe fn type_id(v: Value) -> TypeId {
    if v.is_heap() {
        (*v.as_ptr()).type_id
    } else {
        primitive_type_id(v)
    }
}

/// Whether `type_id` names one of the five string shapes (all compare by
/// content).
pub fn is_string_type(type_id: TypeId) -> bool {
    matches!(
        type_id,
        TYPE_STATIC_ASTRING
            | TYPE_STATIC_USTRING
            | TYPE_ASTRING
            | TYPE_USTRING
            | TYPE_STRING_SLICE
    )
}
