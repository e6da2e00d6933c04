//! Built-in methods on lists, maps, strings and fibers, dispatched
//! through `CallObjSym` like any user method (and cached the same way).

use object::{
    Fiber, List, ListIter, Map, MapIter, Value, TYPE_ASTRING, TYPE_FIBER,
    TYPE_LIST, TYPE_LIST_ITER, TYPE_MAP, TYPE_MAP_ITER,
    TYPE_STATIC_ASTRING, TYPE_STATIC_USTRING, TYPE_STRING_SLICE,
    TYPE_USTRING,
};

use crate::host::MethodEntry;
use crate::ops;
use crate::{VmKeyContext, VM};

const STRING_TYPES: [object::TypeId; 5] = [
    TYPE_STATIC_ASTRING,
    TYPE_STATIC_USTRING,
    TYPE_ASTRING,
    TYPE_USTRING,
    TYPE_STRING_SLICE,
];

pub(crate) fn register_builtins(vm: &mut VM) {
    let host = |func, num_params| MethodEntry::Host { func, num_params };

    vm.register_method(TYPE_LIST, "append", host(list_append, 1));
    vm.register_method(TYPE_LIST, "insert", host(list_insert, 2));
    vm.register_method(TYPE_LIST, "remove", host(list_remove, 1));
    vm.register_method(TYPE_LIST, "len", host(list_len, 0));
    vm.register_method(TYPE_LIST, "iterator", host(list_iterator, 0));
    vm.register_method(TYPE_LIST_ITER, "next", host(list_iter_next, 0));

    vm.register_method(TYPE_MAP, "remove", host(map_remove, 1));
    vm.register_method(TYPE_MAP, "size", host(map_size, 0));
    vm.register_method(TYPE_MAP, "contains", host(map_contains, 1));
    vm.register_method(TYPE_MAP, "iterator", host(map_iterator, 0));
    vm.register_method(TYPE_MAP_ITER, "next", host(map_iter_next, 0));

    for t in STRING_TYPES {
        vm.register_method(t, "len", host(string_len, 0));
        vm.register_method(t, "concat", host(string_concat, 1));
        vm.register_method(t, "insert", host(string_insert, 2));
    }

    vm.register_method(TYPE_FIBER, "status", host(fiber_status, 0));
}

fn expect_int(v: Value) -> Option<i64> {
    if v.is_integer() {
        Some(v.as_integer())
    } else if v.is_float() && v.as_f64().fract() == 0.0 {
        Some(v.as_f64() as i64)
    } else {
        None
    }
}

// ── List ───────────────────────────────────────────────────────────

fn list_append(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    let v = args[0];
    vm.heap.retain(v);
    // SAFETY: dispatch guaranteed the receiver type.
    unsafe { recv.as_heap_mut::<List>().elems.push(v) };
    Value::NONE
}

fn list_insert(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    let Some(idx) = expect_int(args[0]) else {
        return Value::PANIC;
    };
    // SAFETY: dispatch guaranteed the receiver type.
    let list = unsafe { recv.as_heap_mut::<List>() };
    if idx < 0 || idx as usize > list.elems.len() {
        return Value::error(vm.err_out_of_bounds);
    }
    let v = args[1];
    vm.heap.retain(v);
    list.elems.insert(idx as usize, v);
    Value::NONE
}

fn list_remove(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    let Some(idx) = expect_int(args[0]) else {
        return Value::PANIC;
    };
    // SAFETY: dispatch guaranteed the receiver type.
    let list = unsafe { recv.as_heap_mut::<List>() };
    if idx < 0 || idx as usize >= list.elems.len() {
        return Value::error(vm.err_out_of_bounds);
    }
    let old = list.elems.remove(idx as usize);
    vm.heap.release(old);
    Value::NONE
}

fn list_len(_vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    // SAFETY: dispatch guaranteed the receiver type.
    let len = unsafe { recv.as_heap_ref::<List>().elems.len() };
    Value::from_integer(len as i64)
}

fn list_iterator(vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    match vm.heap.new_list_iter(recv) {
        Some(it) => it,
        None => Value::PANIC,
    }
}

/// Next element (retained), or `none` at the end.
fn list_iter_next(vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    // SAFETY: dispatch guaranteed the receiver type; the iterator keeps
    // its list retained.
    let (elem, bump) = unsafe {
        let it = recv.as_heap_ref::<ListIter>();
        let list = it.list.as_heap_ref::<List>();
        match list.elems.get(it.next_idx as usize) {
            Some(&e) => (e, true),
            None => (Value::NONE, false),
        }
    };
    if bump {
        vm.heap.retain(elem);
        // SAFETY: same receiver as above.
        unsafe { recv.as_heap_mut::<ListIter>().next_idx += 1 };
    }
    elem
}

// ── Map ────────────────────────────────────────────────────────────

fn map_remove(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    let removed = {
        // SAFETY: dispatch guaranteed the receiver type.
        let map = unsafe { recv.as_heap_mut::<Map>() };
        let ctx = VmKeyContext { vm };
        map.inner.remove(&ctx, args[0])
    };
    match removed {
        Some((k, v)) => {
            vm.heap.release(k);
            vm.heap.release(v);
            Value::TRUE
        }
        None => Value::FALSE,
    }
}

fn map_size(_vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    // SAFETY: dispatch guaranteed the receiver type.
    let len = unsafe { recv.as_heap_ref::<Map>().inner.len() };
    Value::from_integer(len as i64)
}

fn map_contains(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    let found = {
        // SAFETY: dispatch guaranteed the receiver type.
        let map = unsafe { recv.as_heap_ref::<Map>() };
        let ctx = VmKeyContext { vm };
        map.inner.contains(&ctx, args[0])
    };
    Value::from_bool(found)
}

fn map_iterator(vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    match vm.heap.new_map_iter(recv) {
        Some(it) => it,
        None => Value::PANIC,
    }
}

/// Next key in bucket order (retained), or `none` when exhausted.
fn map_iter_next(vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    // SAFETY: dispatch guaranteed the receiver type; the iterator keeps
    // its map retained.
    let found = unsafe {
        let it = recv.as_heap_ref::<MapIter>();
        let map = it.map.as_heap_ref::<Map>();
        map.inner.next_entry(it.next_bucket as usize)
    };
    match found {
        Some((bucket, key, _)) => {
            vm.heap.retain(key);
            // SAFETY: same receiver as above.
            unsafe {
                recv.as_heap_mut::<MapIter>().next_bucket = bucket as u64 + 1
            };
            key
        }
        None => Value::NONE,
    }
}

// ── Strings ────────────────────────────────────────────────────────

fn string_len(vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    match vm.string_view(recv) {
        Some(view) => Value::from_integer(view.char_len as i64),
        None => Value::PANIC,
    }
}

fn string_concat(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    if vm.string_view(args[0]).is_none() {
        return Value::PANIC;
    }
    match ops::concat_strings(vm, recv, args[0]) {
        Ok(v) => v,
        Err(_) => Value::PANIC,
    }
}

/// Inserting at exactly the rune count appends; one past reports
/// `error(#OutOfBounds)`.
fn string_insert(vm: &mut VM, recv: Value, args: &[Value]) -> Value {
    let Some(idx) = expect_int(args[0]) else {
        return Value::PANIC;
    };
    let (Some(view), Some(insert)) =
        (vm.string_view(recv), vm.string_view(args[1]))
    else {
        return Value::PANIC;
    };
    if idx < 0 || idx > view.char_len as i64 {
        return Value::error(vm.err_out_of_bounds);
    }
    let text = view.as_str();
    let byte = text
        .char_indices()
        .nth(idx as usize)
        .map(|(b, _)| b)
        .unwrap_or(text.len());
    let mut out = String::with_capacity(text.len() + insert.bytes.len());
    out.push_str(&text[..byte]);
    out.push_str(insert.as_str());
    out.push_str(&text[byte..]);
    match vm.heap.new_string(&out) {
        Some(v) => v,
        None => Value::PANIC,
    }
}

// ── Fibers ─────────────────────────────────────────────────────────

fn fiber_status(_vm: &mut VM, recv: Value, _args: &[Value]) -> Value {
    // SAFETY: dispatch guaranteed the receiver type.
    let state = unsafe { recv.as_heap_ref::<Fiber>().state };
    Value::from_integer(state as i64)
}
