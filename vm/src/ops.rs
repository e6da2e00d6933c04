//! Built-in operations the dispatch loop defers to: arithmetic slow
//! paths, equality, indexing and slicing over lists, maps and strings,
//! and string building.

use object::{
    List, Map, Value, TYPE_LIST, TYPE_MAP, TYPE_RAWSTRING,
    TYPE_RAWSTRING_SLICE,
};

use crate::error::PanicKind;
use crate::{VmKeyContext, VM};

/// `toF64` slow path: primitives convert directly, strings parse,
/// anything else refuses.
pub(crate) fn to_f64(vm: &VM, v: Value) -> Result<f64, PanicKind> {
    if let Some(n) = v.to_f64() {
        return Ok(n);
    }
    if let Some(view) = vm.string_view(v) {
        return view
            .as_str()
            .trim()
            .parse::<f64>()
            .map_err(|_| PanicKind::InvalidArgument("string is not a number"));
    }
    Err(PanicKind::InvalidArgument("expected a number"))
}

/// Integer coercion for the bitwise family. Floats truncate.
pub(crate) fn to_i48(v: Value) -> Result<i64, PanicKind> {
    if v.is_integer() {
        Ok(v.as_integer())
    } else if v.is_float() {
        Ok(v.as_f64() as i64)
    } else {
        Err(PanicKind::InvalidArgument("expected an integer"))
    }
}

/// Equality: bitwise for primitives and heap identity, content for
/// strings of any shape.
pub(crate) fn values_equal(vm: &VM, a: Value, b: Value) -> bool {
    if a.raw() == b.raw() {
        return true;
    }
    match (vm.string_view(a), vm.string_view(b)) {
        (Some(x), Some(y)) => x.bytes == y.bytes,
        _ => false,
    }
}

/// `Add` fallback: string concatenation, otherwise numeric promotion to
/// float.
pub(crate) fn add_fallback(
    vm: &mut VM,
    a: Value,
    b: Value,
) -> Result<Value, PanicKind> {
    if vm.string_view(a).is_some() && vm.string_view(b).is_some() {
        return concat_strings(vm, a, b);
    }
    let (x, y) = (to_f64(vm, a)?, to_f64(vm, b)?);
    Ok(Value::from_f64(x + y))
}

pub(crate) fn concat_strings(
    vm: &mut VM,
    a: Value,
    b: Value,
) -> Result<Value, PanicKind> {
    let mut s = String::new();
    s.push_str(vm.string_view(a).unwrap().as_str());
    s.push_str(vm.string_view(b).unwrap().as_str());
    vm.heap.new_string(&s).ok_or(PanicKind::OutOfMemory)
}

/// Render a value for `print`, templates and error reports.
pub(crate) fn to_display_string(vm: &VM, v: Value) -> String {
    if let Some(view) = vm.string_view(v) {
        return view.as_str().to_string();
    }
    if v.is_float() {
        let n = v.as_f64();
        if n.fract() == 0.0 && n.abs() < 1e15 {
            return format!("{}", n as i64);
        }
        return format!("{n}");
    }
    if v.is_integer() {
        return format!("{}", v.as_integer());
    }
    if v.is_none() {
        return "none".to_string();
    }
    if v.is_bool() {
        return if v.as_bool() { "true" } else { "false" }.to_string();
    }
    if v.is_error() {
        return format!("error#{}", vm.error_sym_name(v.payload()));
    }
    if v.is_symbol() {
        return format!("#{}", v.payload());
    }
    let tid = vm.type_of(v);
    format!("<{}>", vm.heap.types.name(tid))
}

fn index_of(v: Value) -> Option<i64> {
    if v.is_integer() {
        Some(v.as_integer())
    } else if v.is_float() {
        let f = v.as_f64();
        (f.fract() == 0.0).then_some(f as i64)
    } else {
        None
    }
}

/// `recv[idx]`. Domain failures come back as error values; type
/// failures panic.
pub(crate) fn index_value(
    vm: &mut VM,
    recv: Value,
    idx: Value,
) -> Result<Value, PanicKind> {
    if vm.string_view(recv).is_some() {
        let i = index_of(idx)
            .ok_or(PanicKind::InvalidArgument("expected an index"))?;
        return string_index(vm, recv, i);
    }
    if recv.is_heap() {
        match vm.type_of(recv) {
            TYPE_LIST => {
                let i = index_of(idx)
                    .ok_or(PanicKind::InvalidArgument("expected an index"))?;
                // SAFETY: type id checked.
                let list: &List = unsafe { recv.as_heap_ref() };
                return Ok(match usize::try_from(i)
                    .ok()
                    .and_then(|i| list.elems.get(i))
                {
                    Some(&e) => {
                        vm.heap.retain(e);
                        e
                    }
                    None => Value::error(vm.err_out_of_bounds),
                });
            }
            TYPE_MAP => {
                let got = {
                    // SAFETY: type id checked.
                    let map: &Map = unsafe { recv.as_heap_ref() };
                    let ctx = VmKeyContext { vm };
                    map.inner.get(&ctx, idx)
                };
                return Ok(match got {
                    Some(v) => {
                        vm.heap.retain(v);
                        v
                    }
                    None => Value::NONE,
                });
            }
            TYPE_RAWSTRING | TYPE_RAWSTRING_SLICE => {
                let i = index_of(idx)
                    .ok_or(PanicKind::InvalidArgument("expected an index"))?;
                return rawstring_index(vm, recv, i);
            }
            _ => {}
        }
    }
    Err(PanicKind::InvalidArgument("value is not indexable"))
}

/// `recv[-idx]` counting from the end.
pub(crate) fn reverse_index_value(
    vm: &mut VM,
    recv: Value,
    idx: Value,
) -> Result<Value, PanicKind> {
    let i = index_of(idx)
        .ok_or(PanicKind::InvalidArgument("expected an index"))?;
    let len = if let Some(view) = vm.string_view(recv) {
        view.char_len as i64
    } else if recv.is_heap() && vm.type_of(recv) == TYPE_LIST {
        // SAFETY: type id checked.
        unsafe { recv.as_heap_ref::<List>().elems.len() as i64 }
    } else {
        return Err(PanicKind::InvalidArgument("value is not indexable"));
    };
    index_value(vm, recv, Value::from_integer(len - i))
}

/// String indexing. Bounds are checked against the rune count; the
/// index itself addresses bytes, so an index landing inside a rune's
/// continuation bytes reports `error(#InvalidRune)` and a valid leading
/// byte yields a single-rune slice.
fn string_index(vm: &mut VM, recv: Value, i: i64) -> Result<Value, PanicKind> {
    let view = vm.string_view(recv).unwrap();
    if i < 0 || i >= view.char_len as i64 {
        return Ok(Value::error(vm.err_out_of_bounds));
    }
    let i = i as usize;
    if view.ascii {
        let ptr = view.bytes[i..].as_ptr();
        // SAFETY: the slice range lives inside the parent's payload,
        // which the new slice retains.
        return unsafe { vm.heap.new_string_slice(recv, ptr, 1, 1, true) }
            .ok_or(PanicKind::OutOfMemory);
    }
    let byte = view.bytes[i];
    if byte & 0xc0 == 0x80 {
        return Ok(Value::error(vm.err_invalid_rune));
    }
    let rune_len = match byte {
        b if b < 0x80 => 1,
        b if b & 0xe0 == 0xc0 => 2,
        b if b & 0xf0 == 0xe0 => 3,
        _ => 4,
    };
    let rune_len = rune_len.min(view.bytes.len() - i);
    let ptr = view.bytes[i..].as_ptr();
    let ascii = rune_len == 1;
    // SAFETY: the slice range lives inside the parent's payload, which
    // the new slice retains.
    unsafe {
        vm.heap
            .new_string_slice(recv, ptr, rune_len as u32, 1, ascii)
    }
    .ok_or(PanicKind::OutOfMemory)
}

fn rawstring_index(
    vm: &mut VM,
    recv: Value,
    i: i64,
) -> Result<Value, PanicKind> {
    // SAFETY: callers checked the type id; both raw shapes start with a
    // length and expose bytes.
    let (bytes, len): (*const u8, usize) = unsafe {
        match vm.type_of(recv) {
            TYPE_RAWSTRING => {
                let s: &object::RawString = recv.as_heap_ref();
                (s.bytes().as_ptr(), s.len as usize)
            }
            _ => {
                let s: &object::RawStringSlice = recv.as_heap_ref();
                (s.bytes().as_ptr(), s.len as usize)
            }
        }
    };
    if i < 0 || i as usize >= len {
        return Ok(Value::error(vm.err_out_of_bounds));
    }
    // SAFETY: range checked above; the parent is retained by the slice.
    unsafe {
        vm.heap
            .new_rawstring_slice(recv, bytes.add(i as usize), 1)
    }
    .ok_or(PanicKind::OutOfMemory)
}

/// `recv[idx] = val`. The container retains its copy; `release_prev`
/// releases whatever the slot held before.
pub(crate) fn set_index(
    vm: &mut VM,
    recv: Value,
    idx: Value,
    val: Value,
    release_prev: bool,
) -> Result<(), PanicKind> {
    if !recv.is_heap() {
        return Err(PanicKind::InvalidArgument("value is not indexable"));
    }
    match vm.type_of(recv) {
        TYPE_LIST => {
            let i = index_of(idx)
                .ok_or(PanicKind::InvalidArgument("expected an index"))?;
            // SAFETY: type id checked.
            let list: &mut List = unsafe { recv.as_heap_mut() };
            let slot = usize::try_from(i)
                .ok()
                .and_then(|i| list.elems.get_mut(i))
                .ok_or(PanicKind::OutOfBounds)?;
            let prev = core::mem::replace(slot, val);
            vm.heap.retain(val);
            if release_prev {
                vm.heap.release(prev);
            }
            Ok(())
        }
        TYPE_MAP => {
            let prev = {
                // SAFETY: type id checked. The key context only reads
                // the VM's string tables.
                let map: &mut Map = unsafe { recv.as_heap_mut() };
                let ctx = VmKeyContext { vm };
                map.inner.insert(&ctx, idx, val)
            };
            vm.heap.retain(val);
            match prev {
                Some(old) => {
                    if release_prev {
                        vm.heap.release(old);
                    }
                }
                None => vm.heap.retain(idx),
            }
            Ok(())
        }
        _ => Err(PanicKind::InvalidArgument("value is not indexable")),
    }
}

/// `recv[start..end]`. Lists copy the range (retaining elements);
/// strings produce a slice view over the byte range of the rune range.
pub(crate) fn slice_value(
    vm: &mut VM,
    recv: Value,
    start: Value,
    end: Value,
) -> Result<Value, PanicKind> {
    if let Some(view) = vm.string_view(recv) {
        let char_len = view.char_len as i64;
        let s = if start.is_none() { 0 } else { index_of(start).ok_or(PanicKind::InvalidArgument("expected an index"))? };
        let e = if end.is_none() {
            char_len
        } else {
            index_of(end).ok_or(PanicKind::InvalidArgument("expected an index"))?
        };
        if s < 0 || e < s || e > char_len {
            return Ok(Value::error(vm.err_out_of_bounds));
        }
        let text = view.as_str();
        let byte_start = char_to_byte(text, s as usize);
        let byte_end = char_to_byte(text, e as usize);
        let ascii = view.ascii
            || text[byte_start..byte_end].is_ascii();
        let ptr = view.bytes[byte_start..].as_ptr();
        // SAFETY: the byte range lives inside the parent's payload,
        // which the new slice retains.
        return unsafe {
            vm.heap.new_string_slice(
                recv,
                ptr,
                (byte_end - byte_start) as u32,
                (e - s) as u32,
                ascii,
            )
        }
        .ok_or(PanicKind::OutOfMemory);
    }
    if recv.is_heap() && vm.type_of(recv) == TYPE_LIST {
        let elems = {
            // SAFETY: type id checked.
            let list: &List = unsafe { recv.as_heap_ref() };
            let len = list.elems.len() as i64;
            let s = if start.is_none() { 0 } else { index_of(start).ok_or(PanicKind::InvalidArgument("expected an index"))? };
            let e = if end.is_none() { len } else { index_of(end).ok_or(PanicKind::InvalidArgument("expected an index"))? };
            if s < 0 || e < s || e > len {
                return Ok(Value::error(vm.err_out_of_bounds));
            }
            list.elems[s as usize..e as usize].to_vec()
        };
        for &e in &elems {
            vm.heap.retain(e);
        }
        return vm.heap.new_list(elems).ok_or(PanicKind::OutOfMemory);
    }
    Err(PanicKind::InvalidArgument("value is not sliceable"))
}

fn char_to_byte(s: &str, char_idx: usize) -> usize {
    s.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(s.len())
}

/// `StringTemplate`: interleaved literal/expression locals rendered and
/// concatenated.
pub(crate) fn string_template(
    vm: &mut VM,
    parts: &[Value],
) -> Result<Value, PanicKind> {
    let mut out = String::new();
    for &p in parts {
        out.push_str(&to_display_string(vm, p));
    }
    vm.heap.new_string(&out).ok_or(PanicKind::OutOfMemory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    fn vm() -> VM {
        VM::new(Config::default())
    }

    #[test]
    fn equality_spans_string_shapes() {
        let mut vm = vm();
        let a = vm.heap.new_string("fox").unwrap();
        let b = vm.heap.new_string("fox").unwrap();
        assert!(values_equal(&vm, a, b));
        assert!(values_equal(&vm, Value::from_integer(3), Value::from_integer(3)));
        assert!(!values_equal(&vm, Value::from_integer(3), Value::from_f64(3.0)));
        vm.heap.release(a);
        vm.heap.release(b);
    }

    #[test]
    fn add_fallback_concats_strings() {
        let mut vm = vm();
        let a = vm.heap.new_string("ab").unwrap();
        let b = vm.heap.new_string("cd").unwrap();
        let c = add_fallback(&mut vm, a, b).unwrap();
        assert_eq!(vm.string_view(c).unwrap().as_str(), "abcd");
        for v in [a, b, c] {
            vm.heap.release(v);
        }
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn add_fallback_promotes_ints() {
        let mut vm = vm();
        let r = add_fallback(
            &mut vm,
            Value::from_integer(2),
            Value::from_f64(0.5),
        )
        .unwrap();
        assert!(r.is_float());
        assert_eq!(r.as_f64(), 2.5);
    }

    #[test]
    fn utf8_index_boundaries() {
        let mut vm = vm();
        let s = vm.heap.new_ustring("abc🦊xyz🐶").unwrap();
        // Rune at a leading byte.
        let fox = index_value(&mut vm, s, Value::from_integer(3)).unwrap();
        assert_eq!(vm.string_view(fox).unwrap().as_str(), "🦊");
        // Continuation byte.
        let e = index_value(&mut vm, s, Value::from_integer(4)).unwrap();
        assert!(e.is_error());
        assert_eq!(vm.error_sym_name(e.payload()), "InvalidRune");
        // Past the rune count.
        let e = index_value(&mut vm, s, Value::from_integer(8)).unwrap();
        assert!(e.is_error());
        assert_eq!(vm.error_sym_name(e.payload()), "OutOfBounds");
        // Negative.
        let e = index_value(&mut vm, s, Value::from_integer(-1)).unwrap();
        assert!(e.is_error());
        vm.heap.release(fox);
        vm.heap.release(s);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn ascii_index_boundaries() {
        let mut vm = vm();
        let s = vm.heap.new_astring("abc").unwrap();
        for (i, expect) in [(0, Some("a")), (2, Some("c")), (3, None)] {
            let r = index_value(&mut vm, s, Value::from_integer(i)).unwrap();
            match expect {
                Some(text) => {
                    assert_eq!(vm.string_view(r).unwrap().as_str(), text);
                    vm.heap.release(r);
                }
                None => assert!(r.is_error()),
            }
        }
        vm.heap.release(s);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn list_index_and_set() {
        let mut vm = vm();
        let l = vm
            .heap
            .new_list(vec![
                Value::from_integer(1),
                Value::from_integer(2),
                Value::from_integer(3),
            ])
            .unwrap();
        let v = index_value(&mut vm, l, Value::from_integer(1)).unwrap();
        assert_eq!(v.as_integer(), 2);
        let e = index_value(&mut vm, l, Value::from_integer(9)).unwrap();
        assert!(e.is_error());

        set_index(&mut vm, l, Value::from_integer(0), Value::from_integer(9), true)
            .unwrap();
        let v = index_value(&mut vm, l, Value::from_integer(0)).unwrap();
        assert_eq!(v.as_integer(), 9);
        let rev =
            reverse_index_value(&mut vm, l, Value::from_integer(1)).unwrap();
        assert_eq!(rev.as_integer(), 3);
        vm.heap.release(l);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn map_set_and_get_with_string_keys() {
        let mut vm = vm();
        let m = vm.heap.new_map().unwrap();
        let k1 = vm.heap.new_string("key").unwrap();
        set_index(&mut vm, m, k1, Value::from_integer(1), true).unwrap();
        // A different string object with the same content hits.
        let k2 = vm.heap.new_string("key").unwrap();
        let got = index_value(&mut vm, m, k2).unwrap();
        assert_eq!(got.as_integer(), 1);
        // Missing keys read as none.
        let miss = index_value(&mut vm, m, Value::from_integer(9)).unwrap();
        assert!(miss.is_none());
        vm.heap.release(k1);
        vm.heap.release(k2);
        vm.heap.release(m);
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn slices_of_strings_and_lists() {
        let mut vm = vm();
        let s = vm.heap.new_ustring("a🦊bc").unwrap();
        let sl = slice_value(
            &mut vm,
            s,
            Value::from_integer(1),
            Value::from_integer(3),
        )
        .unwrap();
        assert_eq!(vm.string_view(sl).unwrap().as_str(), "🦊b");
        assert_eq!(vm.string_view(sl).unwrap().char_len, 2);

        let l = vm
            .heap
            .new_list(vec![Value::from_integer(0), Value::from_integer(1)])
            .unwrap();
        let l2 = slice_value(&mut vm, l, Value::NONE, Value::NONE).unwrap();
        // SAFETY: known list.
        unsafe {
            assert_eq!(l2.as_heap_ref::<List>().elems.len(), 2);
        }
        let oob = slice_value(
            &mut vm,
            l,
            Value::from_integer(1),
            Value::from_integer(5),
        )
        .unwrap();
        assert!(oob.is_error());
        for v in [sl, s, l, l2] {
            vm.heap.release(v);
        }
        assert_eq!(vm.global_rc(), 0);
    }

    #[test]
    fn display_strings() {
        let mut vm = vm();
        assert_eq!(to_display_string(&vm, Value::from_f64(7.0)), "7");
        assert_eq!(to_display_string(&vm, Value::from_f64(2.5)), "2.5");
        assert_eq!(to_display_string(&vm, Value::from_integer(-3)), "-3");
        assert_eq!(to_display_string(&vm, Value::NONE), "none");
        assert_eq!(to_display_string(&vm, Value::TRUE), "true");
        let s = vm.heap.new_string("txt").unwrap();
        assert_eq!(to_display_string(&vm, s), "txt");
        vm.heap.release(s);
    }
}
