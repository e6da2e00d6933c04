//! Typed allocation helpers. Each writes a fully-initialised object
//! (header `rc == 1`) and returns it as a tagged [`Value`], or `None`
//! when the allocator is out of memory.
//!
//! Child values handed in (list elements, captured boxes, object
//! fields) must already be owned references; the new object takes them
//! over without retaining again.

use std::ffi::c_void;
use std::fs;
use std::path::PathBuf;
use std::ptr;

use object::{
    Astring, BoxObject, Closure, Dir, DirIter, Fiber, FiberState, File,
    FinalizerFn, HeapHeader, HostFunc, Lambda, List, ListIter, Map, MapIter,
    MetaType, Object, Pointer, RawString, RawStringSlice, StringSlice,
    TypeId, Ustring, Value, ValueMap, TYPE_ASTRING, TYPE_BOX, TYPE_CLOSURE,
    TYPE_DIR, TYPE_DIR_ITER, TYPE_FIBER, TYPE_FILE, TYPE_HOST_FUNC,
    TYPE_LAMBDA, TYPE_LIST, TYPE_LIST_ITER, TYPE_MAP, TYPE_MAP_ITER,
    TYPE_METATYPE, TYPE_POINTER, TYPE_RAWSTRING, TYPE_RAWSTRING_SLICE,
    TYPE_STRING_SLICE, TYPE_USTRING,
};

use crate::heap::Heap;

impl Heap {
    fn alloc_write<T>(&mut self, size: usize, value: T) -> Option<Value> {
        let raw = self.alloc_bytes(size)?;
        let ptr = raw.as_ptr() as *mut T;
        // SAFETY: the allocation is at least `size >= size_of::<T>()`
        // bytes and 8-aligned.
        unsafe { ptr::write(ptr, value) };
        Some(Value::from_ptr(raw.as_ptr()))
    }

    pub fn new_list(&mut self, elems: Vec<Value>) -> Option<Value> {
        self.alloc_write(
            size_of::<List>(),
            List {
                header: HeapHeader::new(TYPE_LIST),
                elems,
            },
        )
    }

    /// `list` is retained by the iterator.
    pub fn new_list_iter(&mut self, list: Value) -> Option<Value> {
        self.retain(list);
        self.alloc_write(
            size_of::<ListIter>(),
            ListIter {
                header: HeapHeader::new(TYPE_LIST_ITER),
                list,
                next_idx: 0,
            },
        )
    }

    pub fn new_map(&mut self) -> Option<Value> {
        self.alloc_write(
            size_of::<Map>(),
            Map {
                header: HeapHeader::new(TYPE_MAP),
                inner: ValueMap::new(),
            },
        )
    }

    /// `map` is retained by the iterator.
    pub fn new_map_iter(&mut self, map: Value) -> Option<Value> {
        self.retain(map);
        self.alloc_write(
            size_of::<MapIter>(),
            MapIter {
                header: HeapHeader::new(TYPE_MAP_ITER),
                map,
                next_bucket: 0,
            },
        )
    }

    pub fn new_astring(&mut self, s: &str) -> Option<Value> {
        debug_assert!(s.is_ascii());
        let size = Astring::allocation_size(s.len());
        let v = self.alloc_write(
            size,
            Astring {
                header: HeapHeader::new(TYPE_ASTRING),
                len: s.len() as u32,
            },
        )?;
        // SAFETY: the allocation reserves `s.len()` bytes after the struct.
        unsafe {
            let dst = (v.as_ptr() as *mut Astring).add(1) as *mut u8;
            ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
        }
        Some(v)
    }

    pub fn new_ustring(&mut self, s: &str) -> Option<Value> {
        let size = Ustring::allocation_size(s.len());
        let v = self.alloc_write(
            size,
            Ustring {
                header: HeapHeader::new(TYPE_USTRING),
                len: s.len() as u32,
                char_len: s.chars().count() as u32,
            },
        )?;
        // SAFETY: the allocation reserves `s.len()` bytes after the struct.
        unsafe {
            let dst = (v.as_ptr() as *mut Ustring).add(1) as *mut u8;
            ptr::copy_nonoverlapping(s.as_ptr(), dst, s.len());
        }
        Some(v)
    }

    /// Picks the ASCII or UTF-8 shape by content.
    pub fn new_string(&mut self, s: &str) -> Option<Value> {
        if s.is_ascii() {
            self.new_astring(s)
        } else {
            self.new_ustring(s)
        }
    }

    pub fn new_rawstring(&mut self, bytes: &[u8]) -> Option<Value> {
        let size = RawString::allocation_size(bytes.len());
        let v = self.alloc_write(
            size,
            RawString {
                header: HeapHeader::new(TYPE_RAWSTRING),
                len: bytes.len() as u32,
            },
        )?;
        // SAFETY: the allocation reserves `bytes.len()` bytes after the
        // struct.
        unsafe {
            let dst = (v.as_ptr() as *mut RawString).add(1) as *mut u8;
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
        }
        Some(v)
    }

    /// Builds a slice view. `parent` is retained.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid for as long as `parent` is alive
    /// (a range inside the parent's payload or the loaded chunk's
    /// static storage).
    pub unsafe fn new_string_slice(
        &mut self,
        parent: Value,
        ptr: *const u8,
        len: u32,
        char_len: u32,
        ascii: bool,
    ) -> Option<Value> {
        self.retain(parent);
        self.alloc_write(
            size_of::<StringSlice>(),
            StringSlice {
                header: HeapHeader::new(TYPE_STRING_SLICE),
                parent,
                ptr,
                len,
                char_len,
                ascii,
            },
        )
    }

    /// Builds a raw slice view. `parent` is retained.
    ///
    /// # Safety
    ///
    /// Same contract as [`new_string_slice`](Self::new_string_slice).
    pub unsafe fn new_rawstring_slice(
        &mut self,
        parent: Value,
        ptr: *const u8,
        len: u32,
    ) -> Option<Value> {
        self.retain(parent);
        self.alloc_write(
            size_of::<RawStringSlice>(),
            RawStringSlice {
                header: HeapHeader::new(TYPE_RAWSTRING_SLICE),
                parent,
                ptr,
                len,
            },
        )
    }

    /// `captured` values are taken over (already owned, usually boxes).
    pub fn new_closure(
        &mut self,
        func_pc: u32,
        num_params: u8,
        stack_size: u8,
        captured: &[Value],
    ) -> Option<Value> {
        let size = Closure::allocation_size(captured.len());
        let v = self.alloc_write(
            size,
            Closure {
                header: HeapHeader::new(TYPE_CLOSURE),
                func_pc,
                num_params,
                stack_size,
                num_captured: captured.len() as u8,
            },
        )?;
        // SAFETY: the allocation reserves the inline capture slots.
        unsafe {
            let dst = (v.as_ptr() as *mut Closure).add(1) as *mut Value;
            ptr::copy_nonoverlapping(captured.as_ptr(), dst, captured.len());
        }
        Some(v)
    }

    pub fn new_lambda(
        &mut self,
        func_pc: u32,
        num_params: u8,
        stack_size: u8,
    ) -> Option<Value> {
        self.alloc_write(
            size_of::<Lambda>(),
            Lambda {
                header: HeapHeader::new(TYPE_LAMBDA),
                func_pc,
                num_params,
                stack_size,
            },
        )
    }

    /// `func` carries the host fn pointer's bits; the vm crate owns the
    /// concrete signature.
    pub fn new_host_func(
        &mut self,
        func: usize,
        num_params: u32,
    ) -> Option<Value> {
        self.alloc_write(
            size_of::<HostFunc>(),
            HostFunc {
                header: HeapHeader::new(TYPE_HOST_FUNC),
                func,
                num_params,
            },
        )
    }

    /// `val` is taken over.
    pub fn new_box(&mut self, val: Value) -> Option<Value> {
        self.alloc_write(
            size_of::<BoxObject>(),
            BoxObject {
                header: HeapHeader::new(TYPE_BOX),
                val,
            },
        )
    }

    /// The stack is handed over pre-filled (root frame plus retained
    /// args); `pc` is the fiber body's entry offset.
    pub fn new_fiber(
        &mut self,
        stack: Box<[Value]>,
        pc: u32,
        num_args: u8,
    ) -> Option<Value> {
        self.alloc_write(
            size_of::<Fiber>(),
            Fiber {
                header: HeapHeader::new(TYPE_FIBER),
                stack,
                pc,
                fp: 0,
                state: FiberState::Init,
                num_args,
                prev_fiber: Value::NONE,
            },
        )
    }

    pub fn new_pointer(
        &mut self,
        raw: *mut c_void,
        finalizer: Option<FinalizerFn>,
    ) -> Option<Value> {
        self.alloc_write(
            size_of::<Pointer>(),
            Pointer {
                header: HeapHeader::new(TYPE_POINTER),
                ptr: raw,
                finalizer,
            },
        )
    }

    pub fn new_file(&mut self, file: fs::File) -> Option<Value> {
        self.alloc_write(
            size_of::<File>(),
            File {
                header: HeapHeader::new(TYPE_FILE),
                file: Some(file),
            },
        )
    }

    pub fn new_dir(&mut self, path: PathBuf) -> Option<Value> {
        self.alloc_write(
            size_of::<Dir>(),
            Dir {
                header: HeapHeader::new(TYPE_DIR),
                path,
            },
        )
    }

    /// `dir` is retained by the iterator.
    pub fn new_dir_iter(
        &mut self,
        dir: Value,
        iter: fs::ReadDir,
    ) -> Option<Value> {
        self.retain(dir);
        self.alloc_write(
            size_of::<DirIter>(),
            DirIter {
                header: HeapHeader::new(TYPE_DIR_ITER),
                iter: Some(iter),
                dir,
            },
        )
    }

    /// `fields` are taken over. Their count must match the type's
    /// registered field count.
    pub fn new_object(
        &mut self,
        type_id: TypeId,
        fields: &[Value],
    ) -> Option<Value> {
        debug_assert_eq!(
            self.types.num_fields(type_id) as usize,
            fields.len()
        );
        let size = Object::allocation_size(fields.len());
        let v = self.alloc_write(
            size,
            Object {
                header: HeapHeader::new(type_id),
            },
        )?;
        // SAFETY: the allocation reserves the inline field slots.
        unsafe {
            let dst = (v.as_ptr() as *mut Object).add(1) as *mut Value;
            ptr::copy_nonoverlapping(fields.as_ptr(), dst, fields.len());
        }
        Some(v)
    }

    pub fn new_metatype(&mut self, kind: u32, ref_type_id: u32) -> Option<Value> {
        self.alloc_write(
            size_of::<MetaType>(),
            MetaType {
                header: HeapHeader::new(TYPE_METATYPE),
                kind,
                ref_type_id,
            },
        )
    }
}
