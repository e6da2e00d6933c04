use std::ffi::c_void;
use std::fs;
use std::path::PathBuf;

use crate::header::HeapHeader;
use crate::map::ValueMap;
use crate::Value;

/// Finalizer for foreign handles ([`Pointer`], [`File`], [`Dir`],
/// [`DirIter`]). Runs during destructor dispatch; must not allocate on
/// the VM heap.
pub type FinalizerFn = unsafe fn(*mut c_void);

// ── List ───────────────────────────────────────────────────────────

/// A growable array of values.
///
/// ```text
/// [HeapHeader 24B] [elems: Vec<Value> 24B]
/// ```
#[repr(C)]
pub struct List {
    pub header: HeapHeader,
    pub elems: Vec<Value>,
}

const _: () = assert!(size_of::<List>() == 48);

/// Iterator handle over a [`List`]. Holds a retained reference to keep
/// the list alive while iterating.
#[repr(C)]
pub struct ListIter {
    pub header: HeapHeader,
    pub list: Value,
    pub next_idx: u64,
}

const _: () = assert!(size_of::<ListIter>() == 40);

// ── Map ────────────────────────────────────────────────────────────

/// An open-addressed hash map from values to values.
#[repr(C)]
pub struct Map {
    pub header: HeapHeader,
    pub inner: ValueMap,
}

/// Iterator handle over a [`Map`]. Walks buckets in table order.
#[repr(C)]
pub struct MapIter {
    pub header: HeapHeader,
    pub map: Value,
    pub next_bucket: u64,
}

// ── Strings ────────────────────────────────────────────────────────

/// Heap-allocated ASCII string.
///
/// ```text
/// [HeapHeader 24B] [len: u32] [pad] [byte_0] [byte_1] ...
/// ```
#[repr(C)]
pub struct Astring {
    pub header: HeapHeader,
    pub len: u32,
}

const _: () = assert!(size_of::<Astring>() == 32);

impl Astring {
    pub const fn allocation_size(len: usize) -> usize {
        size_of::<Astring>() + len
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len` valid bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        let ptr = (self as *const Astring).add(1) as *const u8;
        core::slice::from_raw_parts(ptr, self.len as usize)
    }

    /// # Safety
    ///
    /// Same as [`bytes`](Self::bytes); the payload must be ASCII.
    #[inline(always)]
    pub unsafe fn as_str(&self) -> &str {
        core::str::from_utf8_unchecked(self.bytes())
    }
}

/// Heap-allocated UTF-8 string with a precomputed rune count.
///
/// ```text
/// [HeapHeader 24B] [len: u32] [char_len: u32] [byte_0] ...
/// ```
#[repr(C)]
pub struct Ustring {
    pub header: HeapHeader,
    pub len: u32,
    pub char_len: u32,
}

const _: () = assert!(size_of::<Ustring>() == 32);

impl Ustring {
    pub const fn allocation_size(len: usize) -> usize {
        size_of::<Ustring>() + len
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len` valid bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        let ptr = (self as *const Ustring).add(1) as *const u8;
        core::slice::from_raw_parts(ptr, self.len as usize)
    }

    /// # Safety
    ///
    /// Same as [`bytes`](Self::bytes); the payload must be valid UTF-8.
    #[inline(always)]
    pub unsafe fn as_str(&self) -> &str {
        core::str::from_utf8_unchecked(self.bytes())
    }
}

/// A view into another string's bytes. `parent` is retained; for slices
/// of static strings it is the static-string value itself and `ptr`
/// points into the loaded chunk's string storage, which outlives every
/// slice.
#[repr(C)]
pub struct StringSlice {
    pub header: HeapHeader,
    pub parent: Value,
    pub ptr: *const u8,
    pub len: u32,
    pub char_len: u32,
    /// Payload is pure ASCII (byte index == rune index).
    pub ascii: bool,
}

const _: () = assert!(size_of::<StringSlice>() == 56);

impl StringSlice {
    /// # Safety
    ///
    /// The parent buffer must still be live (guaranteed while the slice
    /// holds its retained `parent`).
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr, self.len as usize)
    }

    /// # Safety
    ///
    /// Same as [`bytes`](Self::bytes); the payload must be valid UTF-8.
    #[inline(always)]
    pub unsafe fn as_str(&self) -> &str {
        core::str::from_utf8_unchecked(self.bytes())
    }
}

/// Byte string with no encoding guarantee.
#[repr(C)]
pub struct RawString {
    pub header: HeapHeader,
    pub len: u32,
}

const _: () = assert!(size_of::<RawString>() == 32);

impl RawString {
    pub const fn allocation_size(len: usize) -> usize {
        size_of::<RawString>() + len
    }

    /// # Safety
    ///
    /// The inline memory after this struct must contain `len` valid bytes.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        let ptr = (self as *const RawString).add(1) as *const u8;
        core::slice::from_raw_parts(ptr, self.len as usize)
    }
}

/// A view into a [`RawString`]'s bytes. `parent` is retained.
#[repr(C)]
pub struct RawStringSlice {
    pub header: HeapHeader,
    pub parent: Value,
    pub ptr: *const u8,
    pub len: u32,
}

const _: () = assert!(size_of::<RawStringSlice>() == 48);

impl RawStringSlice {
    /// # Safety
    ///
    /// The parent buffer must still be live.
    #[inline(always)]
    pub unsafe fn bytes(&self) -> &[u8] {
        core::slice::from_raw_parts(self.ptr, self.len as usize)
    }
}

// ── Functions ──────────────────────────────────────────────────────

/// A closure: a function entry plus captured upvalue boxes stored
/// inline.
///
/// ```text
/// [HeapHeader 24B] [func_pc: u32] [num_params] [stack_size] [num_captured] [capture_0: Value] ...
/// ```
#[repr(C)]
pub struct Closure {
    pub header: HeapHeader,
    /// Byte offset of the function body in the loaded instruction buffer.
    pub func_pc: u32,
    pub num_params: u8,
    /// Number of stack slots the body needs (header + locals).
    pub stack_size: u8,
    pub num_captured: u8,
}

const _: () = assert!(size_of::<Closure>() == 32);

impl Closure {
    pub const fn allocation_size(num_captured: usize) -> usize {
        size_of::<Closure>() + num_captured * size_of::<Value>()
    }

    /// # Safety
    ///
    /// The inline memory must contain `num_captured` valid values.
    #[inline(always)]
    pub unsafe fn captured(&self) -> &[Value] {
        let ptr = (self as *const Closure).add(1) as *const Value;
        core::slice::from_raw_parts(ptr, self.num_captured as usize)
    }

    /// # Safety
    ///
    /// `idx < num_captured` and the inline memory must be valid.
    #[inline(always)]
    pub unsafe fn captured_at(&self, idx: usize) -> Value {
        debug_assert!(idx < self.num_captured as usize);
        let ptr = (self as *const Closure).add(1) as *const Value;
        *ptr.add(idx)
    }
}

/// A function value without captures.
#[repr(C)]
pub struct Lambda {
    pub header: HeapHeader,
    pub func_pc: u32,
    pub num_params: u8,
    pub stack_size: u8,
}

const _: () = assert!(size_of::<Lambda>() == 32);

/// A host function bound into the VM. `func` holds the host fn pointer's
/// bits; the vm crate owns the concrete signature.
#[repr(C)]
pub struct HostFunc {
    pub header: HeapHeader,
    pub func: usize,
    pub num_params: u32,
}

const _: () = assert!(size_of::<HostFunc>() == 40);

/// Single-slot mutable cell shared between closures (upvalues).
#[repr(C)]
pub struct BoxObject {
    pub header: HeapHeader,
    pub val: Value,
}

const _: () = assert!(size_of::<BoxObject>() == 32);

// ── Fibers ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created, never resumed.
    Init = 0,
    /// Currently running on the VM.
    Exec,
    /// Suspended at a `Coyield`.
    Paused,
    /// Returned; resuming yields `none`.
    Done,
}

/// A cooperative coroutine with its own value stack.
///
/// While the fiber runs, `stack` is empty (the buffer lives in the VM);
/// while suspended it holds the fiber's frames. `prev_fiber` links to the
/// resumer for the duration of a resume, `none` otherwise.
#[repr(C)]
pub struct Fiber {
    pub header: HeapHeader,
    pub stack: Box<[Value]>,
    /// Resume point: byte offset into the instruction buffer.
    pub pc: u32,
    /// Saved frame pointer (stack slot index).
    pub fp: u32,
    pub state: FiberState,
    pub num_args: u8,
    pub prev_fiber: Value,
}

// ── Foreign handles ────────────────────────────────────────────────

/// Opaque foreign pointer with an optional finalizer.
#[repr(C)]
pub struct Pointer {
    pub header: HeapHeader,
    pub ptr: *mut c_void,
    pub finalizer: Option<FinalizerFn>,
}

const _: () = assert!(size_of::<Pointer>() == 40);

/// Open file handle. `file` is dropped (closing the descriptor) by the
/// destructor.
#[repr(C)]
pub struct File {
    pub header: HeapHeader,
    pub file: Option<fs::File>,
}

/// Directory handle.
#[repr(C)]
pub struct Dir {
    pub header: HeapHeader,
    pub path: PathBuf,
}

/// Directory entry iterator. Retains `dir`.
#[repr(C)]
pub struct DirIter {
    pub header: HeapHeader,
    pub iter: Option<fs::ReadDir>,
    pub dir: Value,
}

// ── User objects ───────────────────────────────────────────────────

/// A user-defined struct instance: N values stored inline. The field
/// count comes from the type table entry for `header.type_id`.
///
/// ```text
/// [HeapHeader 24B] [field_0: Value] [field_1: Value] ...
/// ```
#[repr(C)]
pub struct Object {
    pub header: HeapHeader,
}

impl Object {
    pub const fn allocation_size(num_fields: usize) -> usize {
        size_of::<Object>() + num_fields * size_of::<Value>()
    }

    pub const FIELDS_OFFSET: usize = size_of::<Object>();

    /// # Safety
    ///
    /// The inline memory must contain `num_fields` valid values.
    #[inline(always)]
    pub unsafe fn fields(&self, num_fields: usize) -> &[Value] {
        let ptr = (self as *const Object).add(1) as *const Value;
        core::slice::from_raw_parts(ptr, num_fields)
    }

    /// # Safety
    ///
    /// `idx` must be within the object's field count.
    #[inline(always)]
    pub unsafe fn field(&self, idx: usize) -> Value {
        let ptr = (self as *const Object).add(1) as *const Value;
        *ptr.add(idx)
    }

    /// # Safety
    ///
    /// `idx` must be within the object's field count.
    #[inline(always)]
    pub unsafe fn set_field(&mut self, idx: usize, val: Value) {
        let ptr = (self as *mut Object).add(1) as *mut Value;
        *ptr.add(idx) = val;
    }
}

/// Reflective handle to a type id.
#[repr(C)]
pub struct MetaType {
    pub header: HeapHeader,
    /// 0 = object type, 1 = symbol group.
    pub kind: u32,
    pub ref_type_id: u32,
}

const _: () = assert!(size_of::<MetaType>() == 32);
