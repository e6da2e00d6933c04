//! Allocation and reference counting.
//!
//! Two allocation paths: small objects come from the size-class
//! [`Pool`], everything else from the general allocator. Release routes
//! back by the same size computation. Destruction is immediate at
//! `rc == 0`; chains deeper than [`MAX_DESTRUCT_DEPTH`] fall back to an
//! explicit worklist so deep ownership chains cannot overflow the host
//! stack.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{self, NonNull};

use object::{HeaderFlags, HeapHeader, Value};
use tracing::trace;

use crate::pool::Pool;
use crate::types::{
    destruct_object, is_cyclable, object_size, DestructMode, TypeTable,
};

/// Destructor recursion bound before deferring to the worklist.
pub const MAX_DESTRUCT_DEPTH: u32 = 64;

pub struct Heap {
    pool: Pool,
    pub types: TypeTable,
    /// Mirrors the sum of all heap `rc` values; must return to zero
    /// after final teardown.
    global_rc: i64,
    live_count: u64,
    freed_count: u64,
    /// Head of the intrusive cycle-candidate list.
    pub(crate) cyc_head: *mut HeapHeader,
    /// Deferred-release worklist for deep destructor chains.
    pending: Vec<Value>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            pool: Pool::new(),
            types: TypeTable::new(),
            global_rc: 0,
            live_count: 0,
            freed_count: 0,
            cyc_head: ptr::null_mut(),
            pending: Vec::new(),
        }
    }

    /// Sum of all live refcounts. Zero after a clean teardown.
    pub fn global_rc(&self) -> i64 {
        self.global_rc
    }

    pub fn live_count(&self) -> u64 {
        self.live_count
    }

    pub(crate) fn freed_count(&self) -> u64 {
        self.freed_count
    }

    // ── Allocation ─────────────────────────────────────────────────

    /// Allocates `size` bytes for a heap object, routed by size class.
    /// The caller writes the full object, starting with a header whose
    /// `rc` is 1 (the counters below assume it).
    pub fn alloc_bytes(&mut self, size: usize) -> Option<NonNull<HeapHeader>> {
        let raw = if Pool::serves(size) {
            self.pool.alloc(size)?
        } else {
            let layout = Layout::from_size_align(size, 8).unwrap();
            // SAFETY: layout has non-zero size (header included).
            NonNull::new(unsafe { alloc(layout) })?
        };
        self.live_count += 1;
        self.global_rc += 1;
        Some(raw.cast())
    }

    /// Returns an object's memory, routed by the same size class.
    ///
    /// # Safety
    ///
    /// `obj` must have been allocated by [`alloc_bytes`](Self::alloc_bytes)
    /// with this exact `size` and must not be referenced afterwards.
    pub(crate) unsafe fn free_object(
        &mut self,
        obj: *mut HeapHeader,
        size: usize,
    ) {
        self.dealloc_raw(obj, size);
        self.live_count -= 1;
        self.freed_count += 1;
    }

    /// Memory-only reclaim; counters were adjusted when the object was
    /// destructed (used for `FREED_PENDING` entries on the candidate
    /// list).
    ///
    /// # Safety
    ///
    /// Same contract as [`free_object`](Self::free_object).
    pub(crate) unsafe fn dealloc_raw(
        &mut self,
        obj: *mut HeapHeader,
        size: usize,
    ) {
        trace!(target: "heap", ptr = ?obj, size, "free");
        if Pool::serves(size) {
            self.pool.free(obj as *mut u8, size);
        } else {
            let layout = Layout::from_size_align(size, 8).unwrap();
            dealloc(obj as *mut u8, layout);
        }
    }

    // ── Reference counting ─────────────────────────────────────────

    pub fn retain(&mut self, v: Value) {
        if !v.is_heap() {
            return;
        }
        // SAFETY: live Values point to live objects.
        unsafe {
            let hdr = &mut *v.as_ptr();
            hdr.rc += 1;
            trace!(target: "heap", type_id = hdr.type_id, rc = hdr.rc, "retain");
        }
        self.global_rc += 1;
    }

    /// Releases a reference; destroys the object when the count hits
    /// zero, draining any work the destructors deferred.
    pub fn release(&mut self, v: Value) {
        self.release_at_depth(v, 0);
        self.drain_pending();
    }

    pub(crate) fn drain_pending(&mut self) {
        while let Some(v) = self.pending.pop() {
            // SAFETY: pending entries reached rc 0 and were not freed.
            unsafe { self.destroy(v.as_ptr()) };
        }
    }

    /// Release without draining, used by destructors. `depth` bounds
    /// recursion; past the bound the object is queued instead.
    pub(crate) fn release_at_depth(&mut self, v: Value, depth: u32) {
        if !v.is_heap() {
            return;
        }
        let ptr = v.as_ptr();
        // SAFETY: live Values point to live objects.
        unsafe {
            let hdr = &mut *ptr;
            // Objects condemned by a running sweep are freed by the
            // sweep itself; cascades must not touch their refcount.
            if hdr.has_flag(HeaderFlags::FREED_IN_SWEEP) {
                return;
            }
            debug_assert!(hdr.rc > 0, "release of dead object");
            hdr.rc -= 1;
            self.global_rc -= 1;
            trace!(target: "heap", type_id = hdr.type_id, rc = hdr.rc, "release");
            if hdr.rc == 0 {
                if depth >= MAX_DESTRUCT_DEPTH {
                    self.pending.push(v);
                } else {
                    self.destroy_at_depth(ptr, depth);
                }
            } else if is_cyclable(hdr.type_id)
                && !hdr.has_flag(HeaderFlags::CYC_CANDIDATE)
            {
                hdr.add_flag(HeaderFlags::CYC_CANDIDATE);
                hdr.next_cyc = self.cyc_head;
                self.cyc_head = ptr;
            }
        }
    }

    /// Child release during the cycle sweep: objects condemned by the
    /// same sweep are skipped (the check lives in
    /// [`release_at_depth`](Self::release_at_depth) so cascaded normal
    /// releases honour it too), everything else drops a reference.
    pub(crate) fn release_in_sweep(&mut self, v: Value) {
        self.release_at_depth(v, 0);
    }

    /// # Safety
    ///
    /// `obj` must be a live object whose `rc` just reached zero.
    pub(crate) unsafe fn destroy(&mut self, obj: *mut HeapHeader) {
        self.destroy_at_depth(obj, 0);
    }

    unsafe fn destroy_at_depth(&mut self, obj: *mut HeapHeader, depth: u32) {
        let size = object_size(&self.types, obj);
        destruct_object(self, obj, DestructMode::Normal { depth });
        let hdr = &mut *obj;
        if hdr.has_flag(HeaderFlags::CYC_CANDIDATE) {
            // Still linked on the candidate list; the collector reclaims
            // the memory when it next walks the list.
            hdr.add_flag(HeaderFlags::FREED_PENDING);
            hdr.cyc = size as u32;
            self.freed_count += 1;
            self.live_count -= 1;
        } else {
            self.free_object(obj, size);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_release_round_trips_global_rc() {
        let mut heap = Heap::new();
        let list = heap.new_list(Vec::new()).unwrap();
        assert_eq!(heap.global_rc(), 1);
        assert_eq!(heap.live_count(), 1);

        heap.retain(list);
        assert_eq!(heap.global_rc(), 2);
        heap.release(list);
        assert_eq!(heap.global_rc(), 1);
        assert_eq!(heap.live_count(), 1);

        heap.release(list);
        assert_eq!(heap.global_rc(), 0);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn primitives_do_not_touch_counters() {
        let mut heap = Heap::new();
        heap.retain(Value::from_integer(5));
        heap.release(Value::from_f64(1.5));
        heap.release(Value::NONE);
        assert_eq!(heap.global_rc(), 0);
    }

    #[test]
    fn nested_release_cascades() {
        let mut heap = Heap::new();
        let inner = heap.new_list(Vec::new()).unwrap();
        let outer = heap.new_list(vec![inner]).unwrap();
        assert_eq!(heap.live_count(), 2);
        // Dropping the outer list releases the inner element.
        heap.release(outer);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.global_rc(), 0);
    }

    #[test]
    fn deep_chain_does_not_recurse_unboundedly() {
        let mut heap = Heap::new();
        // head -> [ [ [ ... ] ] ], 10k deep.
        let mut head = heap.new_list(Vec::new()).unwrap();
        for _ in 0..10_000 {
            head = heap.new_list(vec![head]).unwrap();
        }
        assert_eq!(heap.live_count(), 10_001);
        heap.release(head);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.global_rc(), 0);
    }

    #[test]
    fn strings_round_trip_content() {
        let mut heap = Heap::new();
        let s = heap.new_astring("hello").unwrap();
        unsafe {
            let a: &object::Astring = s.as_heap_ref();
            assert_eq!(a.as_str(), "hello");
        }
        heap.release(s);
        assert_eq!(heap.global_rc(), 0);

        let u = heap.new_ustring("a🦊b").unwrap();
        unsafe {
            let us: &object::Ustring = u.as_heap_ref();
            assert_eq!(us.as_str(), "a🦊b");
            assert_eq!(us.char_len, 3);
        }
        heap.release(u);
        assert_eq!(heap.global_rc(), 0);
    }

    #[test]
    fn pool_and_general_objects_both_reclaim() {
        let mut heap = Heap::new();
        // Pool-sized.
        let small = heap.new_box(Value::NONE).unwrap();
        // General allocation (bigger than the pool max).
        let big = heap.new_astring(&"x".repeat(500)).unwrap();
        heap.release(small);
        heap.release(big);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.global_rc(), 0);
    }

    #[test]
    fn finalizer_runs_on_destroy() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static HITS: AtomicUsize = AtomicUsize::new(0);
        unsafe fn fin(_: *mut core::ffi::c_void) {
            HITS.fetch_add(1, Ordering::SeqCst);
        }
        let mut heap = Heap::new();
        let p = heap
            .new_pointer(0x1234 as *mut core::ffi::c_void, Some(fin))
            .unwrap();
        assert_eq!(HITS.load(Ordering::SeqCst), 0);
        heap.release(p);
        assert_eq!(HITS.load(Ordering::SeqCst), 1);
        assert_eq!(heap.global_rc(), 0);
    }
}
