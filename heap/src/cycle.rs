//! Trial-deletion cycle collector.
//!
//! Pure reference counting leaks self-sustaining groups; this collector
//! finds them on demand. Candidates are objects that took a decrement
//! without reaching zero (only cycle-capable types are tracked). The
//! collection snapshots each reachable candidate's refcount, subtracts
//! every edge internal to the candidate graph, and whatever still has a
//! positive scratch count — or is pinned by a root — is externally
//! held; the rest is a dead cycle and is swept.

use std::ptr;

use object::{HeaderFlags, HeapHeader, Value};
use tracing::trace;

use crate::heap::Heap;
use crate::types::{
    destruct_object, is_cyclable, object_size, trace_object, DestructMode,
};

/// Result of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    /// Objects freed that were part of a reference cycle.
    pub num_cyc_freed: u32,
    /// Total objects freed, cascades included.
    pub num_obj_freed: u32,
}

impl Heap {
    /// Runs the collector once. `roots` are the externally live values
    /// (value stack, static variables, the running fiber chain); the
    /// collector never frees anything reachable from them.
    pub fn collect_cycles(&mut self, roots: &[Value]) -> GcStats {
        let freed_before = self.freed_count();

        // Unlink the candidate list. Entries destroyed since they were
        // buffered only need their memory reclaimed.
        let mut candidates: Vec<*mut HeapHeader> = Vec::new();
        let mut p = self.cyc_head;
        self.cyc_head = ptr::null_mut();
        while !p.is_null() {
            // SAFETY: list entries are either live or FREED_PENDING,
            // whose header stays valid until reclaimed here.
            unsafe {
                let next = (*p).next_cyc;
                (*p).next_cyc = ptr::null_mut();
                if (*p).has_flag(HeaderFlags::FREED_PENDING) {
                    let size = (*p).cyc as usize;
                    self.dealloc_raw(p, size);
                } else {
                    (*p).remove_flag(HeaderFlags::CYC_CANDIDATE);
                    candidates.push(p);
                }
                p = next;
            }
        }

        // Mark phase: gray everything reachable from the candidates
        // through cycle-capable edges, snapshotting rc into the scratch
        // count…
        let mut grayed: Vec<*mut HeapHeader> = Vec::new();
        let mut work = candidates;
        while let Some(s) = work.pop() {
            // SAFETY: grayed objects are live (rc > 0).
            unsafe {
                if (*s).has_flag(HeaderFlags::GRAY) {
                    continue;
                }
                (*s).add_flag(HeaderFlags::GRAY);
                (*s).cyc = (*s).rc;
                grayed.push(s);
                trace_object(&self.types, s, &mut |child| {
                    if child.is_heap() {
                        let c = child.as_ptr();
                        if is_cyclable((*c).type_id)
                            && !(*c).has_flag(HeaderFlags::GRAY)
                        {
                            work.push(c);
                        }
                    }
                });
            }
        }

        // …then subtract every edge internal to the gray graph.
        for &s in &grayed {
            // SAFETY: gray objects are live.
            unsafe {
                trace_object(&self.types, s, &mut |child| {
                    if child.is_heap() {
                        let c = child.as_ptr();
                        if (*c).has_flag(HeaderFlags::GRAY) {
                            (*c).cyc -= 1;
                        }
                    }
                });
            }
        }

        // Scan phase: a positive scratch count means a referencer
        // outside the gray graph. Roots pin their targets regardless of
        // refcount accounting (locals may borrow without retaining).
        let mut live_work: Vec<*mut HeapHeader> = Vec::new();
        for &s in &grayed {
            // SAFETY: gray objects are live.
            unsafe {
                if (*s).cyc > 0 {
                    live_work.push(s);
                }
            }
        }
        for r in roots {
            if r.is_heap() {
                let c = r.as_ptr();
                // SAFETY: roots are live.
                unsafe {
                    if (*c).has_flag(HeaderFlags::GRAY) {
                        live_work.push(c);
                    }
                }
            }
        }
        while let Some(s) = live_work.pop() {
            // SAFETY: repainted objects are live.
            unsafe {
                if (*s).has_flag(HeaderFlags::LIVE) {
                    continue;
                }
                (*s).add_flag(HeaderFlags::LIVE);
                trace_object(&self.types, s, &mut |child| {
                    if child.is_heap() {
                        let c = child.as_ptr();
                        if (*c).has_flag(HeaderFlags::GRAY)
                            && !(*c).has_flag(HeaderFlags::LIVE)
                        {
                            live_work.push(c);
                        }
                    }
                });
            }
        }

        // Sweep phase. Condemn first so destructors can tell dead-cycle
        // children (skipped; freed below) from outside references
        // (released normally). Survivor flags are cleared before any
        // destructor runs, because cascaded releases may free survivors
        // through the normal path.
        let mut condemned: Vec<(*mut HeapHeader, usize)> = Vec::new();
        for &s in &grayed {
            // SAFETY: gray objects are still allocated.
            unsafe {
                if (*s).has_flag(HeaderFlags::LIVE) {
                    (*s).remove_flag(HeaderFlags::GRAY);
                    (*s).remove_flag(HeaderFlags::LIVE);
                } else {
                    (*s).add_flag(HeaderFlags::FREED_IN_SWEEP);
                    condemned.push((s, object_size(&self.types, s)));
                }
            }
        }

        for &(s, _) in &condemned {
            // SAFETY: condemned objects are destructed exactly once.
            unsafe { destruct_object(self, s, DestructMode::Sweep) };
        }
        self.drain_pending();
        for &(s, size) in &condemned {
            // SAFETY: sizes were computed before the destructors ran.
            unsafe { self.free_object(s, size) };
        }

        let stats = GcStats {
            num_cyc_freed: condemned.len() as u32,
            num_obj_freed: (self.freed_count() - freed_before) as u32,
        };
        trace!(
            target: "heap",
            cyc = stats.num_cyc_freed,
            total = stats.num_obj_freed,
            "gc"
        );
        stats
    }
}
