use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::Value;

/// Key hashing and equality for [`ValueMap`].
///
/// Primitives hash and compare by bit pattern; heap strings compare by
/// content, other heap objects by identity. Content comparison needs the
/// VM (heap access plus the static-string table), so the map takes the
/// context as a parameter instead of owning one.
pub trait KeyContext {
    fn hash_key(&self, key: Value) -> u64;
    fn keys_equal(&self, a: Value, b: Value) -> bool;
}

/// Context for maps whose keys are primitives only. String keys fall
/// back to identity under this context.
#[derive(Debug, Default, Clone, Copy)]
pub struct BitwiseContext;

impl KeyContext for BitwiseContext {
    fn hash_key(&self, key: Value) -> u64 {
        let mut h = DefaultHasher::new();
        key.raw().hash(&mut h);
        h.finish()
    }

    fn keys_equal(&self, a: Value, b: Value) -> bool {
        a.raw() == b.raw()
    }
}

const BUCKET_EMPTY: u8 = 0;
const BUCKET_OCCUPIED: u8 = 1;

#[derive(Clone, Copy)]
struct Bucket {
    key: Value,
    val: Value,
    state: u8,
}

impl Bucket {
    const EMPTY: Self = Self {
        key: Value::NONE,
        val: Value::NONE,
        state: BUCKET_EMPTY,
    };
}

const MIN_CAP: usize = 8;

/// Open-addressed hash table from [`Value`] to [`Value`].
///
/// Power-of-two capacity, linear probing, backward-shift deletion (no
/// tombstones). The map stores keys and values as raw slots; retaining
/// and releasing them is the caller's job.
pub struct ValueMap {
    buckets: Box<[Bucket]>,
    len: usize,
}

impl ValueMap {
    pub fn new() -> Self {
        Self {
            buckets: Vec::new().into_boxed_slice(),
            len: 0,
        }
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets (iteration domain for [`entry_at`](Self::entry_at)).
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, ctx: &dyn KeyContext, key: Value) -> Option<Value> {
        self.find(ctx, key).map(|i| self.buckets[i].val)
    }

    pub fn contains(&self, ctx: &dyn KeyContext, key: Value) -> bool {
        self.find(ctx, key).is_some()
    }

    /// Inserts or replaces. Returns the previous value for a replaced
    /// key so the caller can release it; the key slot keeps the original
    /// key on replace.
    pub fn insert(
        &mut self,
        ctx: &dyn KeyContext,
        key: Value,
        val: Value,
    ) -> Option<Value> {
        if let Some(i) = self.find(ctx, key) {
            let old = self.buckets[i].val;
            self.buckets[i].val = val;
            return Some(old);
        }
        if self.buckets.is_empty() || self.len * 4 >= self.buckets.len() * 3 {
            self.grow(ctx);
        }
        let mask = self.buckets.len() - 1;
        let mut i = (ctx.hash_key(key) as usize) & mask;
        while self.buckets[i].state == BUCKET_OCCUPIED {
            i = (i + 1) & mask;
        }
        self.buckets[i] = Bucket {
            key,
            val,
            state: BUCKET_OCCUPIED,
        };
        self.len += 1;
        None
    }

    /// Removes a key, returning the stored key and value (both owned by
    /// the caller afterwards, which releases them).
    pub fn remove(
        &mut self,
        ctx: &dyn KeyContext,
        key: Value,
    ) -> Option<(Value, Value)> {
        let i = self.find(ctx, key)?;
        let entry = (self.buckets[i].key, self.buckets[i].val);
        self.backward_shift(ctx, i);
        self.len -= 1;
        Some(entry)
    }

    /// Entry at a bucket index, for iterator stepping and tracing.
    #[inline]
    pub fn entry_at(&self, idx: usize) -> Option<(Value, Value)> {
        let b = self.buckets.get(idx)?;
        (b.state == BUCKET_OCCUPIED).then_some((b.key, b.val))
    }

    /// First occupied bucket at or after `idx`.
    pub fn next_entry(&self, idx: usize) -> Option<(usize, Value, Value)> {
        for i in idx..self.buckets.len() {
            if self.buckets[i].state == BUCKET_OCCUPIED {
                let b = &self.buckets[i];
                return Some((i, b.key, b.val));
            }
        }
        None
    }

    /// Visits every occupied key and value slot.
    pub fn for_each(&self, mut f: impl FnMut(Value, Value)) {
        for b in self.buckets.iter() {
            if b.state == BUCKET_OCCUPIED {
                f(b.key, b.val);
            }
        }
    }

    fn find(&self, ctx: &dyn KeyContext, key: Value) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        let mask = self.buckets.len() - 1;
        let mut i = (ctx.hash_key(key) as usize) & mask;
        loop {
            let b = &self.buckets[i];
            if b.state == BUCKET_EMPTY {
                return None;
            }
            if ctx.keys_equal(b.key, key) {
                return Some(i);
            }
            i = (i + 1) & mask;
        }
    }

    fn grow(&mut self, ctx: &dyn KeyContext) {
        let new_cap = (self.buckets.len() * 2).max(MIN_CAP);
        let old = core::mem::replace(
            &mut self.buckets,
            vec![Bucket::EMPTY; new_cap].into_boxed_slice(),
        );
        let mask = new_cap - 1;
        for b in old.iter() {
            if b.state != BUCKET_OCCUPIED {
                continue;
            }
            let mut i = (ctx.hash_key(b.key) as usize) & mask;
            while self.buckets[i].state == BUCKET_OCCUPIED {
                i = (i + 1) & mask;
            }
            self.buckets[i] = *b;
        }
    }

    /// Classic backward-shift: close the gap at `i` by sliding later
    /// probe-chain entries up, so lookups never need tombstones.
    fn backward_shift(&mut self, ctx: &dyn KeyContext, i: usize) {
        let mask = self.buckets.len() - 1;
        let mut gap = i;
        self.buckets[gap] = Bucket::EMPTY;
        let mut j = gap;
        loop {
            j = (j + 1) & mask;
            if self.buckets[j].state == BUCKET_EMPTY {
                break;
            }
            let home = (ctx.hash_key(self.buckets[j].key) as usize) & mask;
            if ((j.wrapping_sub(home)) & mask) >= ((j.wrapping_sub(gap)) & mask)
            {
                self.buckets[gap] = self.buckets[j];
                self.buckets[j] = Bucket::EMPTY;
                gap = j;
            }
        }
    }
}

impl Default for ValueMap {
    fn default() -> Self {
        Self::new()
    }
}
