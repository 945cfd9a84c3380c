//! A hash table with Robin Hood linear probing and a bounded probe budget.
//!
//! Robin Hood hashing is open addressing with one twist: during insertion,
//! whenever the candidate entry has probed further from its ideal bucket
//! than the occupant it is standing on, the two trade places and the
//! displaced occupant continues the walk as the new candidate. Entries that
//! hash to the same masked bucket ("bucket groups") end up stored
//! contiguously, ordered by ideal position, with probe sequence lengths
//! (PSLs) inside a group ascending by exactly one. The payoff is very low
//! variance in probe distance, which keeps both lookups and the
//! remove-and-backshift deletion cheap and predictable.
//!
//! [`HashTable<V>`] stores values of type `V` and is deliberately
//! low-level: every operation takes the 32-bit hash and an equality
//! predicate from the caller. Prefer [`HashMap`](crate::hash_map::HashMap)
//! or [`HashSet`](crate::hash_set::HashSet) unless you are building your
//! own keyed structure.
//!
//! ## Design
//!
//! Each bucket's metadata is one packed `u32`: a 24-bit truncated hash, a
//! 7-bit PSL, and a 1-bit empty flag. The equality predicate only runs
//! when the full packed words of the candidate and the occupant are equal,
//! so the word doubles as a cheap fingerprint. The metadata array and the
//! entry array live in a single allocation, `[ buckets | pad | entries ]`,
//! with the padding computed by
//! [`Layout::extend`](core::alloc::Layout::extend) so the entry region
//! meets `V`'s alignment. The empty encoding is all-ones, which lets a
//! fresh metadata region be initialized by a plain `0xff` byte fill.
//!
//! Every insertion is refused up front with [`Error::BadHash`] while any
//! entry sits at the configured PSL limit. One insertion can raise the
//! table's peak PSL by at most one (the candidate and every displaced
//! occupant each land at the tail of their own group, raising that group's
//! maximum by at most one), so checking the limit before probing
//! guarantees the cascade terminates within budget and the 7-bit PSL
//! field cannot overflow mid-walk. The count of entries exactly at the
//! limit is maintained incrementally: it rises when a write lands at the
//! limit and falls when such an entry is removed, displaced, or
//! backshifted.
//!
//! Growth doubles the bucket count (capped at 2^24) and re-places every
//! entry by walking the old array in index order. The stored 24-bit
//! truncated hash is sufficient to compute any ideal position at any legal
//! table size, so the caller's hash function is never re-invoked. A failed
//! allocation during growth leaves the table exactly as it was.
//!
//! Sizes are always powers of two so the hash-to-bucket mapping is a mask,
//! and the probe walk wraps around the end of the array. Deletion shifts
//! the run of displaced successors back by one slot, splitting the run in
//! three pieces when it spans the wrap point.
//!
//! ## The iterator lock
//!
//! The table keeps a small runtime lock counting shared iterators (up to
//! 32767) or one exclusive cursor. Rust's borrow rules already make the
//! classic misuse (structurally mutating a table while iterating it) a
//! compile error, so in ordinary use the lock is invisible. It earns its
//! keep in two places: the shared-iterator count enforces the 32767-reader
//! policy bound, and an iterator that is leaked instead of dropped leaves
//! the lock held, after which further acquisitions fail with
//! [`Error::IterLock`] and structural mutation or dropping the table is a
//! contract violation reported through the [`fatal`](crate::fatal) hook.

use core::cell::Cell;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem;
use core::mem::MaybeUninit;
use core::ptr;
use core::ptr::NonNull;

use crate::bucket::Bucket;
use crate::error::Error;
use crate::fatal::fatal;

/// Largest supported entry size in bytes.
pub const MAX_ENTRY_SIZE: usize = 16384;

/// Largest supported bucket count.
const MAX_TABLE_SIZE: u32 = 1 << 24;

/// Capacity used when a caller passes 0.
const DEFAULT_CAPACITY: u32 = 6;

const DEFAULT_LOAD_FACTOR: u8 = 85;
const DEFAULT_PSL_LIMIT: u8 = 127;

/// Most shared iterators that may be live at once.
const MAX_SHARED_ITERS: u16 = 0x7fff;

#[inline(always)]
fn threshold(tsize: u32, lft: u8) -> u32 {
    (tsize as u64 * lft as u64 / 100) as u32
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum LockState {
    Unlocked,
    Shared(u16),
    Exclusive,
}

#[derive(Clone, Copy)]
struct DataLayout {
    layout: core::alloc::Layout,
    entries_offset: usize,
}

impl DataLayout {
    fn new<V>(tsize: u32) -> Result<Self, Error> {
        let buckets =
            core::alloc::Layout::array::<Bucket>(tsize as usize).map_err(|_| Error::TooBig)?;
        let entries = core::alloc::Layout::array::<MaybeUninit<V>>(tsize as usize)
            .map_err(|_| Error::TooBig)?;
        let (layout, entries_offset) = buckets.extend(entries).map_err(|_| Error::TooBig)?;
        Ok(DataLayout {
            layout,
            entries_offset,
        })
    }
}

/// Outcome of an insert-mode probe.
enum Probed<V> {
    /// The candidate was placed; statistics are updated.
    Inserted,
    /// The key is already present at `index`; the candidate is handed back.
    Present { index: u32, value: V },
    /// The table is at its growth threshold; nothing was changed.
    Grow(V),
}

/// Configuration for a [`HashTable`], fixed at construction.
///
/// Out-of-range values are contract violations and go through the
/// [`fatal`](crate::fatal) hook.
///
/// # Examples
///
/// ```
/// use rh_hash::HashTable;
///
/// let table: HashTable<u64> = HashTable::builder()
///     .load_factor_threshold(90)
///     .psl_limit(16)
///     .build(100)
///     .unwrap();
/// assert!(table.is_empty());
/// ```
pub struct Builder<V> {
    lft: u8,
    psl_limit: u8,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Builder<V> {
    /// Creates a builder with the default load factor threshold (85) and
    /// PSL limit (127).
    pub fn new() -> Self {
        Builder {
            lft: DEFAULT_LOAD_FACTOR,
            psl_limit: DEFAULT_PSL_LIMIT,
            _marker: PhantomData,
        }
    }

    /// Sets the load factor threshold, in percent of the bucket count.
    ///
    /// The table doubles once the entry count reaches
    /// `buckets * threshold / 100`. Must be in `1..=100`; values far from
    /// the default (85) are rarely useful.
    pub fn load_factor_threshold(mut self, lft: u8) -> Self {
        if !(1..=100).contains(&lft) {
            fatal("load_factor_threshold: value out of range");
        }
        self.lft = lft;
        self
    }

    /// Sets the upper bound on any entry's probe sequence length.
    ///
    /// Once an entry sits at the limit, insertions of new keys are refused
    /// with [`Error::BadHash`] until such an entry is removed. Must be in
    /// `1..=127`.
    pub fn psl_limit(mut self, limit: u8) -> Self {
        if !(1..=127).contains(&limit) {
            fatal("psl_limit: value out of range");
        }
        self.psl_limit = limit;
        self
    }

    /// Allocates a table sized for `capacity` entries.
    ///
    /// `capacity` of 0 selects a small default (6). The bucket count is
    /// the smallest power of two that keeps `capacity` entries under the
    /// load factor threshold, at most 2^24. A failed build may be retried.
    pub fn build(&self, capacity: u32) -> Result<HashTable<V>, Error> {
        HashTable::with_config(capacity, self.lft, self.psl_limit)
    }
}

impl<V> Default for Builder<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of a table's bookkeeping counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    /// Number of entries in the table.
    pub entries: u32,
    /// Number of buckets (always a power of two).
    pub buckets: u32,
    /// Entry count at which the next insertion triggers growth.
    pub threshold: u32,
    /// Sum of all occupants' probe sequence lengths.
    pub psl_sum: u32,
    /// Largest PSL seen since the arrays were (re)allocated.
    pub peak_psl: u8,
    /// Number of occupants whose PSL equals the configured limit.
    pub entries_at_limit: u32,
}

/// An open-addressing hash table with Robin Hood probing.
///
/// See the [module documentation](self) for the design. All operations
/// take a caller-computed 32-bit hash and an equality predicate; only the
/// low 24 bits of the hash are consumed, so callers must ensure good
/// mixing in the low bits.
pub struct HashTable<V> {
    layout: DataLayout,
    arrays: NonNull<u8>,

    tsize: u32,
    mask: u32,
    thold: u32,

    lft: u8,
    psl_limit: u8,

    count: u32,
    psl_sum: u32,
    peak_psl: u8,
    max_psl_ct: u32,

    iter_lock: Cell<LockState>,

    _marker: PhantomData<V>,
}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HashTable")
            .field("entries", &self.count)
            .field("buckets", &self.tsize)
            .field("threshold", &self.thold)
            .field("peak_psl", &self.peak_psl)
            .finish()
    }
}

impl<V> HashTable<V> {
    /// Returns a [`Builder`] for configuring the load factor threshold and
    /// PSL limit.
    pub fn builder() -> Builder<V> {
        Builder::new()
    }

    /// Creates a table with default configuration and capacity.
    ///
    /// # Errors
    ///
    /// [`Error::EntrySize`] if `size_of::<V>()` exceeds 16384,
    /// [`Error::Alloc`] if allocation fails.
    pub fn new() -> Result<Self, Error> {
        Self::with_capacity(0)
    }

    /// Creates a table with default configuration, sized for `capacity`
    /// entries (0 selects the default capacity).
    ///
    /// # Errors
    ///
    /// [`Error::EntrySize`], [`Error::TooBig`] for capacities the table
    /// cannot represent, or [`Error::Alloc`].
    pub fn with_capacity(capacity: u32) -> Result<Self, Error> {
        Self::with_config(capacity, DEFAULT_LOAD_FACTOR, DEFAULT_PSL_LIMIT)
    }

    fn with_config(capacity: u32, lft: u8, psl_limit: u8) -> Result<Self, Error> {
        debug_assert!((1..=100).contains(&lft));
        debug_assert!((1..=127).contains(&psl_limit));

        if mem::size_of::<V>() > MAX_ENTRY_SIZE {
            return Err(Error::EntrySize);
        }
        // Early bound so the sizing arithmetic below cannot overflow.
        if capacity > MAX_TABLE_SIZE {
            return Err(Error::TooBig);
        }
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };

        // Smallest power of two that keeps `capacity` entries under the
        // load factor threshold. Never below 2.
        let required = ((capacity as u64 * 100).div_ceil(lft as u64)) as u32;
        let tsize = required.next_power_of_two().max(2);
        if tsize > MAX_TABLE_SIZE {
            return Err(Error::TooBig);
        }

        let (layout, arrays) = Self::alloc_arrays(tsize)?;

        Ok(HashTable {
            layout,
            arrays,
            tsize,
            mask: tsize - 1,
            thold: threshold(tsize, lft),
            lft,
            psl_limit,
            count: 0,
            psl_sum: 0,
            peak_psl: 0,
            max_psl_ct: 0,
            iter_lock: Cell::new(LockState::Unlocked),
            _marker: PhantomData,
        })
    }

    fn alloc_arrays(tsize: u32) -> Result<(DataLayout, NonNull<u8>), Error> {
        let layout = DataLayout::new::<V>(tsize)?;
        // SAFETY: the layout is never zero-sized; the metadata array alone
        // is at least 8 bytes.
        let raw = unsafe { alloc::alloc::alloc(layout.layout) };
        let Some(arrays) = NonNull::new(raw) else {
            return Err(Error::Alloc);
        };
        // Mark every bucket empty: all-ones is the empty encoding, so one
        // byte fill over the metadata region (and the padding) suffices.
        unsafe { ptr::write_bytes(arrays.as_ptr(), 0xff, layout.entries_offset) };
        Ok((layout, arrays))
    }

    #[inline(always)]
    fn buckets_ptr(&self) -> NonNull<[Bucket]> {
        // SAFETY: `self.arrays` points at an allocation matching
        // `self.layout`, whose metadata region holds `tsize` buckets at
        // offset 0.
        unsafe { NonNull::slice_from_raw_parts(self.arrays.cast(), self.tsize as usize) }
    }

    #[inline(always)]
    fn entries_ptr(&self) -> NonNull<[MaybeUninit<V>]> {
        // SAFETY: `self.arrays` points at an allocation matching
        // `self.layout`, whose entry region starts at `entries_offset` and
        // holds `tsize` slots.
        unsafe {
            NonNull::slice_from_raw_parts(
                self.arrays.add(self.layout.entries_offset).cast(),
                self.tsize as usize,
            )
        }
    }

    /// # Safety
    ///
    /// `index` must be less than `self.tsize`.
    #[inline(always)]
    unsafe fn bucket(&self, index: u32) -> Bucket {
        // SAFETY: caller guarantees the index is in bounds.
        unsafe { *self.buckets_ptr().as_ref().get_unchecked(index as usize) }
    }

    /// # Safety
    ///
    /// `index` must be less than `self.tsize`.
    #[inline(always)]
    unsafe fn bucket_slot(&mut self, index: u32) -> &mut Bucket {
        // SAFETY: caller guarantees the index is in bounds.
        unsafe {
            self.buckets_ptr()
                .as_mut()
                .get_unchecked_mut(index as usize)
        }
    }

    /// # Safety
    ///
    /// `index` must be in bounds and its slot occupied.
    #[inline(always)]
    unsafe fn entry_ref(&self, index: u32) -> &V {
        // SAFETY: an occupied bucket guarantees an initialized entry slot.
        unsafe {
            self.entries_ptr()
                .as_ref()
                .get_unchecked(index as usize)
                .assume_init_ref()
        }
    }

    /// # Safety
    ///
    /// `index` must be in bounds and its slot occupied.
    #[inline(always)]
    unsafe fn entry_mut(&mut self, index: u32) -> &mut V {
        // SAFETY: an occupied bucket guarantees an initialized entry slot.
        unsafe {
            self.entries_ptr()
                .as_mut()
                .get_unchecked_mut(index as usize)
                .assume_init_mut()
        }
    }

    /// # Safety
    ///
    /// `index` must be in bounds and its slot occupied. The caller takes
    /// ownership; the slot must be overwritten or marked empty before any
    /// other access.
    #[inline(always)]
    unsafe fn read_slot(&self, index: u32) -> V {
        // SAFETY: an occupied bucket guarantees an initialized entry slot.
        unsafe {
            self.entries_ptr()
                .as_ref()
                .get_unchecked(index as usize)
                .assume_init_read()
        }
    }

    /// Place an entry and its metadata, updating the statistics.
    ///
    /// # Safety
    ///
    /// `index` must be in bounds, and the slot's previous contents (if
    /// any) must already have been moved out.
    unsafe fn write_slot(&mut self, index: u32, bucket: Bucket, value: V) {
        // SAFETY: caller guarantees the index is in bounds and the slot is
        // dead.
        unsafe {
            *self.bucket_slot(index) = bucket;
            self.entries_ptr()
                .as_mut()
                .get_unchecked_mut(index as usize)
                .write(value);
        }
        self.count += 1;
        self.psl_sum += bucket.psl();
        if bucket.psl() > self.peak_psl as u32 {
            self.peak_psl = bucket.psl() as u8;
        }
        if bucket.psl() == self.psl_limit as u32 {
            self.max_psl_ct += 1;
        }
    }

    /// Account for an occupant leaving the table (removal or displacement).
    fn record_remove(&mut self, bucket: Bucket) {
        self.count -= 1;
        self.psl_sum -= bucket.psl();
        if bucket.psl() == self.psl_limit as u32 {
            debug_assert!(self.max_psl_ct > 0);
            self.max_psl_ct -= 1;
        }
    }

    /// Returns the number of entries in the table.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Returns `true` if the table contains no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns the number of entries the table holds before it grows.
    pub fn capacity(&self) -> usize {
        self.thold as usize
    }

    /// Returns a snapshot of the table's bookkeeping counters.
    pub fn stats(&self) -> TableStats {
        TableStats {
            entries: self.count,
            buckets: self.tsize,
            threshold: self.thold,
            psl_sum: self.psl_sum,
            peak_psl: self.peak_psl,
            entries_at_limit: self.max_psl_ct,
        }
    }

    /// Looks up an entry by hash and equality predicate.
    ///
    /// `eq` is called only for entries whose packed metadata word exactly
    /// matches the candidate's (same truncated hash, same PSL, occupied).
    ///
    /// # Examples
    ///
    /// ```
    /// use rh_hash::HashTable;
    ///
    /// fn hash(k: u32) -> u32 {
    ///     k.wrapping_mul(0x9e3779b1)
    /// }
    ///
    /// let mut table: HashTable<(u32, &str)> = HashTable::new().unwrap();
    /// table.add(hash(7), |e| e.0 == 7, (7, "seven")).unwrap();
    /// assert_eq!(table.find(hash(7), |e| e.0 == 7), Some(&(7, "seven")));
    /// assert_eq!(table.find(hash(8), |e| e.0 == 8), None);
    /// ```
    pub fn find(&self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<&V> {
        let index = self.probe_search(hash, eq)?;
        // SAFETY: the probe only returns occupied indices.
        Some(unsafe { self.entry_ref(index) })
    }

    /// Looks up an entry and returns a mutable reference to it.
    ///
    /// The parts of the entry that the hash and equality predicates depend
    /// on must not be changed through the returned reference; rewriting
    /// them corrupts the table.
    pub fn find_mut(&mut self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        let index = self.probe_search(hash, eq)?;
        // SAFETY: the probe only returns occupied indices.
        Some(unsafe { self.entry_mut(index) })
    }

    /// Inserts an entry if its key is not already present.
    ///
    /// Returns `Ok(None)` when the entry was inserted, and `Ok(Some(value))`
    /// handing the candidate back when the key was already present (the
    /// table is unchanged).
    ///
    /// # Errors
    ///
    /// [`Error::BadHash`] while any entry sits at the PSL limit (checked
    /// before probing), [`Error::TooBig`] when growth would exceed 2^24
    /// buckets, [`Error::Alloc`] when growth fails to allocate. In every
    /// error case the table is left untouched.
    pub fn add(&mut self, hash: u32, eq: impl Fn(&V) -> bool, value: V) -> Result<Option<V>, Error> {
        self.guard_mutation("add: table has live iterators");
        self.insert_impl(hash, eq, value, false)
    }

    /// Inserts or replaces the entry for a key.
    ///
    /// Returns `Ok(None)` when the key was absent (the entry is now
    /// inserted) and `Ok(Some(old))` with the displaced entry when the key
    /// was present.
    ///
    /// # Errors
    ///
    /// As for [`add`](Self::add).
    pub fn set(&mut self, hash: u32, eq: impl Fn(&V) -> bool, value: V) -> Result<Option<V>, Error> {
        self.guard_mutation("set: table has live iterators");
        self.insert_impl(hash, eq, value, true)
    }

    fn insert_impl(
        &mut self,
        hash: u32,
        eq: impl Fn(&V) -> bool,
        value: V,
        replace: bool,
    ) -> Result<Option<V>, Error> {
        if self.max_psl_ct != 0 {
            return Err(Error::BadHash);
        }

        let mut value = value;
        let mut unique = false;
        loop {
            value = match self.probe_insert(hash, &eq, value, unique) {
                Probed::Inserted => return Ok(None),
                Probed::Present { index, value } => {
                    return if replace {
                        // SAFETY: the probe returned an occupied index.
                        Ok(Some(mem::replace(unsafe { self.entry_mut(index) }, value)))
                    } else {
                        Ok(Some(value))
                    };
                }
                Probed::Grow(value) => {
                    self.grow()?;
                    // The probe that requested growth established that the
                    // key is absent.
                    unique = true;
                    value
                }
            };
        }
    }

    /// Exchanges the entry for a key with `*value` in place.
    ///
    /// Returns `true` and swaps when the key is present; returns `false`
    /// leaving both the table and `*value` untouched otherwise. The new
    /// entry must carry the same key as the one it replaces.
    pub fn swap(&mut self, hash: u32, eq: impl Fn(&V) -> bool, value: &mut V) -> bool {
        match self.probe_search(hash, &eq) {
            Some(index) => {
                // SAFETY: the probe returned an occupied index.
                mem::swap(unsafe { self.entry_mut(index) }, value);
                true
            }
            None => false,
        }
    }

    /// Removes the entry for a key and returns it.
    ///
    /// Dropping the returned value releases its resources; keeping it is
    /// the "pop" use. Returns `None` when the key is absent.
    pub fn remove(&mut self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<V> {
        self.guard_mutation("remove: table has live iterators");
        let index = self.probe_search(hash, eq)?;
        Some(self.remove_at(index))
    }

    /// Search walk. Returns the index of the matching occupant, or `None`.
    ///
    /// The running PSL is kept in a plain integer rather than the packed
    /// word: walking past the end of a limit-length group can push it to
    /// `psl_limit + 1`, which must not wrap the 7-bit field. The packed
    /// compare below cannot false-positive in that state because the
    /// overflowed bit lands on the empty flag.
    fn probe_search(&self, hash: u32, eq: impl Fn(&V) -> bool) -> Option<u32> {
        let mut psl: u32 = 0;
        let mut p = hash & self.mask;
        loop {
            // SAFETY: `p` is masked to the table size.
            let occ = unsafe { self.bucket(p) };
            if occ.is_empty() {
                return None;
            }
            if occ == Bucket::occupied(hash, psl) {
                // SAFETY: the bucket is occupied.
                if eq(unsafe { self.entry_ref(p) }) {
                    return Some(p);
                }
            }
            // An occupant closer to home than the candidate means the
            // candidate's group is already over.
            if psl > occ.psl() {
                return None;
            }
            psl += 1;
            p = (p + 1) & self.mask;
        }
    }

    /// Insert walk: the Robin Hood cascade.
    ///
    /// With `unique` set (re-population after growth, or a retried insert
    /// whose first probe established absence) the equality predicate is
    /// never consulted. A displaced occupant always continues as a unique
    /// candidate, since it came out of the table.
    fn probe_insert(
        &mut self,
        hash: u32,
        eq: impl Fn(&V) -> bool,
        mut value: V,
        mut unique: bool,
    ) -> Probed<V> {
        let mut cand = Bucket::occupied(hash, 0);
        let mut p = hash & self.mask;
        loop {
            // SAFETY: `p` is masked to the table size.
            let occ = unsafe { self.bucket(p) };

            if occ.is_empty() {
                if self.count == self.thold {
                    return Probed::Grow(value);
                }
                // SAFETY: the slot is empty.
                unsafe { self.write_slot(p, cand, value) };
                return Probed::Inserted;
            }

            if !unique && occ == cand {
                // SAFETY: the bucket is occupied.
                if eq(unsafe { self.entry_ref(p) }) {
                    return Probed::Present { index: p, value };
                }
            }

            if cand.psl() > occ.psl() {
                // The growth check matters only before the first
                // displacement; afterwards the cascade must run to
                // completion, and the occupancy is unchanged by it.
                if !unique && self.count == self.thold {
                    return Probed::Grow(value);
                }
                self.record_remove(occ);
                // SAFETY: the slot is occupied; its entry is moved out and
                // the slot is immediately rewritten with the candidate.
                let displaced = unsafe { self.read_slot(p) };
                unsafe { self.write_slot(p, cand, value) };
                value = displaced;
                cand = occ;
                unique = true;
            }

            // The preemptive limit check in `insert_impl` guarantees the
            // cascade stays within budget.
            debug_assert!(cand.psl() < self.psl_limit as u32);
            cand = cand.step();
            p = (p + 1) & self.mask;
        }
    }

    /// Doubles the table, re-placing every entry from its stored hash.
    fn grow(&mut self) -> Result<(), Error> {
        if self.tsize == MAX_TABLE_SIZE {
            return Err(Error::TooBig);
        }
        let new_tsize = self.tsize * 2;
        let (layout, arrays) = Self::alloc_arrays(new_tsize)?;

        let old_layout = mem::replace(&mut self.layout, layout);
        let old_arrays = mem::replace(&mut self.arrays, arrays);
        let old_tsize = mem::replace(&mut self.tsize, new_tsize);
        self.mask = new_tsize - 1;
        self.thold = threshold(new_tsize, self.lft);
        self.count = 0;
        self.psl_sum = 0;
        self.peak_psl = 0;
        self.max_psl_ct = 0;

        // SAFETY: the old block is untouched while entries are moved out;
        // each occupied old slot is initialized and read exactly once, and
        // the block is deallocated without dropping the moved-out values.
        unsafe {
            let old_buckets = old_arrays.cast::<Bucket>().as_ptr();
            let old_entries = old_arrays
                .as_ptr()
                .add(old_layout.entries_offset)
                .cast::<MaybeUninit<V>>();
            for index in 0..old_tsize as usize {
                let bucket = *old_buckets.add(index);
                if bucket.is_empty() {
                    continue;
                }
                let value = (*old_entries.add(index)).assume_init_read();
                // The stored truncated hash is all that indexing ever
                // consumes, so it fully determines the new ideal position.
                match self.probe_insert(bucket.hash(), |_| false, value, true) {
                    Probed::Inserted => {}
                    _ => unreachable!("re-population cannot collide or overflow"),
                }
            }
            alloc::alloc::dealloc(old_arrays.as_ptr(), old_layout.layout);
        }

        Ok(())
    }

    /// Removes the occupant of `pos` and backshifts its displaced
    /// successors.
    fn remove_at(&mut self, pos: u32) -> V {
        // SAFETY: `pos` is occupied; the slot is dead from here until the
        // shifts below overwrite it or it is marked empty.
        let victim = unsafe { self.read_slot(pos) };
        let bucket = unsafe { self.bucket(pos) };
        self.record_remove(bucket);

        // The move run extends to the first empty bucket or group leader
        // (PSL 0). The full-cycle check terminates the scan when a table
        // at a 100% threshold is completely full of displaced entries.
        let mut end = pos;
        let mut next = (pos + 1) & self.mask;
        loop {
            if next == pos {
                break;
            }
            // SAFETY: `next` is masked to the table size.
            let b = unsafe { self.bucket(next) };
            if b.is_empty() || b.psl() == 0 {
                break;
            }
            end = next;
            next = (next + 1) & self.mask;
        }

        if pos == end {
            // Nothing follows the victim.
        } else if pos < end {
            self.shift_down(pos, end - pos);
        } else {
            // The run wraps: shift the tail, rotate index 0 into the last
            // slot, then shift the head.
            if pos < self.mask {
                self.shift_down(pos, self.mask - pos);
            }
            self.shift_wrap();
            self.shift_down(0, end);
        }

        // SAFETY: `end` is in bounds.
        unsafe { self.bucket_slot(end).set_empty() };
        victim
    }

    /// Shifts `count` buckets and entries starting at `dest + 1` down one
    /// position. Does not handle wrap-around.
    fn shift_down(&mut self, dest: u32, count: u32) {
        debug_assert!(dest + count < self.tsize);

        // SAFETY: the source and destination ranges are in bounds, and the
        // destination slot's entry was moved out by the caller. Overlapping
        // copies are fine for `ptr::copy`.
        unsafe {
            let entries = self.entries_ptr().cast::<MaybeUninit<V>>().as_ptr();
            ptr::copy(
                entries.add(dest as usize + 1),
                entries.add(dest as usize),
                count as usize,
            );
            let buckets = self.buckets_ptr().cast::<Bucket>().as_ptr();
            ptr::copy(
                buckets.add(dest as usize + 1),
                buckets.add(dest as usize),
                count as usize,
            );
        }

        // Every shifted entry is now one slot closer to its ideal position.
        for index in dest..dest + count {
            // SAFETY: `index` is in bounds.
            let b = unsafe { self.bucket(index) };
            if b.psl() == self.psl_limit as u32 {
                debug_assert!(self.max_psl_ct > 0);
                self.max_psl_ct -= 1;
            }
            unsafe { self.bucket_slot(index).dec_psl() };
        }
        self.psl_sum -= count;
    }

    /// Rotates the occupant of index 0 into the last slot of the table.
    fn shift_wrap(&mut self) {
        let last = self.mask;

        // SAFETY: slot 0 is occupied (it is part of the move run) and slot
        // `last` was vacated by the preceding tail shift or is the victim.
        unsafe {
            let entries = self.entries_ptr().cast::<MaybeUninit<V>>().as_ptr();
            ptr::copy_nonoverlapping(entries, entries.add(last as usize), 1);
            let b0 = self.bucket(0);
            *self.bucket_slot(last) = b0;
        }

        // SAFETY: `last` is in bounds.
        let b = unsafe { self.bucket(last) };
        if b.psl() == self.psl_limit as u32 {
            debug_assert!(self.max_psl_ct > 0);
            self.max_psl_ct -= 1;
        }
        unsafe { self.bucket_slot(last).dec_psl() };
        self.psl_sum -= 1;
    }

    fn guard_mutation(&self, msg: &'static str) {
        if self.iter_lock.get() != LockState::Unlocked {
            fatal(msg);
        }
    }

    /// Returns a shared iterator over the entries, in bucket order.
    ///
    /// Up to 32767 shared iterators may be live at once. While one is
    /// live, structural mutation of the table is a borrow error:
    ///
    /// ```compile_fail
    /// use rh_hash::HashTable;
    ///
    /// let mut table: HashTable<u32> = HashTable::new().unwrap();
    /// table.add(1, |v| *v == 1, 1).unwrap();
    /// let iter = table.iter().unwrap();
    /// table.add(2, |v| *v == 2, 2).unwrap();
    /// assert_eq!(iter.count(), 1);
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::IterCount`] when 32767 shared iterators are already live;
    /// [`Error::IterLock`] when the exclusive lock is held (possible only
    /// if an exclusive cursor was leaked).
    pub fn iter(&self) -> Result<Iter<'_, V>, Error> {
        match self.iter_lock.get() {
            LockState::Exclusive => Err(Error::IterLock),
            LockState::Shared(n) if n >= MAX_SHARED_ITERS => Err(Error::IterCount),
            LockState::Shared(n) => {
                self.iter_lock.set(LockState::Shared(n + 1));
                Ok(Iter {
                    table: self,
                    next: 0,
                })
            }
            LockState::Unlocked => {
                self.iter_lock.set(LockState::Shared(1));
                Ok(Iter {
                    table: self,
                    next: 0,
                })
            }
        }
    }

    /// Returns an exclusive cursor supporting in-place removal and
    /// replacement during iteration.
    ///
    /// While the cursor is live, every other use of the table is a borrow
    /// error:
    ///
    /// ```compile_fail
    /// use rh_hash::HashTable;
    ///
    /// let mut table: HashTable<u32> = HashTable::new().unwrap();
    /// table.add(1, |v| *v == 1, 1).unwrap();
    /// let mut cursor = table.iter_mut().unwrap();
    /// table.find(1, |v| *v == 1);
    /// cursor.next();
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::IterLock`] when any iterator lock is held (possible only
    /// if an iterator was leaked; live iterators are a borrow error).
    pub fn iter_mut(&mut self) -> Result<IterMut<'_, V>, Error> {
        if self.iter_lock.get() != LockState::Unlocked {
            return Err(Error::IterLock);
        }
        self.iter_lock.set(LockState::Exclusive);
        Ok(IterMut {
            table: self,
            cursor: Cursor::Start,
        })
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        if self.iter_lock.get() != LockState::Unlocked {
            fatal("drop: table has live iterators");
        }

        // SAFETY: occupied buckets mark initialized entries; each is
        // dropped once, then the single backing allocation is released.
        unsafe {
            if mem::needs_drop::<V>() && self.count > 0 {
                for index in 0..self.tsize {
                    if !self.bucket(index).is_empty() {
                        self.entries_ptr()
                            .as_mut()
                            .get_unchecked_mut(index as usize)
                            .assume_init_drop();
                    }
                }
            }
            alloc::alloc::dealloc(self.arrays.as_ptr(), self.layout.layout);
        }
    }
}

/// A shared iterator over a [`HashTable`], created by
/// [`iter`](HashTable::iter).
///
/// Yields `&V` in bucket order. Releases its slot in the iterator lock
/// when dropped.
#[derive(Debug)]
pub struct Iter<'a, V> {
    table: &'a HashTable<V>,
    next: u32,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<&'a V> {
        while self.next < self.table.tsize {
            let index = self.next;
            self.next += 1;
            // SAFETY: `index` is below `tsize`, and occupied buckets mark
            // initialized entries.
            unsafe {
                if !self.table.bucket(index).is_empty() {
                    return Some(self.table.entry_ref(index));
                }
            }
        }
        None
    }
}

impl<V> Drop for Iter<'_, V> {
    fn drop(&mut self) {
        match self.table.iter_lock.get() {
            LockState::Shared(1) => self.table.iter_lock.set(LockState::Unlocked),
            LockState::Shared(n) => self.table.iter_lock.set(LockState::Shared(n - 1)),
            state => debug_assert!(false, "iterator lock out of sync: {state:?}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    /// Before the first entry.
    Start,
    /// The entry at this index was the last one yielded.
    At(u32),
    /// The last-yielded entry was removed; scanning resumes at this index
    /// so a backshifted successor is revisited.
    Removed(u32),
    /// Past the last entry.
    End,
}

/// An exclusive cursor over a [`HashTable`], created by
/// [`iter_mut`](HashTable::iter_mut).
///
/// Unlike [`Iter`] this is not an [`Iterator`]: [`remove`](Self::remove)
/// invalidates positions, so entries are borrowed one at a time through
/// [`next`](Self::next). Releases the iterator lock when dropped.
#[derive(Debug)]
pub struct IterMut<'a, V> {
    table: &'a mut HashTable<V>,
    cursor: Cursor,
}

impl<V> IterMut<'_, V> {
    /// Advances to the next entry and returns a mutable reference to it,
    /// or `None` when the table is exhausted.
    ///
    /// The parts of the entry the hash and equality predicates depend on
    /// must not be changed through the returned reference.
    pub fn next(&mut self) -> Option<&mut V> {
        let mut index = match self.cursor {
            Cursor::Start => 0,
            Cursor::At(i) => i + 1,
            Cursor::Removed(i) => i,
            Cursor::End => return None,
        };
        while index < self.table.tsize {
            // SAFETY: `index` is below `tsize`, and occupied buckets mark
            // initialized entries.
            unsafe {
                if !self.table.bucket(index).is_empty() {
                    self.cursor = Cursor::At(index);
                    return Some(self.table.entry_mut(index));
                }
            }
            index += 1;
        }
        self.cursor = Cursor::End;
        None
    }

    /// Removes the last entry returned by [`next`](Self::next) and returns
    /// it.
    ///
    /// The cursor steps back so that an entry backshifted into the vacated
    /// slot is yielded by the following `next`.
    ///
    /// # Errors
    ///
    /// [`Error::IterNoLast`] before the first `next`, after exhaustion, or
    /// when the last-yielded entry was already removed. The table is not
    /// modified.
    pub fn remove(&mut self) -> Result<V, Error> {
        let Cursor::At(index) = self.cursor else {
            return Err(Error::IterNoLast);
        };
        let value = self.table.remove_at(index);
        self.cursor = Cursor::Removed(index);
        Ok(value)
    }

    /// Replaces the last entry returned by [`next`](Self::next) in place,
    /// returning the previous entry.
    ///
    /// The new entry must carry the same key as the one it replaces;
    /// installing a different key corrupts the table.
    ///
    /// # Errors
    ///
    /// [`Error::IterNoLast`], as for [`remove`](Self::remove).
    pub fn replace(&mut self, value: V) -> Result<V, Error> {
        let Cursor::At(index) = self.cursor else {
            return Err(Error::IterNoLast);
        };
        // SAFETY: the cursor only points at occupied slots.
        Ok(mem::replace(unsafe { self.table.entry_mut(index) }, value))
    }
}

impl<V> Drop for IterMut<'_, V> {
    fn drop(&mut self) {
        debug_assert!(self.table.iter_lock.get() == LockState::Exclusive);
        self.table.iter_lock.set(LockState::Unlocked);
    }
}

#[cfg(test)]
impl<V> HashTable<V> {
    /// Recomputes every structural invariant from the metadata array and
    /// asserts it matches the incremental bookkeeping.
    fn assert_invariants(&self) {
        let mut count = 0u32;
        let mut psl_sum = 0u32;
        let mut at_limit = 0u32;
        let mut live_peak = 0u32;

        for p in 0..self.tsize {
            let b = unsafe { self.bucket(p) };
            if b.is_empty() {
                continue;
            }
            count += 1;
            psl_sum += b.psl();
            live_peak = live_peak.max(b.psl());
            if b.psl() == self.psl_limit as u32 {
                at_limit += 1;
            }
            assert!(b.psl() <= self.psl_limit as u32, "psl over limit at {p}");

            let ideal = b.hash() & self.mask;
            let distance = (p + self.tsize - ideal) & self.mask;
            assert_eq!(distance, b.psl(), "psl mismatches distance at {p}");

            if b.psl() > 0 {
                let prev = unsafe { self.bucket((p + self.mask) & self.mask) };
                assert!(!prev.is_empty(), "gap before displaced entry at {p}");
                assert!(
                    b.psl() <= prev.psl() + 1,
                    "group ordering violated at {p}"
                );
            }
        }

        assert_eq!(count, self.count);
        assert_eq!(psl_sum, self.psl_sum);
        assert_eq!(at_limit, self.max_psl_ct);
        assert!(live_peak <= self.peak_psl as u32);
        assert!(self.peak_psl <= self.psl_limit);
        if self.count > 0 {
            assert!(self.count <= self.thold);
        }
        assert!(self.tsize.is_power_of_two() && self.tsize <= MAX_TABLE_SIZE);
    }
}
