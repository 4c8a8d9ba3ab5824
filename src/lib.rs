//! Approximate-membership filter based on the [Vector Quotient Filter
//! (VQF)](https://dl.acm.org/doi/10.1145/3448016.3452841), extended to carry
//! an 8-bit payload with every stored fingerprint.
//!
//! The filter packs 28 tag slots and a 64-bit run-boundary metadata word into
//! each 64-byte cache line and places fingerprints with two-choice hashing,
//! so inserts, deletions and lookups touch at most two cache lines. Unlike a
//! bloom filter it supports deletions, duplicate fingerprints, and point
//! lookups of the payload(s) stored with a fingerprint.
//!
//! ### Example
//!
//! ```rust
//! let f = vqfilter::Filter::new(10_000).unwrap();
//! for i in 0..1000u64 {
//!     f.insert(i).unwrap();
//! }
//! for i in 0..1000u64 {
//!     assert!(f.contains(i));
//! }
//! ```
//!
//! ### Concurrency
//!
//! All operations take `&self`: mutating operations serialize on a per-block
//! spin lock (bit 63 of the block's metadata word) and the filter is `Send +
//! Sync`, so it can be shared across threads behind an `Arc` without external
//! locking. Lookups are lock-free.
//!
//! ### Hasher
//!
//! The item-level API hashes with [xxhash3](https://crates.io/crates/xxhash-rust),
//! which is fast and stable across platforms. The `*_fingerprint` methods
//! accept pre-computed 64-bit hashes instead.
//!
//! ### False positives
//!
//! Tags are 8 bits, so a lookup of an absent item reports `true` with
//! probability around 2⁻⁸ times the load of its two candidate blocks. False
//! negatives never occur.
//!
//! ### Legacy x86_64 CPUs support
//!
//! The implementation assumes the `popcnt` instruction (equivalent to
//! `integer.count_ones()`) is present when compiling for x86_64 targets. This
//! is theoretically not guaranteed as the instruction is only available on
//! AMD/Intel CPUs released after 2007/2008. If that's not the case the Filter
//! constructor will panic. Support for such legacy x86_64 CPUs can be
//! optionally enabled with the `legacy_x86_64_support` feature, which incurs
//! a small performance penalty.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use block::{Block, BUCKETS_PER_BLOCK, SLOTS_PER_BLOCK, TAG_BITS, TAG_MASK};
use stable_hasher::StableHasher;

mod block;
mod stable_hasher;

/// MurmurHash2 multiplier used to scramble the tag into the alternate bucket.
/// The only property required of it is that the primary/alternate pair is a
/// pure function of `(hash, tag)`, so removals and lookups revisit the blocks
/// an insert chose from.
const ALT_SCRAMBLE: u64 = 0x5bd1_e995;

/// Free-slot count below which an insert also weighs the alternate block.
const ALT_CHECK_THRESHOLD: u32 = 43;

/// Approximate-membership filter over 64-bit hashes with an 8-bit payload per
/// entry.
///
/// The filter is a flat array of 64-byte blocks. A hash maps to a primary and
/// an alternate block; an insert appends the hash's 8-bit tag (plus payload)
/// to the end of its bucket's run in the less loaded of the two, and lookups
/// scan the matching run in both.
///
/// Duplicate fingerprints are kept: inserting the same hash twice stores two
/// tags, and [`remove_fingerprint`](Filter::remove_fingerprint) peels one
/// occurrence at a time.
pub struct Filter {
    blocks: Box<[Block]>,
    /// `nblocks × 36 × 256`; hashes are reduced into this range.
    range: u64,
    nslots: u64,
    len: AtomicU64,
}

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Both candidate blocks of the hash are out of free slots.
    CapacityExceeded,
    /// The requested slot count is not addressable with 64-bit hashes.
    CapacityTooLarge,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for Error {}

impl Filter {
    /// Creates a filter with at least `min_slots` tag slots, rounded up to a
    /// whole number of blocks.
    ///
    /// Errors with [`Error::CapacityTooLarge`] if the requested size is not
    /// addressable.
    pub fn new(min_slots: u64) -> Result<Filter, Error> {
        Self::check_cpu_support();
        let nblocks = min_slots / SLOTS_PER_BLOCK as u64 + 1;
        let range = nblocks
            .checked_mul(BUCKETS_PER_BLOCK)
            .and_then(|buckets| buckets.checked_mul(1 << TAG_BITS))
            .ok_or(Error::CapacityTooLarge)?;
        let nblocks = usize::try_from(nblocks).map_err(|_| Error::CapacityTooLarge)?;
        let blocks: Box<[Block]> = (0..nblocks).map(|_| Block::new()).collect();
        Ok(Filter {
            blocks,
            range,
            nslots: nblocks as u64 * SLOTS_PER_BLOCK as u64,
            len: AtomicU64::new(0),
        })
    }

    fn check_cpu_support() {
        #[cfg(all(
            target_arch = "x86_64",
            not(feature = "legacy_x86_64_support"),
            not(target_feature = "popcnt")
        ))]
        assert!(
            std::is_x86_feature_detected!("popcnt"),
            "CPU doesn't support the popcnt instruction"
        );
    }

    /// Inserts the fingerprint specified by `hash` with a zero payload.
    ///
    /// Duplicates are always stored; see the type-level docs.
    ///
    /// Returns [`Error::CapacityExceeded`] if both candidate blocks are full,
    /// leaving the filter unchanged.
    #[inline]
    pub fn insert_fingerprint(&self, hash: u64) -> Result<(), Error> {
        self.insert_fingerprint_value(hash, 0)
    }

    /// Inserts the fingerprint specified by `hash` carrying `value`.
    ///
    /// The tag is appended to the end of its bucket's run in the candidate
    /// block with more free slots; ties go to the primary. Returns
    /// [`Error::CapacityExceeded`] if both candidate blocks are full.
    pub fn insert_fingerprint_value(&self, hash: u64, value: u8) -> Result<(), Error> {
        let (primary, alternate, tag) = self.candidates(hash);
        let primary_block = primary / BUCKETS_PER_BLOCK;
        let alternate_block = alternate / BUCKETS_PER_BLOCK;

        let mut bucket = primary;
        let mut block = &self.blocks[primary_block as usize];
        block.lock();
        let mut free = block::free_slots(block.md());
        self.prefetch(alternate_block);

        if free < ALT_CHECK_THRESHOLD && primary_block != alternate_block {
            // Two-block decision: drop the primary lock, take both in block
            // order, and re-read the free counts under the locks.
            block.unlock();
            self.lock_pair(primary_block, alternate_block);
            let alternate_ref = &self.blocks[alternate_block as usize];
            let primary_free = block::free_slots(block.md());
            let alternate_free = block::free_slots(alternate_ref.md());
            if alternate_free > primary_free {
                block.unlock();
                bucket = alternate;
                block = alternate_ref;
                free = alternate_free;
            } else {
                alternate_ref.unlock();
                free = primary_free;
            }
        }

        if free == 0 {
            block.unlock();
            return Err(Error::CapacityExceeded);
        }

        let offset = (bucket % BUCKETS_PER_BLOCK) as u32;
        let md = block.md();
        let slot = block::run_end(md, offset);
        block.insert_tag(slot as usize, u16::from(value) << TAG_BITS | u16::from(tag));
        block.store_md(block::extend(md, slot + offset));
        block.unlock();
        self.len.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Removes one occurrence of the fingerprint specified by `hash`,
    /// returning whether a matching tag was found in either candidate block.
    ///
    /// Removing a fingerprint that was never inserted may evict a colliding
    /// entry and introduce false negatives for it.
    pub fn remove_fingerprint(&self, hash: u64) -> bool {
        let (primary, alternate, tag) = self.candidates(hash);
        self.prefetch(alternate / BUCKETS_PER_BLOCK);
        self.remove_in(primary, tag) || self.remove_in(alternate, tag)
    }

    fn remove_in(&self, bucket: u64, tag: u8) -> bool {
        let block = self.block_of(bucket);
        let offset = (bucket % BUCKETS_PER_BLOCK) as u32;
        block.lock();
        let md = block.md();
        let mask = block.match_mask(md, offset, tag);
        if mask == 0 {
            block.unlock();
            return false;
        }
        let slot = mask.trailing_zeros();
        block.remove_tag(slot as usize);
        block.store_md(block::contract(md, slot + offset));
        block.unlock();
        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Returns whether the fingerprint specified by `hash` is present
    /// (probabilistically: false positives possible, false negatives not).
    pub fn contains_fingerprint(&self, hash: u64) -> bool {
        let (primary, alternate, tag) = self.candidates(hash);
        self.prefetch(alternate / BUCKETS_PER_BLOCK);
        self.mask_in(primary, tag) != 0 || self.mask_in(alternate, tag) != 0
    }

    /// Returns the payload of the first matching slot for `hash`, searching
    /// the primary block before the alternate.
    ///
    /// With duplicate or colliding tags the lowest matching slot wins.
    pub fn get_fingerprint(&self, hash: u64) -> Option<u8> {
        let (primary, alternate, tag) = self.candidates(hash);
        self.prefetch(alternate / BUCKETS_PER_BLOCK);
        self.value_in(primary, tag)
            .or_else(|| self.value_in(alternate, tag))
    }

    /// Returns the payloads of every matching slot in the first candidate
    /// block holding any match, in slot order. Empty means absent.
    ///
    /// Matches in the other candidate block are not merged in.
    pub fn values_fingerprint(&self, hash: u64) -> Vec<u8> {
        let (primary, alternate, tag) = self.candidates(hash);
        self.prefetch(alternate / BUCKETS_PER_BLOCK);
        let values = self.values_in(primary, tag);
        if !values.is_empty() {
            return values;
        }
        self.values_in(alternate, tag)
    }

    /// Inserts `item` with a zero payload. See
    /// [`insert_fingerprint`](Filter::insert_fingerprint).
    #[inline]
    pub fn insert<T: Hash>(&self, item: T) -> Result<(), Error> {
        self.insert_fingerprint(self.hash(item))
    }

    /// Inserts `item` carrying `value`. See
    /// [`insert_fingerprint_value`](Filter::insert_fingerprint_value).
    #[inline]
    pub fn insert_value<T: Hash>(&self, item: T, value: u8) -> Result<(), Error> {
        self.insert_fingerprint_value(self.hash(item), value)
    }

    /// Removes one occurrence of `item`. See
    /// [`remove_fingerprint`](Filter::remove_fingerprint).
    #[inline]
    pub fn remove<T: Hash>(&self, item: T) -> bool {
        self.remove_fingerprint(self.hash(item))
    }

    /// Returns whether `item` is present (probabilistically).
    #[inline]
    pub fn contains<T: Hash>(&self, item: T) -> bool {
        self.contains_fingerprint(self.hash(item))
    }

    /// Returns the payload stored with `item`, if any.
    #[inline]
    pub fn get<T: Hash>(&self, item: T) -> Option<u8> {
        self.get_fingerprint(self.hash(item))
    }

    /// Returns the payloads of all duplicates of `item` in the first
    /// candidate block holding any.
    #[inline]
    pub fn values<T: Hash>(&self, item: T) -> Vec<u8> {
        self.values_fingerprint(self.hash(item))
    }

    /// Current number of stored fingerprints.
    #[inline]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the filter holds no fingerprints.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of tag slots (the requested size rounded up to whole
    /// blocks).
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.nslots
    }

    /// Resets the filter to empty.
    pub fn clear(&mut self) {
        for block in self.blocks.iter_mut() {
            block.reset();
        }
        *self.len.get_mut() = 0;
    }

    /// Primary bucket, alternate bucket and tag for `hash`.
    ///
    /// The hash is reduced into the filter's range first; the range is a
    /// multiple of 256 so the reduction never disturbs the tag.
    #[inline]
    fn candidates(&self, hash: u64) -> (u64, u64, u8) {
        let hash = hash % self.range;
        let tag = (hash & TAG_MASK) as u8;
        let primary = hash >> TAG_BITS;
        let alternate = ((hash ^ u64::from(tag) * ALT_SCRAMBLE) % self.range) >> TAG_BITS;
        (primary, alternate, tag)
    }

    #[inline]
    fn block_of(&self, bucket: u64) -> &Block {
        &self.blocks[(bucket / BUCKETS_PER_BLOCK) as usize]
    }

    /// Locks two distinct blocks in index order.
    fn lock_pair(&self, a: u64, b: u64) {
        debug_assert_ne!(a, b);
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        self.blocks[first as usize].lock();
        self.blocks[second as usize].lock();
    }

    #[inline]
    fn mask_in(&self, bucket: u64, tag: u8) -> u32 {
        let block = self.block_of(bucket);
        block.match_mask(block.md(), (bucket % BUCKETS_PER_BLOCK) as u32, tag)
    }

    fn value_in(&self, bucket: u64, tag: u8) -> Option<u8> {
        let mask = self.mask_in(bucket, tag);
        if mask == 0 {
            return None;
        }
        let slot = mask.trailing_zeros() as usize;
        Some((self.block_of(bucket).tag(slot) >> TAG_BITS) as u8)
    }

    fn values_in(&self, bucket: u64, tag: u8) -> Vec<u8> {
        let mut mask = self.mask_in(bucket, tag);
        let block = self.block_of(bucket);
        let mut values = Vec::new();
        while mask != 0 {
            let slot = mask.trailing_zeros() as usize;
            values.push((block.tag(slot) >> TAG_BITS) as u8);
            mask &= mask - 1;
        }
        values
    }

    #[inline]
    fn prefetch(&self, block_index: u64) {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            let block: *const Block = &self.blocks[block_index as usize];
            _mm_prefetch(block.cast(), _MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = block_index;
    }

    #[inline]
    fn hash<T: Hash>(&self, item: T) -> u64 {
        let mut hasher = StableHasher::new();
        item.hash(&mut hasher);
        hasher.finish()
    }

    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn printout(&self) {
        eprintln!(
            "=== nblocks {} nslots {} len {} ===",
            self.blocks.len(),
            self.nslots,
            self.len()
        );
        for (i, block) in self.blocks.iter().enumerate() {
            eprint!("block {i} md {:064b} tags", block.md());
            for slot in 0..SLOTS_PER_BLOCK {
                eprint!(" {:04x}", block.tag(slot));
            }
            eprintln!();
        }
        eprintln!("===");
    }

    /// Checks the run-boundary invariants of every block. Quiescent callers
    /// only.
    #[doc(hidden)]
    #[cfg(any(fuzzing, test))]
    pub fn validate(&self) {
        let mut total = 0u64;
        for (i, block) in self.blocks.iter().enumerate() {
            let md = block.md();
            assert_eq!(md & block::LOCK_MASK, 0, "block {i}: lock bit leaked");
            let occupancy = block::occupancy(md);
            assert!(
                occupancy <= SLOTS_PER_BLOCK as u32,
                "block {i}: occupancy {occupancy}"
            );
            assert_eq!(block::free_slots(md), SLOTS_PER_BLOCK as u32 - occupancy);
            let mut covered = 0;
            for bucket in 0..BUCKETS_PER_BLOCK as u32 {
                let start = block::run_start(md, bucket);
                let end = block::run_end(md, bucket);
                assert!(
                    start == covered && start <= end && end <= occupancy,
                    "block {i} bucket {bucket}: run {start}..{end} of {occupancy}"
                );
                covered = end;
            }
            assert_eq!(covered, occupancy, "block {i}: runs do not cover all slots");
            total += u64::from(occupancy);
        }
        assert_eq!(total, self.len(), "occupancy does not match len");
    }
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("blocks", &"[..]")
            .field("nblocks", &self.blocks.len())
            .field("nslots", &self.nslots)
            .field("range", &self.range)
            .field("len", &self.len())
            .finish()
    }
}
