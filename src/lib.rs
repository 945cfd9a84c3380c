#![warn(missing_docs)]
#![cfg_attr(not(feature = "std"), no_std)]

//! An open-addressing hash table with Robin Hood linear probing.
//!
//! The core type is [`HashTable<V>`], a low-level container that stores
//! fixed-size entries and requires the caller to supply a 32-bit hash and
//! an equality predicate for each operation. [`HashMap<K, V, S>`] and
//! [`HashSet<T, S>`] wrap it with the usual keyed interfaces over a
//! configurable [`BuildHasher`](core::hash::BuildHasher).
//!
//! Robin Hood probing keeps the variance of probe distances low by letting
//! an inserted entry displace any occupant that sits closer to its ideal
//! bucket. On top of that, this table enforces a hard probe-sequence-length
//! budget *preemptively*: as soon as any entry reaches the configured PSL
//! limit, further insertions of new keys are refused with
//! [`Error::BadHash`] until an offending entry is removed. Because a single
//! insertion can raise the table's peak PSL by at most one, the budget can
//! never be exceeded retroactively and the packed 7-bit PSL field cannot
//! overflow.
//!
//! Bucket metadata is a single `u32` per slot (24-bit truncated hash,
//! 7-bit PSL, 1-bit empty flag), stored in one allocation together with
//! the entry array. Growth doubles the bucket count and re-places every
//! entry from its stored truncated hash; the caller's hash function is
//! never re-invoked.

extern crate alloc;

mod bucket;

pub mod error;
pub mod fatal;
pub mod hash_map;
pub mod hash_set;
pub mod hash_table;

pub use error::Error;
pub use fatal::set_fatal_hook;
pub use hash_map::HashMap;
pub use hash_set::HashSet;
pub use hash_table::Builder;
pub use hash_table::HashTable;
pub use hash_table::TableStats;
