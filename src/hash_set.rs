//! A set over the Robin Hood [`HashTable`].
//!
//! [`HashSet<T, S>`] stores values directly in a
//! [`HashTable`](crate::hash_table::HashTable); the whole value is the
//! key. Hashes come from a caller-supplied [`BuildHasher`], truncated to
//! 32 bits.

use core::borrow::Borrow;
use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;

use crate::error::Error;
use crate::hash_table;
use crate::hash_table::HashTable;

/// A hash set backed by the Robin Hood [`HashTable`].
///
/// # Examples
///
/// ```
/// # use core::hash::BuildHasher;
/// # use siphasher::sip::SipHasher;
/// #
/// # use rh_hash::HashSet;
/// #
/// # struct SimpleHasher;
/// # impl BuildHasher for SimpleHasher {
/// #     type Hasher = SipHasher;
/// #
/// #     fn build_hasher(&self) -> Self::Hasher {
/// #         SipHasher::new()
/// #     }
/// # }
/// #
/// let mut set = HashSet::with_hasher(SimpleHasher).unwrap();
/// assert!(set.add(3).unwrap());
/// assert!(!set.add(3).unwrap());
/// assert!(set.contains(&3));
/// ```
pub struct HashSet<T, S> {
    table: HashTable<T>,
    hash_builder: S,
}

impl<T, S> Debug for HashSet<T, S>
where
    T: Debug + Hash + Eq,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.table.iter() {
            Ok(values) => f.debug_set().entries(values).finish(),
            Err(_) => f.write_str("HashSet { <locked> }"),
        }
    }
}

impl<T, S> HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty set with the given hasher builder and the default
    /// capacity.
    ///
    /// # Errors
    ///
    /// [`Error::EntrySize`] if `T` exceeds 16384 bytes, or
    /// [`Error::Alloc`].
    pub fn with_hasher(hash_builder: S) -> Result<Self, Error> {
        Self::with_capacity_and_hasher(0, hash_builder)
    }

    /// Creates an empty set sized for `capacity` values.
    ///
    /// # Errors
    ///
    /// As for [`with_hasher`](Self::with_hasher), plus [`Error::TooBig`].
    pub fn with_capacity_and_hasher(capacity: u32, hash_builder: S) -> Result<Self, Error> {
        Ok(Self {
            table: HashTable::with_capacity(capacity)?,
            hash_builder,
        })
    }

    /// Returns the number of values in the set.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the set contains no values.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[inline]
    fn hash_of<Q>(&self, value: &Q) -> u32
    where
        Q: Hash + ?Sized,
    {
        self.hash_builder.hash_one(value) as u32
    }

    /// Adds a value to the set.
    ///
    /// Returns `Ok(true)` when the value was not present, and `Ok(false)`
    /// leaving the set unchanged when it was.
    ///
    /// # Errors
    ///
    /// [`Error::BadHash`] while any entry sits at the PSL limit,
    /// [`Error::TooBig`] or [`Error::Alloc`] from growth.
    pub fn add(&mut self, value: T) -> Result<bool, Error> {
        let hash = self.hash_of(&value);
        if self.table.find(hash, |v| *v == value).is_some() {
            return Ok(false);
        }
        // Presence was just ruled out.
        self.table.add(hash, |_| false, value)?;
        Ok(true)
    }

    /// Returns `true` if the set contains `value`.
    pub fn contains<Q>(&self, value: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(value).is_some()
    }

    /// Returns a reference to the stored value equal to `value`.
    pub fn get<Q>(&self, value: &Q) -> Option<&T>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(value);
        self.table.find(hash, |v| v.borrow() == value)
    }

    /// Removes `value` from the set, returning the stored value.
    pub fn remove<Q>(&mut self, value: &Q) -> Option<T>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hash_of(value);
        self.table.remove(hash, |v| v.borrow() == value)
    }

    /// Returns a shared iterator over the set's values.
    ///
    /// # Errors
    ///
    /// As for [`HashTable::iter`].
    pub fn iter(&self) -> Result<Iter<'_, T>, Error> {
        Ok(Iter {
            inner: self.table.iter()?,
        })
    }
}

/// A shared iterator over a [`HashSet`], created by [`HashSet::iter`].
pub struct Iter<'a, T> {
    inner: hash_table::Iter<'a, T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use core::hash::BuildHasher;

    use siphasher::sip::SipHasher;

    use super::*;

    struct FixedSip;

    impl BuildHasher for FixedSip {
        type Hasher = SipHasher;

        fn build_hasher(&self) -> SipHasher {
            SipHasher::new_with_keys(0xabcd, 0x1234)
        }
    }

    #[test]
    fn add_contains_remove() {
        let mut set: HashSet<u64, _> = HashSet::with_hasher(FixedSip).unwrap();
        assert!(set.add(1).unwrap());
        assert!(set.add(2).unwrap());
        assert!(!set.add(1).unwrap());
        assert_eq!(set.len(), 2);

        assert!(set.contains(&1));
        assert!(!set.contains(&3));

        assert_eq!(set.remove(&1), Some(1));
        assert_eq!(set.remove(&1), None);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn borrowed_lookups() {
        let mut set: HashSet<alloc::string::String, _> = HashSet::with_hasher(FixedSip).unwrap();
        set.add(alloc::string::String::from("alpha")).unwrap();
        assert!(set.contains("alpha"));
        assert_eq!(set.get("alpha").map(|s| s.as_str()), Some("alpha"));
        assert_eq!(set.remove("alpha").as_deref(), Some("alpha"));
    }

    #[test]
    fn iter_visits_everything() {
        let mut set: HashSet<u64, _> = HashSet::with_hasher(FixedSip).unwrap();
        for v in 0..20 {
            set.add(v).unwrap();
        }
        let mut seen: std::vec::Vec<u64> = set.iter().unwrap().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<std::vec::Vec<u64>>());
    }
}
