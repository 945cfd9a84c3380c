//! Error kinds surfaced by table and iterator operations.

/// A recoverable failure.
///
/// Every fallible operation leaves the table unchanged when it returns one
/// of these. Contract violations (for example mutating a table whose
/// iterator lock was leaked) are not errors; they go through the
/// [`fatal`](crate::fatal) hook instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// Memory allocation failed.
    Alloc,
    /// Entry size too large (> 16 KiB).
    EntrySize,
    /// Requested table size too large.
    TooBig,
    /// Too many hash collisions: an entry sits at the PSL limit.
    BadHash,
    /// Can't acquire the iterator lock.
    IterLock,
    /// Table has too many iterators.
    IterCount,
    /// Iterator at beginning or end.
    IterNoLast,
}

impl Error {
    /// A static description of the error.
    pub fn message(self) -> &'static str {
        match self {
            Error::Alloc => "memory allocation failed",
            Error::EntrySize => "entry size too large (> 16 KiB)",
            Error::TooBig => "requested table size too large",
            Error::BadHash => "too many hash collisions",
            Error::IterLock => "can't acquire iterator lock",
            Error::IterCount => "table has too many iterators",
            Error::IterNoLast => "iterator at beginning or end",
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.message())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_message() {
        let kinds = [
            Error::Alloc,
            Error::EntrySize,
            Error::TooBig,
            Error::BadHash,
            Error::IterLock,
            Error::IterCount,
            Error::IterNoLast,
        ];
        for kind in kinds {
            assert!(!kind.message().is_empty());
            assert_eq!(alloc::format!("{kind}"), kind.message());
        }
    }
}
