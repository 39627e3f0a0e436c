//! Identity types shared across the buffer pool, lock manager, log, and
//! access-method layers: `Fid`, `Pgno`, and `Lsn`.

use std::fmt;

/// A stable 20-byte identity for an open database file, distinct from its
/// file-system path. Generated once when a file is created and stored in
/// the meta page's `uid` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fid(pub [u8; 20]);

impl Fid {
    /// Generate a fresh, effectively-unique file id.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Fid(bytes)
    }

    pub fn zero() -> Self {
        Fid([0u8; 20])
    }
}

impl fmt::Display for Fid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A page number within a database file. Page 0 is always the meta page.
pub type Pgno = u32;

/// Log Sequence Number: (file-number, byte-offset).
/// `Ord`-derived so comparing two LSNs is simply `<`/`>`/`cmp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Lsn {
    pub file: u32,
    pub offset: u32,
}

impl Lsn {
    pub const ZERO: Lsn = Lsn { file: 0, offset: 0 };

    pub fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_orders_lexicographically() {
        assert!(Lsn::new(1, 100) < Lsn::new(2, 0));
        assert!(Lsn::new(1, 100) < Lsn::new(1, 101));
        assert_eq!(Lsn::ZERO, Lsn::new(0, 0));
    }
}
