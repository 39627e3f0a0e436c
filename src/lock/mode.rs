//! Lock modes and the mode-compatibility matrices: the full 9-mode
//! matrix used by the general access-methods case, plus the 5-mode CDS
//! subset.

use serde::{Deserialize, Serialize};

/// One of the 9 lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// No grant: a placeholder used for uninitialized lock slots.
    Ng,
    Read,
    Write,
    /// A request that has not yet been granted; not a held mode, used
    /// only to mark waiter entries.
    Wait,
    /// Intent to write: acquired on ancestors when descending to write a
    /// descendant (B-tree internal pages during a leaf write, etc.).
    IWrite,
    /// Intent to read.
    IRead,
    /// Read-intent-write: held while deciding whether an operation will
    /// turn into a write (e.g. a cursor opened for update).
    Riw,
    /// Dirty read: permits reading pages a writer currently holds WRITE
    /// on (isolation level READ_UNCOMMITTED).
    DirtyRead,
    /// A lock that was WRITE before being downgraded for an aborted
    /// update; retained so later compatibility checks still see intent.
    WasWrite,
}

impl LockMode {
    /// Write locks are those in {WRITE, WAS_WRITE, IWRITE, RIW}.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            LockMode::Write | LockMode::WasWrite | LockMode::IWrite | LockMode::Riw
        )
    }

    /// Whether this mode is a strictly less restrictive version of
    /// `other`, i.e. a legal `downgrade` target. Ordered Read < IRead <
    /// Riw < IWrite < Write, matching the usual read-vs-write and
    /// intent-vs-full split.
    pub fn strictly_less_restrictive_than(&self, other: &LockMode) -> bool {
        self.rank() < other.rank()
    }

    fn rank(&self) -> u8 {
        match self {
            LockMode::Ng => 0,
            LockMode::DirtyRead => 1,
            LockMode::Read => 2,
            LockMode::IRead => 3,
            LockMode::Riw => 4,
            LockMode::IWrite => 5,
            LockMode::WasWrite => 6,
            LockMode::Write => 7,
            LockMode::Wait => u8::MAX,
        }
    }
}

/// A boolean compatibility table: `conflicts(held, wanted)` is `true`
/// when a new `wanted` request conflicts with an existing `held` grant.
pub struct CompatMatrix {
    modes: Vec<LockMode>,
    table: Vec<Vec<bool>>,
}

impl CompatMatrix {
    fn build(modes: Vec<LockMode>, conflicts: impl Fn(LockMode, LockMode) -> bool) -> Self {
        let table = modes
            .iter()
            .map(|&held| modes.iter().map(|&wanted| conflicts(held, wanted)).collect())
            .collect();
        Self { modes, table }
    }

    fn index_of(&self, mode: LockMode) -> Option<usize> {
        self.modes.iter().position(|m| *m == mode)
    }

    /// `true` if `wanted` conflicts with an existing grant of `held`.
    pub fn conflicts(&self, held: LockMode, wanted: LockMode) -> bool {
        match (self.index_of(held), self.index_of(wanted)) {
            (Some(h), Some(w)) => self.table[h][w],
            // A mode outside this matrix (e.g. a 9-mode-only mode probed
            // against the 5-mode CDS matrix) is conservatively treated as
            // conflicting.
            _ => true,
        }
    }

    /// The full 9-mode matrix used for the general access-methods case.
    pub fn full() -> Self {
        use LockMode::*;
        Self::build(
            vec![Ng, Read, Write, IWrite, IRead, Riw, DirtyRead, WasWrite],
            |held, wanted| {
                if held == Ng || wanted == Ng {
                    return false;
                }
                match (held, wanted) {
                    // DIRTY_READ never conflicts with anything; a WRITE
                    // attempting to exclude even dirty readers is not
                    // modeled here. Dirty-read is a read-side relaxation
                    // only.
                    (_, DirtyRead) => false,
                    (DirtyRead, _) => false,
                    (Read, Read) => false,
                    (Read, IRead) => false,
                    (IRead, Read) => false,
                    (IRead, IRead) => false,
                    (IRead, IWrite) => false,
                    (IWrite, IRead) => false,
                    (IWrite, IWrite) => false,
                    (Read, Riw) => true,
                    (Riw, Read) => true,
                    (IRead, Riw) => false,
                    (Riw, IRead) => false,
                    (Riw, Riw) => true,
                    // Anything paired with WRITE/WAS_WRITE/IWRITE-vs-write
                    // combinations not already excluded above conflicts.
                    _ => true,
                }
            },
        )
    }

    /// The 5-mode matrix used for CDS mode: NG, READ, WRITE, WAIT,
    /// IWRITE.
    pub fn cds() -> Self {
        use LockMode::*;
        Self::build(vec![Ng, Read, Write, IWrite], |held, wanted| {
            if held == Ng || wanted == Ng {
                return false;
            }
            match (held, wanted) {
                (Read, Read) => false,
                (Read, IWrite) => false,
                (IWrite, Read) => false,
                (IWrite, IWrite) => false,
                _ => true,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LockMode::*;

    #[test]
    fn read_read_compatible_write_exclusive() {
        let m = CompatMatrix::full();
        assert!(!m.conflicts(Read, Read));
        assert!(m.conflicts(Write, Read));
        assert!(m.conflicts(Read, Write));
        assert!(m.conflicts(Write, Write));
    }

    #[test]
    fn intent_modes_compatible_with_each_other() {
        let m = CompatMatrix::full();
        assert!(!m.conflicts(IRead, IRead));
        assert!(!m.conflicts(IRead, IWrite));
        assert!(!m.conflicts(IWrite, IRead));
    }

    #[test]
    fn cds_matrix_has_no_intent_read_conflict() {
        let m = CompatMatrix::cds();
        assert!(!m.conflicts(Read, IWrite));
        assert!(m.conflicts(IWrite, IWrite));
    }

    #[test]
    fn write_is_classified_correctly() {
        assert!(Write.is_write());
        assert!(WasWrite.is_write());
        assert!(IWrite.is_write());
        assert!(Riw.is_write());
        assert!(!Read.is_write());
        assert!(!IRead.is_write());
    }
}
