//! Version-dependency evaluation and anti-rollback bookkeeping.

use crate::{
    error::Error,
    format::{Comparator, Connective, Subject, VersionStatement},
    platform::Board,
};

/// Left-to-right fold of VersionDependency statements, one accumulator per
/// subject. A subject no statement mentions stays satisfied.
pub(crate) struct VersionFold {
    application: bool,
    bootloader: bool,
    secure_element: bool,
}

impl VersionFold {
    pub const fn new() -> Self {
        VersionFold {
            application: true,
            bootloader: true,
            secure_element: true,
        }
    }

    pub fn apply<B: Board>(&mut self, board: &B, stmt: &VersionStatement) -> Result<(), Error> {
        let (accumulator, running) = match stmt.subject {
            Subject::Application => (&mut self.application, board.application_version()),
            Subject::Bootloader => (&mut self.bootloader, Some(board.bootloader_version())),
            Subject::SecureElement => {
                // A statement about a secure element the device does not
                // have cannot be evaluated at all.
                let version = board.secure_element_version().ok_or(Error::UnexpectedTag)?;
                (&mut self.secure_element, Some(version))
            }
        };

        let result = match running {
            // No readable application: the statement fails outright, negate
            // bits notwithstanding.
            None => false,
            Some(version) => {
                let compared = match stmt.comparator {
                    Comparator::Lt => version < stmt.version,
                    Comparator::Leq => version <= stmt.version,
                    Comparator::Eq => version == stmt.version,
                    Comparator::Geq => version >= stmt.version,
                    Comparator::Gt => version > stmt.version,
                };
                compared ^ stmt.comparator_negate
            }
        };

        let combined = match stmt.connective {
            Connective::And => *accumulator && result,
            Connective::Or => *accumulator || result,
        };
        *accumulator = combined ^ stmt.connective_negate;
        Ok(())
    }

    pub fn satisfied(&self) -> bool {
        self.application && self.bootloader && self.secure_element
    }
}

/// Fixed-slot record of every application version a board has accepted.
/// Slots are append-only; an erased slot reads as `EMPTY`. Boards keep one
/// of these in non-volatile storage and serve the [`Board`] anti-rollback
/// hooks from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackSlots<const N: usize> {
    slots: [u32; N],
}

impl<const N: usize> RollbackSlots<N> {
    pub const EMPTY: u32 = 0xFFFF_FFFF;

    pub const fn new() -> Self {
        RollbackSlots {
            slots: [Self::EMPTY; N],
        }
    }

    pub fn from_raw(slots: [u32; N]) -> Self {
        RollbackSlots { slots }
    }

    pub fn highest(&self) -> Option<u32> {
        self.slots
            .iter()
            .copied()
            .filter(|v| *v != Self::EMPTY)
            .max()
    }

    pub fn contains(&self, version: u32) -> bool {
        self.slots.contains(&version)
    }

    /// Whether [`remember`](Self::remember) would succeed for `version`.
    pub fn can_remember(&self, version: u32) -> bool {
        version != Self::EMPTY
            && (self.contains(version) || self.slots.contains(&Self::EMPTY))
    }

    /// Records `version` in the first free slot. Returns false when every
    /// slot is taken by a different version.
    pub fn remember(&mut self, version: u32) -> bool {
        if version == Self::EMPTY {
            return false;
        }
        if self.contains(version) {
            return true;
        }
        match self.slots.iter_mut().find(|slot| **slot == Self::EMPTY) {
            Some(slot) => {
                *slot = version;
                true
            }
            None => false,
        }
    }
}

impl<const N: usize> Default for RollbackSlots<N> {
    fn default() -> Self {
        Self::new()
    }
}
