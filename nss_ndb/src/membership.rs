//! Collecting the groups a user belongs to.
//!
//! The host hands over a gid array in one of several shapes. A [`GroupSink`]
//! hides the shape from the lookup: it is offered one gid at a time and
//! applies the add-if-absent rule itself.

use std::mem::MaybeUninit;
use std::slice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Added {
    Inserted,
    /// Already in the list; nothing changed.
    Duplicate,
    /// No room left. The gid was counted but not stored.
    Overflow,
}

pub trait GroupSink {
    fn add(&mut self, gid: u32) -> Added;
}

/// Outcome of one membership scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipReport {
    /// The user had an entry in the membership index.
    pub found: bool,
    pub inserted: usize,
    pub duplicates: usize,
    pub overflowed: usize,
}

impl MembershipReport {
    pub fn record(&mut self, added: Added) {
        match added {
            Added::Inserted => self.inserted += 1,
            Added::Duplicate => self.duplicates += 1,
            Added::Overflow => self.overflowed += 1,
        }
    }

    /// Distinct gids offered, whether or not they fit.
    pub fn attempted(&self) -> usize {
        self.inserted + self.overflowed
    }
}

/// A fixed caller array: `groups[..len]` are filled, the rest is scratch.
/// Gids that do not fit are only counted, the way `getgrouplist(3)` reports
/// how large the array would have had to be.
pub struct BoundedGroups<'g> {
    slots: &'g mut [MaybeUninit<u32>],
    len: usize,
    overflow: usize,
}

impl<'g> BoundedGroups<'g> {
    pub fn new(slots: &'g mut [u32]) -> Self {
        let len = slots.len();
        // SAFETY: u32 and MaybeUninit<u32> share layout, and only
        // initialized values are ever written back.
        let slots = unsafe { slice::from_raw_parts_mut(slots.as_mut_ptr().cast::<MaybeUninit<u32>>(), len) };
        Self::from_uninit(slots, 0)
    }

    /// Continues filling an array whose first `len` slots are already
    /// initialized.
    ///
    /// # Safety
    ///
    /// `slots[..len]` must be initialized.
    pub unsafe fn from_uninit_with(slots: &'g mut [MaybeUninit<u32>], len: usize) -> Self {
        let len = len.min(slots.len());
        Self::from_uninit(slots, len)
    }

    fn from_uninit(slots: &'g mut [MaybeUninit<u32>], len: usize) -> Self {
        BoundedGroups {
            slots,
            len,
            overflow: 0,
        }
    }

    pub fn as_slice(&self) -> &[u32] {
        // SAFETY: the first `len` slots are initialized.
        unsafe { slice::from_raw_parts(self.slots.as_ptr().cast::<u32>(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stored entries plus the ones that did not fit.
    pub fn count(&self) -> usize {
        self.len + self.overflow
    }
}

impl GroupSink for BoundedGroups<'_> {
    fn add(&mut self, gid: u32) -> Added {
        if self.as_slice().contains(&gid) {
            return Added::Duplicate;
        }
        match self.slots.get_mut(self.len) {
            Some(slot) => {
                slot.write(gid);
                self.len += 1;
                Added::Inserted
            }
            None => {
                self.overflow += 1;
                Added::Overflow
            }
        }
    }
}

impl GroupSink for Vec<u32> {
    fn add(&mut self, gid: u32) -> Added {
        if self.contains(&gid) {
            Added::Duplicate
        } else {
            self.push(gid);
            Added::Inserted
        }
    }
}
