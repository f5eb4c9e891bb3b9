//! Bump allocation over a caller supplied buffer.
//!
//! The reentrant `get*_r` calls hand us one buffer and expect every string
//! and pointer array of the returned record to live inside it. [`Arena`]
//! hands out slices from the front of that buffer and never gives anything
//! back; the whole region is reclaimed by the caller once the call returns.

use std::ffi::CStr;
use std::mem::{self, align_of, size_of, MaybeUninit};
use std::slice;

use thiserror::Error;

/// The caller's buffer cannot hold the record being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("decode buffer exhausted: {requested} bytes requested, {available} available")]
pub struct ArenaExhausted {
    pub requested: usize,
    pub available: usize,
}

pub struct Arena<'a> {
    free: &'a mut [MaybeUninit<u8>],
    used: usize,
}

impl<'a> Arena<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let len = buf.len();
        // SAFETY: u8 and MaybeUninit<u8> share layout, and the arena only
        // ever writes initialized bytes back into the region.
        let free = unsafe { slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<MaybeUninit<u8>>(), len) };
        Self::from_uninit(free)
    }

    pub fn from_uninit(free: &'a mut [MaybeUninit<u8>]) -> Self {
        Self { free, used: 0 }
    }

    /// Wraps a raw buffer handed over by the host.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `len` bytes for `'a` and must not
    /// be accessed through any other path while the arena or anything it
    /// returned is alive. A null `ptr` yields an empty arena.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        if ptr.is_null() {
            return Self::from_uninit(&mut []);
        }
        // SAFETY: guaranteed by the caller.
        let free = unsafe { slice::from_raw_parts_mut(ptr.cast::<MaybeUninit<u8>>(), len) };
        Self::from_uninit(free)
    }

    pub fn remaining(&self) -> usize {
        self.free.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    fn take(&mut self, pad: usize, size: usize) -> Result<&'a mut [MaybeUninit<u8>], ArenaExhausted> {
        let available = self.free.len();
        let needed = pad
            .checked_add(size)
            .filter(|n| *n <= available)
            .ok_or(ArenaExhausted {
                requested: pad.saturating_add(size),
                available,
            })?;

        let free = mem::take(&mut self.free);
        let (head, tail) = free.split_at_mut(needed);
        self.free = tail;
        self.used += needed;
        Ok(&mut head[pad..])
    }

    /// Reserves `size` raw bytes.
    pub fn alloc(&mut self, size: usize) -> Result<&'a mut [MaybeUninit<u8>], ArenaExhausted> {
        self.take(0, size)
    }

    /// Copies `bytes` plus a terminating NUL into the arena.
    ///
    /// An embedded NUL ends the returned string early; the codec rejects such
    /// fields before they get here.
    pub fn dup_bytes(&mut self, bytes: &[u8]) -> Result<&'a CStr, ArenaExhausted> {
        let len = bytes.len();
        let dst = self.take(0, len + 1)?;
        for (slot, b) in dst.iter_mut().zip(bytes.iter().chain(Some(&0u8))) {
            slot.write(*b);
        }
        // SAFETY: all len + 1 bytes were written just above.
        let written = unsafe { slice::from_raw_parts(dst.as_ptr().cast::<u8>(), len + 1) };
        Ok(CStr::from_bytes_until_nul(written).unwrap_or_default())
    }

    pub fn dup_str(&mut self, s: &str) -> Result<&'a CStr, ArenaExhausted> {
        self.dup_bytes(s.as_bytes())
    }

    /// Reserves an aligned array of `len` elements, each set to `fill`.
    pub fn alloc_array<T: Copy>(&mut self, len: usize, fill: T) -> Result<&'a mut [T], ArenaExhausted> {
        let size = len.checked_mul(size_of::<T>()).ok_or(ArenaExhausted {
            requested: usize::MAX,
            available: self.free.len(),
        })?;
        let pad = self.free.as_ptr().align_offset(align_of::<T>());
        let dst = self.take(pad, size)?;

        let ptr = dst.as_mut_ptr().cast::<T>();
        for i in 0..len {
            // SAFETY: `dst` holds `len` properly aligned slots of T.
            unsafe { ptr.add(i).write(fill) };
        }
        // SAFETY: every slot was initialized above and `dst` is exclusively ours.
        Ok(unsafe { slice::from_raw_parts_mut(ptr, len) })
    }
}
