//! SharedBuffer - the single staging region both parties take turns on
//!
//! Pure storage. Who may touch it at any moment is decided by the relay
//! phase, not by the buffer; the internal mutex only keeps Rust's aliasing
//! rules satisfied and is never held across a round-trip.

use std::sync::{Mutex, MutexGuard, PoisonError};

use nix::unistd::{sysconf, SysconfVar};

/// Sector size of the advertised block device
pub const SECTOR_SIZE: usize = 512;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Size of one system memory page
pub fn page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as usize,
        _ => FALLBACK_PAGE_SIZE,
    }
}

/// Fixed-capacity byte region
pub struct SharedBuffer {
    region: Mutex<Box<[u8]>>,
    capacity: usize,
}

impl SharedBuffer {
    /// Allocate a zeroed region of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            region: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
        }
    }

    /// One page, the size the device normally runs with
    pub fn with_page_capacity() -> Self {
        Self::new(page_size())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` over the whole region
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let region = self.lock();
        f(&region)
    }

    /// Run `f` over the whole region, mutably
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut region = self.lock();
        f(&mut region)
    }

    /// Copy `src` to the start of the region
    ///
    /// # Panics
    /// If `src` is longer than the capacity. Callers chunk first.
    pub fn stage(&self, src: &[u8]) {
        assert!(src.len() <= self.capacity, "chunk larger than shared buffer");
        self.with_mut(|region| region[..src.len()].copy_from_slice(src));
    }

    /// Copy the start of the region into `dst`
    ///
    /// # Panics
    /// If `dst` is longer than the capacity. Callers chunk first.
    pub fn unstage(&self, dst: &mut [u8]) {
        assert!(dst.len() <= self.capacity, "chunk larger than shared buffer");
        self.with(|region| dst.copy_from_slice(&region[..dst.len()]));
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_sector_multiple() {
        let size = page_size();
        assert!(size >= SECTOR_SIZE);
        assert_eq!(size % SECTOR_SIZE, 0);
    }

    #[test]
    fn test_stage_and_unstage() {
        let buffer = SharedBuffer::new(1024);
        buffer.stage(&[7u8; 100]);

        let mut out = [0u8; 100];
        buffer.unstage(&mut out);
        assert_eq!(out, [7u8; 100]);

        // Bytes past the staged prefix are untouched.
        buffer.with(|region| assert_eq!(region[100], 0));
    }

    #[test]
    #[should_panic(expected = "chunk larger than shared buffer")]
    fn test_stage_oversized_panics() {
        SharedBuffer::new(16).stage(&[0u8; 17]);
    }
}
