// crates/memvault-vault/src/secure.rs
// Page-locked, zero-on-release holder for key material

use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Heap buffer for raw key bytes.
///
/// The allocation is made once and never grows, so the bytes are never
/// copied behind the caller's back. On Unix the pages are `mlock`ed (best
/// effort; see [`SecureBuffer::is_locked`]). `Drop` zeroes the bytes before
/// the allocation is released, which also covers unwinding.
///
/// Access goes through [`expose`](Self::expose). Cloning is explicit and
/// yields another `SecureBuffer`.
pub struct SecureBuffer {
    data: Vec<u8>,
    locked: bool,
}

impl SecureBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Copy `bytes` into a fresh locked allocation.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len());
        buf.data.copy_from_slice(bytes);
        buf
    }

    /// Take ownership of an already-zeroizing vector without copying it.
    pub fn from_zeroizing(mut bytes: Zeroizing<Vec<u8>>) -> Self {
        Self::from_vec(std::mem::take(&mut *bytes))
    }

    fn from_vec(data: Vec<u8>) -> Self {
        let locked = lock_region(data.as_ptr(), data.len());
        Self { data, locked }
    }

    pub fn expose(&self) -> &[u8] {
        &self.data
    }

    pub fn expose_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the pages are pinned against swapping.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Zero the bytes and release the page lock. Idempotent.
    pub fn wipe(&mut self) {
        let ptr = self.data.as_ptr();
        let len = self.data.len();
        self.data.zeroize();
        if self.locked {
            unlock_region(ptr, len);
            self.locked = false;
        }
    }
}

impl Clone for SecureBuffer {
    fn clone(&self) -> Self {
        Self::from_slice(&self.data)
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.wipe();
    }
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.data.len())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

impl PartialEq for SecureBuffer {
    /// Constant-time over equal lengths.
    fn eq(&self, other: &Self) -> bool {
        if self.data.len() != other.data.len() {
            return false;
        }
        self.data
            .iter()
            .zip(other.data.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for SecureBuffer {}

#[cfg(unix)]
fn lock_region(ptr: *const u8, len: usize) -> bool {
    if len == 0 {
        return false;
    }
    // SAFETY: ptr/len describe a live heap allocation owned by the caller.
    let rc = unsafe { libc::mlock(ptr.cast(), len) };
    if rc != 0 {
        tracing::debug!(
            len,
            error = %std::io::Error::last_os_error(),
            "mlock failed; key bytes may be swappable"
        );
    }
    rc == 0
}

#[cfg(unix)]
fn unlock_region(ptr: *const u8, len: usize) {
    // SAFETY: same region that was passed to mlock; still allocated because
    // zeroize keeps the capacity.
    let rc = unsafe { libc::munlock(ptr.cast(), len) };
    if rc != 0 {
        tracing::debug!(len, "munlock failed");
    }
}

#[cfg(not(unix))]
fn lock_region(_ptr: *const u8, len: usize) -> bool {
    tracing::debug!(len, "memory locking not supported on this platform");
    false
}

#[cfg(not(unix))]
fn unlock_region(_ptr: *const u8, _len: usize) {}
