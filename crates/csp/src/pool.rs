//! Fixed-capacity packet buffer pool

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::CspError;

/// Capacity of one pooled buffer, sized for the largest frame body.
pub const BUFFER_SIZE: usize = 251;

struct PoolShared {
    free: Mutex<Vec<Box<[u8; BUFFER_SIZE]>>>,
    capacity: usize,
    in_use: AtomicUsize,
    exhausted: AtomicU64,
}

impl PoolShared {
    fn release(&self, storage: Box<[u8; BUFFER_SIZE]>) {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.push(storage);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Thread-safe pool of reusable packet buffers. Cloning is cheap and
/// every clone draws from the same freelist.
#[derive(Clone)]
pub struct PacketPool {
    shared: Arc<PoolShared>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::new([0u8; BUFFER_SIZE]));
        }
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                capacity,
                in_use: AtomicUsize::new(0),
                exhausted: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a buffer, or `None` when the pool is dry.
    pub fn try_get(&self) -> Option<PooledBuf> {
        let storage = {
            let mut free = self.shared.free.lock().unwrap_or_else(|e| e.into_inner());
            free.pop()
        };
        match storage {
            Some(storage) => {
                self.shared.in_use.fetch_add(1, Ordering::Relaxed);
                Some(PooledBuf {
                    storage: Some(storage),
                    len: 0,
                    shared: self.shared.clone(),
                })
            }
            None => {
                self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn get(&self) -> Result<PooledBuf, CspError> {
        self.try_get().ok_or(CspError::PoolExhausted)
    }

    /// (capacity, in_use, exhausted_count)
    pub fn stats(&self) -> (usize, usize, u64) {
        (
            self.shared.capacity,
            self.shared.in_use.load(Ordering::Relaxed),
            self.shared.exhausted.load(Ordering::Relaxed),
        )
    }
}

/// One leased buffer. Dropping it on any path hands the storage back to
/// the pool, so release is tied to ownership rather than call discipline.
pub struct PooledBuf {
    storage: Option<Box<[u8; BUFFER_SIZE]>>,
    len: usize,
    shared: Arc<PoolShared>,
}

impl PooledBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push(&mut self, byte: u8) -> Result<(), CspError> {
        if self.len >= BUFFER_SIZE {
            return Err(CspError::PayloadTooLarge);
        }
        if let Some(storage) = self.storage.as_mut() {
            storage[self.len] = byte;
            self.len += 1;
        }
        Ok(())
    }

    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> Result<(), CspError> {
        if self.len + bytes.len() > BUFFER_SIZE {
            return Err(CspError::PayloadTooLarge);
        }
        if let Some(storage) = self.storage.as_mut() {
            storage[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();
        }
        Ok(())
    }

    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Drop the first `n` bytes and shift the remainder to the front.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == 0 {
            return;
        }
        if let Some(storage) = self.storage.as_mut() {
            storage.copy_within(n..self.len, 0);
        }
        self.len -= n;
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            Some(storage) => &storage[..self.len],
            None => &[],
        }
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for PooledBuf {
    fn eq(&self, other: &Self) -> bool {
        self[..] == other[..]
    }
}

impl Eq for PooledBuf {}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBuf({} bytes)", self.len)
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.shared.release(storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_and_release() {
        let pool = PacketPool::new(2);
        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.try_get().is_none());
        assert_eq!(pool.stats(), (2, 2, 1));

        drop(a);
        assert_eq!(pool.stats().1, 1);
        let c = pool.try_get();
        assert!(c.is_some());
        drop(b);
        drop(c);
        assert_eq!(pool.stats().1, 0);
    }

    #[test]
    fn test_write_bounds() {
        let pool = PacketPool::new(1);
        let mut buf = pool.get().unwrap();
        buf.extend_from_slice(&[0xAA; BUFFER_SIZE]).unwrap();
        assert!(matches!(buf.push(0x01), Err(CspError::PayloadTooLarge)));
        assert!(matches!(
            buf.extend_from_slice(&[0x01]),
            Err(CspError::PayloadTooLarge)
        ));
        assert_eq!(buf.len(), BUFFER_SIZE);
    }

    #[test]
    fn test_trim_front() {
        let pool = PacketPool::new(1);
        let mut buf = pool.get().unwrap();
        buf.extend_from_slice(&[1, 2, 3, 4, 5]).unwrap();
        buf.trim_front(2);
        assert_eq!(&buf[..], &[3, 4, 5]);
        buf.trim_front(10);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_exhaustion_counted() {
        let pool = PacketPool::new(1);
        let held = pool.get().unwrap();
        for _ in 0..3 {
            assert!(pool.try_get().is_none());
        }
        assert_eq!(pool.stats().2, 3);
        drop(held);
    }
}
