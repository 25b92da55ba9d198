use std::fmt;
use std::sync::Arc;

/// Smallest capacity handed out by [`make_buffer`].
pub const MIN_BUFFER_CAPACITY: usize = 512;
/// Largest capacity handed out by [`make_buffer`]; also the upper
/// bound for connection send/receive buffers.
pub const MAX_BUFFER_CAPACITY: usize = 64 * 1024;

/// Rounds a requested size up to the capacity class it would be served
/// from: 512B, 1K, 2K, 4K, 8K, 16K, 32K or 64K.
pub fn buffer_capacity_for(size: usize) -> usize {
    debug_assert!(size <= MAX_BUFFER_CAPACITY);
    let mut cap = MIN_BUFFER_CAPACITY;
    while cap < size {
        cap <<= 1;
    }
    cap.min(MAX_BUFFER_CAPACITY)
}

/// Allocates a buffer of the capacity class covering `size`.
pub fn make_buffer(size: usize) -> SharedBuffer {
    SharedBuffer {
        data: Arc::from(vec![0u8; buffer_capacity_for(size)].into_boxed_slice()),
    }
}

/// Reference counted byte block.
///
/// A buffer is writable only while it has a single owner; once cloned
/// (a relay holding slices of a receive buffer) it is frozen until the
/// other handles drop. The owning connection checks [`is_shared`]
/// before reusing a buffer and keeps shared ones parked in its return
/// vector instead.
///
/// [`is_shared`]: SharedBuffer::is_shared
#[derive(Clone)]
pub struct SharedBuffer {
    data: Arc<[u8]>,
}

impl SharedBuffer {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access, available only while unshared.
    #[inline]
    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.data)
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    /// Stable identity of the allocation, used to group relay slices
    /// cut from the same receive buffer.
    #[inline]
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.data) as *const u8 as usize
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "SharedBuffer(cap = {}, shared = {})",
            self.capacity(),
            self.is_shared()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn capacity_classes() {
        assert_eq!(buffer_capacity_for(0), 512);
        assert_eq!(buffer_capacity_for(512), 512);
        assert_eq!(buffer_capacity_for(513), 1024);
        assert_eq!(buffer_capacity_for(4096), 4096);
        assert_eq!(buffer_capacity_for(40_000), 64 * 1024);
        assert_eq!(buffer_capacity_for(MAX_BUFFER_CAPACITY), MAX_BUFFER_CAPACITY);
    }

    #[test]
    fn shared_freezes_writes() {
        let mut buf = make_buffer(1024);
        assert!(!buf.is_shared());
        buf.bytes_mut().unwrap()[0] = 7;

        let other = buf.clone();
        assert!(buf.is_shared());
        assert!(buf.bytes_mut().is_none());
        assert_eq!(other.bytes()[0], 7);
        assert_eq!(other.id(), buf.id());

        drop(other);
        assert!(!buf.is_shared());
        assert!(buf.bytes_mut().is_some());
    }
}
