use crate::device_handle::DeviceId;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer from device {device} was not delivered by this connection manager")]
    ForeignBuffer { device: DeviceId },
}

/// Bookkeeping for every read buffer handed to a consumer.
///
/// One ledger exists per `ConnectionManager`. Each delivered buffer holds a
/// lease on it and gives the lease back exactly once, either through
/// `ConnectionManager::release_buffer`, `ReadBuffer::into_vec` or when it is
/// dropped.
#[derive(Debug, Default)]
pub struct BufferLedger {
    delivered: AtomicU64,
    released: AtomicU64,
    delivered_bytes: AtomicU64,
}

impl BufferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers delivered to consumers and not yet released
    pub fn outstanding(&self) -> u64 {
        // released is only bumped after delivered, so it never overtakes
        let released = self.released.load(Ordering::Acquire);
        self.delivered.load(Ordering::Acquire).saturating_sub(released)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn delivered_bytes(&self) -> u64 {
        self.delivered_bytes.load(Ordering::Relaxed)
    }

    fn lease(self: &Arc<Self>, len: usize) -> BufferLease {
        self.delivered.fetch_add(1, Ordering::AcqRel);
        self.delivered_bytes.fetch_add(len as u64, Ordering::Relaxed);
        BufferLease {
            ledger: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
struct BufferLease {
    ledger: Arc<BufferLedger>,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// A chunk of captured samples owned by the consumer.
///
/// Produced by a read stream and moved into the read-data callback. The
/// subsystem keeps no reference to the bytes once the callback has been
/// invoked; the single release happens when the buffer is given back or
/// dropped, and a released buffer can not be touched again.
#[derive(Debug)]
pub struct ReadBuffer {
    device: DeviceId,
    sequence: u64,
    data: Vec<u8>,
    lease: BufferLease,
}

impl ReadBuffer {
    pub(crate) fn deliver(
        ledger: &Arc<BufferLedger>,
        device: DeviceId,
        sequence: u64,
        data: Vec<u8>,
    ) -> Self {
        let lease = ledger.lease(data.len());
        Self {
            device,
            sequence,
            data,
            lease,
        }
    }

    /// Device that produced this chunk
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    /// Position of this chunk within its read stream, starting at 0
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Take the sample bytes out of the buffer, releasing it
    pub fn into_vec(self) -> Vec<u8> {
        let Self { data, lease, .. } = self;
        drop(lease);
        data
    }

    pub(crate) fn belongs_to(&self, ledger: &Arc<BufferLedger>) -> bool {
        Arc::ptr_eq(&self.lease.ledger, ledger)
    }
}

impl Deref for ReadBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl AsRef<[u8]> for ReadBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Allocate a zeroed chunk without aborting the process when memory runs out
pub(crate) fn try_alloc_chunk(len: usize) -> Option<Vec<u8>> {
    let mut chunk = Vec::new();
    chunk.try_reserve_exact(len).ok()?;
    chunk.resize(len, 0);
    Some(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_releases_lease() {
        let ledger = Arc::new(BufferLedger::new());
        let buffer = ReadBuffer::deliver(&ledger, DeviceId::new(1), 0, vec![1, 2, 3]);
        assert_eq!(ledger.outstanding(), 1);
        assert_eq!(ledger.delivered_bytes(), 3);
        assert_eq!(&*buffer, &[1, 2, 3]);

        drop(buffer);
        assert_eq!(ledger.outstanding(), 0);
        assert_eq!(ledger.released(), 1);
    }

    #[test]
    fn test_into_vec_keeps_data_and_releases() {
        let ledger = Arc::new(BufferLedger::new());
        let buffer = ReadBuffer::deliver(&ledger, DeviceId::new(7), 4, vec![9; 16]);
        assert_eq!(buffer.sequence(), 4);
        assert_eq!(buffer.device_id(), DeviceId::new(7));

        let data = buffer.into_vec();
        assert_eq!(data.len(), 16);
        assert_eq!(ledger.released(), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_foreign_ledger_detected() {
        let ours = Arc::new(BufferLedger::new());
        let theirs = Arc::new(BufferLedger::new());
        let buffer = ReadBuffer::deliver(&theirs, DeviceId::new(2), 0, vec![0]);
        assert!(!buffer.belongs_to(&ours));
        assert!(buffer.belongs_to(&theirs));
    }

    #[test]
    fn test_try_alloc_chunk_is_zeroed() {
        let chunk = try_alloc_chunk(64).unwrap();
        assert_eq!(chunk.len(), 64);
        assert!(chunk.iter().all(|&b| b == 0));
    }
}
