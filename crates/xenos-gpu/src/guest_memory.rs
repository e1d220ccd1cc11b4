//! Guest physical memory shared with the CPU side of the emulator.
//!
//! The GPU core reads command buffers, index data and texture data from here
//! and writes event timestamps, register dumps and readback results. Any CPU
//! thread may write concurrently; writes are reported to registered watchers
//! at page granularity so the shared-memory mirror can invalidate its pages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Size of the guest physical address space mirrored by the GPU.
pub const GUEST_MEMORY_SIZE: u32 = 512 << 20;
/// Validity-tracking page size.
pub const PAGE_SIZE_LOG2: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SIZE_LOG2;
pub const ADDRESS_MASK: u32 = GUEST_MEMORY_SIZE - 1;

type WatchCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WatchHandle(u64);

pub struct GuestMemory {
    data: RwLock<Box<[u8]>>,
    watchers: Mutex<Vec<(u64, WatchCallback)>>,
    next_watcher: AtomicU64,
}

impl Default for GuestMemory {
    fn default() -> Self {
        GuestMemory::new()
    }
}

impl GuestMemory {
    pub fn new() -> GuestMemory {
        GuestMemory {
            data: RwLock::new(vec![0u8; GUEST_MEMORY_SIZE as usize].into_boxed_slice()),
            watchers: Mutex::new(Vec::new()),
            next_watcher: AtomicU64::new(1),
        }
    }

    pub fn read(&self, address: u32, out: &mut [u8]) {
        let address = (address & ADDRESS_MASK) as usize;
        let data = self.data.read().unwrap();
        let end = (address + out.len()).min(data.len());
        let available = end - address;
        out[..available].copy_from_slice(&data[address..end]);
        out[available..].fill(0);
    }

    pub fn read_u32(&self, address: u32) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Copies a range into `out` via a callback to avoid an intermediate
    /// allocation for large uploads.
    pub fn with_slice<R>(&self, address: u32, len: u32, f: impl FnOnce(&[u8]) -> R) -> R {
        let address = (address & ADDRESS_MASK) as usize;
        let data = self.data.read().unwrap();
        let end = (address + len as usize).min(data.len());
        f(&data[address..end])
    }

    /// CPU-visible write: stores the bytes and notifies watchers.
    pub fn write(&self, address: u32, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let address = address & ADDRESS_MASK;
        {
            let mut data = self.data.write().unwrap();
            let start = address as usize;
            let end = (start + bytes.len()).min(data.len());
            data[start..end].copy_from_slice(&bytes[..end - start]);
        }
        let page_first = address >> PAGE_SIZE_LOG2;
        let page_last = (address + bytes.len() as u32 - 1) >> PAGE_SIZE_LOG2;
        self.notify_written(page_first, page_last);
    }

    pub fn write_u32(&self, address: u32, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    /// Registers a physical write watcher. The callback receives the first
    /// and last written page index and may run on any thread.
    pub fn register_write_watch(
        &self,
        callback: impl Fn(u32, u32) + Send + Sync + 'static,
    ) -> WatchHandle {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers
            .lock()
            .unwrap()
            .push((id, Box::new(callback)));
        WatchHandle(id)
    }

    pub fn unregister_write_watch(&self, handle: WatchHandle) {
        self.watchers.lock().unwrap().retain(|(id, _)| *id != handle.0);
    }

    fn notify_written(&self, page_first: u32, page_last: u32) {
        let watchers = self.watchers.lock().unwrap();
        for (_, callback) in watchers.iter() {
            callback(page_first, page_last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn writes_fire_page_watchers() {
        let mem = GuestMemory::new();
        let pages = Arc::new(AtomicU32::new(0));
        let pages_seen = pages.clone();
        mem.register_write_watch(move |first, last| {
            pages_seen.fetch_add(last - first + 1, Ordering::SeqCst);
        });

        // A write spanning a page boundary reports both pages.
        mem.write(PAGE_SIZE - 2, &[1, 2, 3, 4]);
        assert_eq!(pages.load(Ordering::SeqCst), 2);
        assert_eq!(mem.read_u32(PAGE_SIZE - 2), u32::from_le_bytes([1, 2, 3, 4]));
    }

    #[test]
    fn last_page_of_the_mirror_is_addressable() {
        let mem = GuestMemory::new();
        let last = GUEST_MEMORY_SIZE - 4;
        mem.write_u32(last, 0xDEAD_BEEF);
        assert_eq!(mem.read_u32(last), 0xDEAD_BEEF);
    }
}
