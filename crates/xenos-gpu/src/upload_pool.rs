//! Submission-tracked upload buffer pool.
//!
//! Hands out linear slices of CPU-writable upload pages. A page is recycled
//! once the last submission that allocated from it is completed on the host.

use std::collections::VecDeque;
use std::sync::Arc;

use xenos_hal::{
    BufferDesc, BufferHandle, BufferUsage, Device, GpuAddress, MemoryClass, ResourceState,
};

pub const DEFAULT_PAGE_SIZE: u64 = 4 * 1024 * 1024;

struct Page {
    buffer: BufferHandle,
    gpu_address: GpuAddress,
    size: u64,
    last_submission: u64,
}

/// A slice of an upload page. Fill it through [`UploadBufferPool::write`] (or
/// directly via the device) before the submission closes.
#[derive(Clone, Copy, Debug)]
pub struct UploadAllocation {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
    pub gpu_address: GpuAddress,
}

pub struct UploadBufferPool {
    device: Arc<dyn Device>,
    page_size: u64,
    label: &'static str,
    current: Option<Page>,
    current_offset: u64,
    writable: VecDeque<Page>,
    submitted: VecDeque<Page>,
}

impl UploadBufferPool {
    pub fn new(device: Arc<dyn Device>, page_size: u64, label: &'static str) -> UploadBufferPool {
        UploadBufferPool {
            device,
            page_size,
            label,
            current: None,
            current_offset: 0,
            writable: VecDeque::new(),
            submitted: VecDeque::new(),
        }
    }

    /// Allocates exactly `size` bytes. Fails only if the host refuses a new
    /// page allocation.
    pub fn request(
        &mut self,
        submission: u64,
        size: u64,
        alignment: u64,
    ) -> Option<UploadAllocation> {
        debug_assert!(alignment.is_power_of_two());
        let aligned = (self.current_offset + alignment - 1) & !(alignment - 1);
        let fits = self
            .current
            .as_ref()
            .is_some_and(|page| aligned + size <= page.size);
        if !fits && !self.open_page(size) {
            return None;
        }
        let offset = if fits {
            aligned
        } else {
            0
        };
        let page = self.current.as_mut().unwrap();
        page.last_submission = submission;
        self.current_offset = offset + size;
        Some(UploadAllocation {
            buffer: page.buffer,
            offset,
            size,
            gpu_address: page.gpu_address.offset(offset),
        })
    }

    /// Allocates up to `size` bytes, returning however much remains in the
    /// current page (at least `alignment` bytes).
    pub fn request_partial(
        &mut self,
        submission: u64,
        size: u64,
        alignment: u64,
    ) -> Option<UploadAllocation> {
        debug_assert!(alignment.is_power_of_two());
        let aligned = (self.current_offset + alignment - 1) & !(alignment - 1);
        let remaining = self
            .current
            .as_ref()
            .map(|page| page.size.saturating_sub(aligned))
            .unwrap_or(0);
        if remaining < alignment.max(1) {
            if !self.open_page(alignment) {
                return None;
            }
        }
        let offset = if self.current_offset == 0 {
            0
        } else {
            aligned.min(self.current.as_ref().unwrap().size)
        };
        let page = self.current.as_mut().unwrap();
        let granted = size.min(page.size - offset);
        page.last_submission = submission;
        self.current_offset = offset + granted;
        Some(UploadAllocation {
            buffer: page.buffer,
            offset,
            size: granted,
            gpu_address: page.gpu_address.offset(offset),
        })
    }

    /// Convenience write-through into an allocation.
    pub fn write(&self, allocation: &UploadAllocation, data: &[u8]) {
        debug_assert!(data.len() as u64 <= allocation.size);
        // Upload heap writes cannot fail on a live buffer.
        let _ = self
            .device
            .write_buffer(allocation.buffer, allocation.offset, data);
    }

    /// Recycles pages whose last use is on or before `completed_submission`.
    pub fn completed_submission_updated(&mut self, completed_submission: u64) {
        while let Some(page) = self.submitted.front() {
            if page.last_submission > completed_submission {
                break;
            }
            let page = self.submitted.pop_front().unwrap();
            self.writable.push_back(page);
        }
    }

    /// Drops every recyclable page, keeping in-flight ones alive.
    pub fn clear_cache(&mut self) {
        for page in self.writable.drain(..) {
            self.device.destroy_buffer(page.buffer);
        }
    }

    fn open_page(&mut self, min_size: u64) -> bool {
        if let Some(page) = self.current.take() {
            self.submitted.push_back(page);
        }
        self.current_offset = 0;
        let needed = self.page_size.max(min_size);
        // Reuse a recycled page if it is large enough.
        if let Some(page) = self.writable.front() {
            if page.size >= needed {
                self.current = self.writable.pop_front();
                return true;
            }
        }
        let desc = BufferDesc {
            size: needed,
            usage: BufferUsage::empty(),
            memory: MemoryClass::Upload,
            initial_state: ResourceState::COPY_SOURCE,
            label: self.label,
        };
        match self.device.create_buffer(&desc) {
            Ok(buffer) => {
                let gpu_address = self.device.buffer_gpu_address(buffer);
                self.current = Some(Page {
                    buffer,
                    gpu_address,
                    size: needed,
                    last_submission: 0,
                });
                true
            }
            Err(err) => {
                tracing::error!("upload pool: page allocation failed: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xenos_hal::testing::MockGpu;

    fn pool(page_size: u64) -> (Arc<MockGpu>, UploadBufferPool) {
        let gpu = MockGpu::new();
        let device: Arc<dyn Device> = gpu.clone();
        (gpu, UploadBufferPool::new(device, page_size, "test pool"))
    }

    #[test]
    fn allocations_in_one_page_are_disjoint() {
        let (_gpu, mut pool) = pool(1024);
        let a = pool.request(1, 100, 16).unwrap();
        let b = pool.request(1, 100, 16).unwrap();
        assert_eq!(a.buffer, b.buffer);
        assert!(b.offset >= a.offset + a.size);
        assert_eq!(b.offset % 16, 0);
    }

    #[test]
    fn full_page_rolls_over_and_is_recycled_after_completion() {
        let (_gpu, mut pool) = pool(256);
        let a = pool.request(1, 200, 16).unwrap();
        let b = pool.request(2, 200, 16).unwrap();
        assert_ne!(a.buffer, b.buffer);

        // Submission 1 completing recycles the first page.
        pool.completed_submission_updated(1);
        let c = pool.request(3, 200, 16).unwrap();
        let _ = c;
        assert_eq!(pool.writable.len() + pool.submitted.len(), 1);
    }

    #[test]
    fn partial_request_returns_page_remainder() {
        let (_gpu, mut pool) = pool(256);
        let a = pool.request(1, 192, 16).unwrap();
        assert_eq!(a.size, 192);
        let b = pool.request_partial(1, 1024, 16).unwrap();
        assert_eq!(b.buffer, a.buffer);
        assert_eq!(b.size, 256 - 192);
    }

    #[test]
    fn oversized_request_gets_a_dedicated_page() {
        let (_gpu, mut pool) = pool(256);
        let a = pool.request(1, 4096, 16).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.size, 4096);
    }
}
