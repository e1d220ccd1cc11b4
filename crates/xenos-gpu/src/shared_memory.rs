//! Shared guest-memory mirror.
//!
//! A single 512 MiB host buffer mirrors guest physical memory. Backing is
//! sparse (64 KiB host tiles grouped into 4 MiB allocation ranges); validity
//! is tracked per 4 KiB page; CPU writes invalidate pages asynchronously and
//! fire registered watch callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use xenos_hal::{
    Barrier, BufferDesc, BufferHandle, BufferUsage, BufferViewKind, DescriptorHeapDesc,
    DescriptorHeapHandle, DescriptorHeapKind, Device, Format, GpuAddress, HostCommand,
    MemoryClass, Queue, ResourceHandle, ResourceState,
};

use crate::command_processor::SubmissionContext;
use crate::config::GpuConfig;
use crate::guest_memory::{GuestMemory, ADDRESS_MASK, GUEST_MEMORY_SIZE, PAGE_SIZE, PAGE_SIZE_LOG2};
use crate::upload_pool::UploadBufferPool;

pub const BUFFER_SIZE: u32 = GUEST_MEMORY_SIZE;
pub const PAGE_COUNT: u32 = BUFFER_SIZE >> PAGE_SIZE_LOG2;

/// Sparse backing allocation granularity: 4 MiB ranges, each a whole number
/// of host sparse tiles.
pub const ALLOCATION_SIZE_LOG2: u32 = 22;
pub const ALLOCATION_SIZE: u32 = 1 << ALLOCATION_SIZE_LOG2;
pub const ALLOCATION_COUNT: u32 = BUFFER_SIZE >> ALLOCATION_SIZE_LOG2;

/// Watch bucket granularity for range-watch lookup.
const WATCH_BUCKET_SIZE_LOG2: u32 = 22;
const WATCH_BUCKET_COUNT: u32 = BUFFER_SIZE >> WATCH_BUCKET_SIZE_LOG2;

/// One-shot invalidation callback; the argument tells whether the GPU itself
/// caused the invalidation (resolve or memexport rather than a CPU write).
pub type WatchCallback = Box<dyn FnOnce(bool) + Send>;
/// Persistent whole-mirror watch over (address_first, address_last, by_gpu).
pub type GlobalWatchCallback = Box<dyn Fn(u32, u32, bool) + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WatchRangeHandle(u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GlobalWatchHandle(u64);

struct WatchRange {
    page_first: u32,
    page_last: u32,
    callback: WatchCallback,
}

/// Validity bitmap and watch lists. Shared with the CPU write-watch callback,
/// so everything here lives under one mutex; watch callbacks are invoked
/// after the lock is released.
struct Validity {
    valid_pages: Vec<u64>,
    next_watch_id: u64,
    ranges: HashMap<u64, WatchRange>,
    buckets: Vec<Vec<u64>>,
    global_watches: Vec<(u64, GlobalWatchCallback)>,
}

impl Validity {
    fn new(initially_valid: bool) -> Validity {
        let fill = if initially_valid { u64::MAX } else { 0 };
        Validity {
            valid_pages: vec![fill; (PAGE_COUNT >> 6) as usize],
            next_watch_id: 1,
            ranges: HashMap::new(),
            buckets: vec![Vec::new(); WATCH_BUCKET_COUNT as usize],
            global_watches: Vec::new(),
        }
    }

    fn set_range(&mut self, page_first: u32, page_count: u32, valid: bool) {
        if page_first >= PAGE_COUNT || page_count == 0 {
            return;
        }
        let page_last = (page_first + page_count - 1).min(PAGE_COUNT - 1);
        let block_first = page_first >> 6;
        let block_last = page_last >> 6;
        for block in block_first..=block_last {
            let mut bits = u64::MAX;
            if block == block_first {
                bits &= !((1u64 << (page_first & 63)) - 1);
            }
            if block == block_last && (page_last & 63) != 63 {
                bits &= (1u64 << ((page_last & 63) + 1)) - 1;
            }
            if valid {
                self.valid_pages[block as usize] |= bits;
            } else {
                self.valid_pages[block as usize] &= !bits;
            }
        }
    }

    /// Removes the watch ranges overlapping [page_first, page_last] and
    /// returns their callbacks.
    fn take_fired_ranges(&mut self, page_first: u32, page_last: u32) -> Vec<WatchCallback> {
        let bucket_first = (page_first << PAGE_SIZE_LOG2) >> WATCH_BUCKET_SIZE_LOG2;
        let bucket_last = (page_last << PAGE_SIZE_LOG2) >> WATCH_BUCKET_SIZE_LOG2;
        let mut fired = Vec::new();
        for bucket in bucket_first..=bucket_last.min(WATCH_BUCKET_COUNT - 1) {
            let ids = std::mem::take(&mut self.buckets[bucket as usize]);
            for id in ids {
                let overlaps = self
                    .ranges
                    .get(&id)
                    .is_some_and(|r| r.page_first <= page_last && r.page_last >= page_first);
                if overlaps {
                    let range = self.ranges.remove(&id).unwrap();
                    self.unlink(&range, id, Some(bucket));
                    fired.push(range.callback);
                } else if self.ranges.contains_key(&id) {
                    self.buckets[bucket as usize].push(id);
                }
            }
        }
        fired
    }

    fn unlink(&mut self, range: &WatchRange, id: u64, already_cleared: Option<u32>) {
        let bucket_first = (range.page_first << PAGE_SIZE_LOG2) >> WATCH_BUCKET_SIZE_LOG2;
        let bucket_last = (range.page_last << PAGE_SIZE_LOG2) >> WATCH_BUCKET_SIZE_LOG2;
        for bucket in bucket_first..=bucket_last.min(WATCH_BUCKET_COUNT - 1) {
            if Some(bucket) == already_cleared {
                continue;
            }
            self.buckets[bucket as usize].retain(|other| *other != id);
        }
    }
}

/// Slots of the non-shader-visible staging heap holding the pre-created
/// buffer views, copied into destination heaps on bind.
#[derive(Clone, Copy)]
enum StagedDescriptor {
    RawSrv = 0,
    R32Srv = 1,
    R32G32Srv = 2,
    R32G32B32A32Srv = 3,
    RawUav = 4,
    R32Uav = 5,
    R32G32Uav = 6,
    R32G32B32A32Uav = 7,
}

const STAGED_DESCRIPTOR_COUNT: u32 = 8;

pub struct SharedMemory {
    device: Arc<dyn Device>,
    queue: Arc<dyn Queue>,
    memory: Arc<GuestMemory>,

    buffer: BufferHandle,
    buffer_gpu_address: GpuAddress,
    buffer_state: ResourceState,
    uav_writes_commit_needed: bool,
    tiled: bool,

    /// One bit per 4 MiB allocation range; set when backed.
    resident_allocations: Vec<u64>,
    allocation_failed: bool,

    upload_pool: UploadBufferPool,
    validity: Arc<Mutex<Validity>>,
    memory_watch: crate::guest_memory::WatchHandle,

    staging_heap: DescriptorHeapHandle,
}

impl SharedMemory {
    pub fn new(
        device: Arc<dyn Device>,
        queue: Arc<dyn Queue>,
        memory: Arc<GuestMemory>,
        config: &GpuConfig,
    ) -> Result<SharedMemory, xenos_hal::HalError> {
        let caps = device.capabilities();
        let tiled = config.tiled_shared_memory && caps.tiled_resources;
        let desc = BufferDesc {
            size: BUFFER_SIZE as u64,
            usage: BufferUsage::UNORDERED_ACCESS | BufferUsage::INDEX,
            memory: MemoryClass::DeviceLocal,
            initial_state: ResourceState::COPY_DEST,
            label: "shared memory",
        };
        let buffer = if tiled {
            device.create_reserved_buffer(&desc)?
        } else {
            tracing::warn!(
                "shared memory: tiled resources unavailable or disabled, \
                 committing the full 512 MiB buffer"
            );
            device.create_buffer(&desc)?
        };
        let buffer_gpu_address = device.buffer_gpu_address(buffer);

        let staging_heap = device.create_descriptor_heap(&DescriptorHeapDesc {
            kind: DescriptorHeapKind::View,
            capacity: STAGED_DESCRIPTOR_COUNT,
            shader_visible: false,
            label: "shared memory views",
        })?;
        let raw = BufferViewKind::Raw {
            size_bytes: BUFFER_SIZE as u64,
        };
        let typed = |format: Format, log2: u32| BufferViewKind::Typed {
            format,
            element_count: (BUFFER_SIZE >> (2 + log2)) as u64,
        };
        device.write_buffer_srv(staging_heap, StagedDescriptor::RawSrv as u32, buffer, raw)?;
        device.write_buffer_uav(staging_heap, StagedDescriptor::RawUav as u32, buffer, raw)?;
        device.write_buffer_srv(
            staging_heap,
            StagedDescriptor::R32Srv as u32,
            buffer,
            typed(Format::R32Uint, 0),
        )?;
        device.write_buffer_uav(
            staging_heap,
            StagedDescriptor::R32Uav as u32,
            buffer,
            typed(Format::R32Uint, 0),
        )?;
        device.write_buffer_srv(
            staging_heap,
            StagedDescriptor::R32G32Srv as u32,
            buffer,
            typed(Format::R32G32Uint, 1),
        )?;
        device.write_buffer_uav(
            staging_heap,
            StagedDescriptor::R32G32Uav as u32,
            buffer,
            typed(Format::R32G32Uint, 1),
        )?;
        device.write_buffer_srv(
            staging_heap,
            StagedDescriptor::R32G32B32A32Srv as u32,
            buffer,
            typed(Format::R32G32B32A32Uint, 2),
        )?;
        device.write_buffer_uav(
            staging_heap,
            StagedDescriptor::R32G32B32A32Uav as u32,
            buffer,
            typed(Format::R32G32B32A32Uint, 2),
        )?;

        let initially_valid = config.clear_memory_page_state.unwrap_or(false);
        let validity = Arc::new(Mutex::new(Validity::new(initially_valid)));

        let watch_validity = validity.clone();
        let memory_watch = memory.register_write_watch(move |page_first, page_last| {
            let fired = {
                let mut validity = watch_validity.lock().unwrap();
                validity.set_range(page_first, page_last - page_first + 1, false);
                for (_, global) in &validity.global_watches {
                    global(
                        page_first << PAGE_SIZE_LOG2,
                        (page_last << PAGE_SIZE_LOG2) | (PAGE_SIZE - 1),
                        false,
                    );
                }
                validity.take_fired_ranges(page_first, page_last)
            };
            for callback in fired {
                callback(false);
            }
        });

        let upload_pool = UploadBufferPool::new(
            device.clone(),
            crate::upload_pool::DEFAULT_PAGE_SIZE,
            "shared memory upload",
        );

        Ok(SharedMemory {
            device,
            queue,
            memory,
            buffer,
            buffer_gpu_address,
            buffer_state: ResourceState::COPY_DEST,
            uav_writes_commit_needed: false,
            tiled,
            resident_allocations: vec![0; (ALLOCATION_COUNT as usize).div_ceil(64)],
            allocation_failed: false,
            upload_pool,
            validity,
            memory_watch,
            staging_heap,
        })
    }

    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    pub fn gpu_address(&self) -> GpuAddress {
        self.buffer_gpu_address
    }

    /// GPU address of a guest physical address within the mirror.
    pub fn gpu_address_of(&self, guest_address: u32) -> GpuAddress {
        self.buffer_gpu_address
            .offset((guest_address & ADDRESS_MASK) as u64)
    }

    pub fn begin_submission(&mut self) {
        self.allocation_failed = false;
    }

    pub fn completed_submission_updated(&mut self, completed_submission: u64) {
        self.upload_pool
            .completed_submission_updated(completed_submission);
    }

    /// Maps sparse backing over `[start, start + length)`. Mapping happens on
    /// the queue timeline, outside the command list, so the context is told to
    /// cover it with the next fence.
    pub fn make_tiles_resident(
        &mut self,
        ctx: &mut SubmissionContext,
        start: u32,
        length: u32,
    ) -> bool {
        if length == 0 {
            return true;
        }
        let start = start & ADDRESS_MASK;
        if BUFFER_SIZE - start < length {
            return false;
        }
        if !self.tiled {
            return true;
        }
        let allocation_first = start >> ALLOCATION_SIZE_LOG2;
        let allocation_last = (start + length - 1) >> ALLOCATION_SIZE_LOG2;
        for allocation in allocation_first..=allocation_last {
            let block = (allocation >> 6) as usize;
            let bit = 1u64 << (allocation & 63);
            if self.resident_allocations[block] & bit != 0 {
                continue;
            }
            if self.allocation_failed {
                // Not worth retrying per draw within one submission.
                return false;
            }
            if let Err(err) = self.queue.update_tile_mappings(
                self.buffer,
                (allocation as u64) << ALLOCATION_SIZE_LOG2,
                ALLOCATION_SIZE as u64,
            ) {
                tracing::error!("shared memory: tile mapping failed: {err}");
                self.allocation_failed = true;
                return false;
            }
            self.resident_allocations[block] |= bit;
            ctx.notify_queue_operations_done_directly();
        }
        true
    }

    /// Ensures `[start, start + length)` is resident and current on the GPU.
    /// May record upload copies; call before `use_for_reading`/`use_for_writing`.
    pub fn request_range(
        &mut self,
        ctx: &mut SubmissionContext,
        start: u32,
        length: u32,
    ) -> bool {
        if length == 0 {
            // An empty texture or vertex range is safe to draw with.
            return true;
        }
        let start = start & ADDRESS_MASK;
        if BUFFER_SIZE - start < length {
            return false;
        }
        if !self.make_tiles_resident(ctx, start, length) {
            return false;
        }

        let page_first = start >> PAGE_SIZE_LOG2;
        let page_last = (start + length - 1) >> PAGE_SIZE_LOG2;
        let upload_ranges = self.ranges_to_upload(page_first, page_last);
        if upload_ranges.is_empty() {
            return true;
        }

        self.transition(ctx, ResourceState::COPY_DEST);
        ctx.submit_barriers();
        for (range_start, range_length) in upload_ranges {
            let mut upload_page = range_start;
            let mut pages_remaining = range_length;
            while pages_remaining != 0 {
                let Some(allocation) = self.upload_pool.request_partial(
                    ctx.current_submission(),
                    (pages_remaining as u64) << PAGE_SIZE_LOG2,
                    PAGE_SIZE as u64,
                ) else {
                    tracing::error!("shared memory: failed to get an upload buffer");
                    return false;
                };
                let allocation_pages = (allocation.size >> PAGE_SIZE_LOG2) as u32;
                self.mark_range_valid(upload_page, allocation_pages);
                self.memory.with_slice(
                    upload_page << PAGE_SIZE_LOG2,
                    allocation_pages << PAGE_SIZE_LOG2,
                    |bytes| {
                        // Upload heap writes cannot fail on a live buffer.
                        let _ =
                            self.device
                                .write_buffer(allocation.buffer, allocation.offset, bytes);
                    },
                );
                ctx.deferred.push(HostCommand::CopyBufferRegion {
                    dst: self.buffer,
                    dst_offset: (upload_page as u64) << PAGE_SIZE_LOG2,
                    src: allocation.buffer,
                    src_offset: allocation.offset,
                    num_bytes: allocation.size,
                });
                upload_page += allocation_pages;
                pages_remaining -= allocation_pages;
            }
        }
        true
    }

    /// Makes the buffer usable for vertices, indices and texture untiling.
    pub fn use_for_reading(&mut self, ctx: &mut SubmissionContext) {
        self.commit_uav_writes_and_transition(ctx, ResourceState::shader_read());
    }

    /// Makes the buffer usable for writes from resolve tiling and memexport.
    pub fn use_for_writing(&mut self, ctx: &mut SubmissionContext) {
        self.commit_uav_writes_and_transition(ctx, ResourceState::UNORDERED_ACCESS);
    }

    pub fn use_as_copy_source(&mut self, ctx: &mut SubmissionContext) {
        self.commit_uav_writes_and_transition(ctx, ResourceState::COPY_SOURCE);
    }

    /// Must be called after recording UAV writes into the buffer so the next
    /// `use_for_writing` inserts an ordering barrier.
    pub fn mark_uav_writes_commit_needed(&mut self) {
        if self.buffer_state == ResourceState::UNORDERED_ACCESS {
            self.uav_writes_commit_needed = true;
        }
    }

    /// The GPU itself wrote `[start, start + length)` (resolve, memexport):
    /// fire watches and mark pages valid so the CPU copy is not re-uploaded
    /// over the new data.
    pub fn range_written_by_gpu(&mut self, start: u32, length: u32) {
        if length == 0 {
            return;
        }
        let start = start & ADDRESS_MASK;
        let length = length.min(BUFFER_SIZE - start);
        let page_first = start >> PAGE_SIZE_LOG2;
        let page_last = (start + length - 1) >> PAGE_SIZE_LOG2;
        self.fire_watches(page_first, page_last, true);
        self.mark_range_valid(page_first, page_last - page_first + 1);
    }

    /// Registers a one-shot invalidation callback over a byte range.
    pub fn watch_memory_range(
        &self,
        start: u32,
        length: u32,
        callback: WatchCallback,
    ) -> Option<WatchRangeHandle> {
        if length == 0 {
            return None;
        }
        let start = start & ADDRESS_MASK;
        let length = length.min(BUFFER_SIZE - start);
        let page_first = start >> PAGE_SIZE_LOG2;
        let page_last = (start + length - 1) >> PAGE_SIZE_LOG2;
        let mut validity = self.validity.lock().unwrap();
        let id = validity.next_watch_id;
        validity.next_watch_id += 1;
        validity.ranges.insert(
            id,
            WatchRange {
                page_first,
                page_last,
                callback,
            },
        );
        let bucket_first = (page_first << PAGE_SIZE_LOG2) >> WATCH_BUCKET_SIZE_LOG2;
        let bucket_last = (page_last << PAGE_SIZE_LOG2) >> WATCH_BUCKET_SIZE_LOG2;
        for bucket in bucket_first..=bucket_last.min(WATCH_BUCKET_COUNT - 1) {
            validity.buckets[bucket as usize].push(id);
        }
        Some(WatchRangeHandle(id))
    }

    pub fn unwatch_memory_range(&self, handle: WatchRangeHandle) {
        let mut validity = self.validity.lock().unwrap();
        if let Some(range) = validity.ranges.remove(&handle.0) {
            validity.unlink(&range, handle.0, None);
        }
    }

    /// Registers a persistent watch over the whole mirror. The callback runs
    /// under the validity lock and must not call back into the shared memory.
    pub fn register_global_watch(&self, callback: GlobalWatchCallback) -> GlobalWatchHandle {
        let mut validity = self.validity.lock().unwrap();
        let id = validity.next_watch_id;
        validity.next_watch_id += 1;
        validity.global_watches.push((id, callback));
        GlobalWatchHandle(id)
    }

    pub fn unregister_global_watch(&self, handle: GlobalWatchHandle) {
        let mut validity = self.validity.lock().unwrap();
        validity.global_watches.retain(|(id, _)| *id != handle.0);
    }

    pub fn write_raw_srv(&self, heap: DescriptorHeapHandle, slot: u32) {
        self.copy_staged(heap, slot, StagedDescriptor::RawSrv);
    }

    pub fn write_raw_uav(&self, heap: DescriptorHeapHandle, slot: u32) {
        self.copy_staged(heap, slot, StagedDescriptor::RawUav);
    }

    /// Typed uint view with `1 << element_size_log2` dwords per element
    /// (log2 in 0..=2).
    pub fn write_uint_pow2_srv(&self, heap: DescriptorHeapHandle, slot: u32, log2: u32) {
        self.copy_staged(
            heap,
            slot,
            match log2 {
                0 => StagedDescriptor::R32Srv,
                1 => StagedDescriptor::R32G32Srv,
                _ => StagedDescriptor::R32G32B32A32Srv,
            },
        );
    }

    pub fn write_uint_pow2_uav(&self, heap: DescriptorHeapHandle, slot: u32, log2: u32) {
        self.copy_staged(
            heap,
            slot,
            match log2 {
                0 => StagedDescriptor::R32Uav,
                1 => StagedDescriptor::R32G32Uav,
                _ => StagedDescriptor::R32G32B32A32Uav,
            },
        );
    }

    /// Whether every page of the range is currently valid (test/introspection).
    pub fn is_range_valid(&self, start: u32, length: u32) -> bool {
        if length == 0 {
            return true;
        }
        let start = start & ADDRESS_MASK;
        let page_first = start >> PAGE_SIZE_LOG2;
        let page_last = (start + length - 1) >> PAGE_SIZE_LOG2;
        let validity = self.validity.lock().unwrap();
        (page_first..=page_last).all(|page| {
            validity.valid_pages[(page >> 6) as usize] & (1u64 << (page & 63)) != 0
        })
    }

    /// Invalidates pages written by trace playback so the next use reuploads.
    pub fn trace_playback_wrote_memory(&mut self, start: u32, length: u32) {
        if length == 0 {
            return;
        }
        let start = start & ADDRESS_MASK;
        let length = length.min(BUFFER_SIZE - start);
        let page_first = start >> PAGE_SIZE_LOG2;
        let page_last = (start + length - 1) >> PAGE_SIZE_LOG2;
        {
            let mut validity = self.validity.lock().unwrap();
            validity.set_range(page_first, page_last - page_first + 1, false);
        }
        self.fire_watches(page_first, page_last, false);
    }

    /// Emits copies of all currently valid ranges into `readback`, for trace
    /// snapshots. Returns the copied ranges (guest offset, length).
    pub fn submit_trace_download(
        &mut self,
        ctx: &mut SubmissionContext,
        readback: BufferHandle,
    ) -> Vec<(u32, u32)> {
        let mut ranges = Vec::new();
        {
            let validity = self.validity.lock().unwrap();
            let mut run_start: Option<u32> = None;
            for page in 0..PAGE_COUNT {
                let valid =
                    validity.valid_pages[(page >> 6) as usize] & (1u64 << (page & 63)) != 0;
                match (valid, run_start) {
                    (true, None) => run_start = Some(page),
                    (false, Some(start)) => {
                        ranges.push((start << PAGE_SIZE_LOG2, (page - start) << PAGE_SIZE_LOG2));
                        run_start = None;
                    }
                    _ => {}
                }
            }
            if let Some(start) = run_start {
                ranges.push((
                    start << PAGE_SIZE_LOG2,
                    (PAGE_COUNT - start) << PAGE_SIZE_LOG2,
                ));
            }
        }
        if ranges.is_empty() {
            return ranges;
        }
        self.use_as_copy_source(ctx);
        ctx.submit_barriers();
        for (offset, length) in &ranges {
            ctx.deferred.push(HostCommand::CopyBufferRegion {
                dst: readback,
                dst_offset: *offset as u64,
                src: self.buffer,
                src_offset: *offset as u64,
                num_bytes: *length as u64,
            });
        }
        ranges
    }

    fn copy_staged(&self, heap: DescriptorHeapHandle, slot: u32, staged: StagedDescriptor) {
        let _ = self
            .device
            .copy_descriptors(heap, slot, self.staging_heap, staged as u32, 1);
    }

    fn commit_uav_writes_and_transition(
        &mut self,
        ctx: &mut SubmissionContext,
        new_state: ResourceState,
    ) {
        if self.buffer_state == new_state && self.uav_writes_commit_needed {
            ctx.push_barrier(Barrier::UnorderedAccess {
                resource: Some(ResourceHandle::Buffer(self.buffer)),
            });
        }
        self.transition(ctx, new_state);
        self.uav_writes_commit_needed = false;
    }

    fn transition(&mut self, ctx: &mut SubmissionContext, new_state: ResourceState) {
        if ctx.push_transition_barrier(
            ResourceHandle::Buffer(self.buffer),
            self.buffer_state,
            new_state,
            None,
        ) {
            self.buffer_state = new_state;
        }
    }

    fn mark_range_valid(&self, page_first: u32, page_count: u32) {
        let mut validity = self.validity.lock().unwrap();
        validity.set_range(page_first, page_count, true);
    }

    fn fire_watches(&self, page_first: u32, page_last: u32, by_gpu: bool) {
        let fired = {
            let mut validity = self.validity.lock().unwrap();
            for (_, global) in &validity.global_watches {
                global(
                    page_first << PAGE_SIZE_LOG2,
                    (page_last << PAGE_SIZE_LOG2) | (PAGE_SIZE - 1),
                    by_gpu,
                );
            }
            validity.take_fired_ranges(page_first, page_last)
        };
        for callback in fired {
            callback(by_gpu);
        }
    }

    /// Runs of invalid pages within [request_page_first, request_page_last],
    /// as (first_page, page_count), coalesced.
    fn ranges_to_upload(&self, request_page_first: u32, request_page_last: u32) -> Vec<(u32, u32)> {
        let request_page_last = request_page_last.min(PAGE_COUNT - 1);
        let mut ranges = Vec::new();
        let validity = self.validity.lock().unwrap();
        let mut run_start: Option<u32> = None;
        for page in request_page_first..=request_page_last {
            let valid = validity.valid_pages[(page >> 6) as usize] & (1u64 << (page & 63)) != 0;
            match (valid, run_start) {
                (false, None) => run_start = Some(page),
                (true, Some(start)) => {
                    ranges.push((start, page - start));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            ranges.push((start, request_page_last + 1 - start));
        }
        ranges
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        self.memory.unregister_write_watch(self.memory_watch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_processor::SubmissionContext;
    use xenos_hal::testing::MockGpu;
    use xenos_hal::Provider;

    fn setup() -> (Arc<MockGpu>, Arc<GuestMemory>, SharedMemory, SubmissionContext) {
        let gpu = MockGpu::new();
        let memory = Arc::new(GuestMemory::new());
        let config = GpuConfig::default();
        let provider = Provider::new(gpu.clone(), gpu.clone());
        let ctx = SubmissionContext::new(provider, config.clone()).unwrap();
        let smm = SharedMemory::new(gpu.clone(), gpu.clone(), memory.clone(), &config).unwrap();
        (gpu, memory, smm, ctx)
    }

    fn copy_regions(commands: &[HostCommand]) -> Vec<(u64, u64)> {
        commands
            .iter()
            .filter_map(|c| match c {
                HostCommand::CopyBufferRegion {
                    dst_offset,
                    num_bytes,
                    ..
                } => Some((*dst_offset, *num_bytes)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn request_range_uploads_invalid_pages_once() {
        let (_gpu, _memory, mut smm, mut ctx) = setup();
        assert!(smm.request_range(&mut ctx, 0x1000, 0x100));
        let copies = copy_regions(
            &ctx.deferred
                .commands()
                .iter()
                .filter_map(|c| match c {
                    crate::deferred::DeferredCommand::Host(h) => Some(h.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        );
        // One page-granular copy covering 0x1000.
        assert_eq!(copies, vec![(0x1000, 0x1000)]);
        assert!(smm.is_range_valid(0x1000, 0x100));

        // A second request over the same range uploads nothing.
        let before = ctx.deferred.len();
        assert!(smm.request_range(&mut ctx, 0x1000, 0x100));
        assert_eq!(ctx.deferred.len(), before);
    }

    #[test]
    fn cpu_write_invalidates_and_reupload_happens() {
        let (_gpu, memory, mut smm, mut ctx) = setup();
        assert!(smm.request_range(&mut ctx, 0x4000, 0x10));
        assert!(smm.is_range_valid(0x4000, 0x10));

        memory.write_u32(0x4008, 0x12345678);
        assert!(!smm.is_range_valid(0x4000, 0x10));

        assert!(smm.request_range(&mut ctx, 0x4000, 0x10));
        assert!(smm.is_range_valid(0x4000, 0x10));
    }

    #[test]
    fn watch_fires_once_on_cpu_write() {
        let (_gpu, memory, mut smm, mut ctx) = setup();
        assert!(smm.request_range(&mut ctx, 0x8000, 0x20));

        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_in_callback = fired.clone();
        smm.watch_memory_range(
            0x8000,
            0x20,
            Box::new(move |by_gpu| {
                assert!(!by_gpu);
                fired_in_callback.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        )
        .unwrap();

        memory.write_u32(0x8010, 1);
        memory.write_u32(0x8014, 2);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn unwatched_range_does_not_fire() {
        let (_gpu, memory, smm, _ctx) = setup();
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_in_callback = fired.clone();
        let handle = smm
            .watch_memory_range(
                0x10000,
                0x100,
                Box::new(move |_| {
                    fired_in_callback.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .unwrap();
        smm.unwatch_memory_range(handle);
        memory.write_u32(0x10000, 1);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn gpu_written_range_fires_watches_and_stays_valid() {
        let (_gpu, _memory, mut smm, mut ctx) = setup();
        assert!(smm.request_range(&mut ctx, 0x2000, 0x1000));
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let fired_in_callback = fired.clone();
        smm.watch_memory_range(
            0x2000,
            0x1000,
            Box::new(move |by_gpu| {
                assert!(by_gpu);
                fired_in_callback.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
        )
        .unwrap();

        smm.range_written_by_gpu(0x2000, 0x1000);
        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(smm.is_range_valid(0x2000, 0x1000));
    }

    #[test]
    fn the_very_last_page_is_requestable() {
        let (_gpu, _memory, mut smm, mut ctx) = setup();
        assert!(smm.request_range(&mut ctx, BUFFER_SIZE - PAGE_SIZE, PAGE_SIZE));
        // One byte past the end is not.
        assert!(!smm.request_range(&mut ctx, BUFFER_SIZE - PAGE_SIZE, PAGE_SIZE + 1));
    }

    #[test]
    fn tiles_resident_maps_sparse_allocations_once() {
        let (gpu, _memory, mut smm, mut ctx) = setup();
        assert!(smm.make_tiles_resident(&mut ctx, 0x10_0000, 0x1000));
        let updates = gpu.tile_mapping_updates();
        assert!(updates >= 1);
        assert!(smm.make_tiles_resident(&mut ctx, 0x10_0000, 0x1000));
        assert_eq!(gpu.tile_mapping_updates(), updates);
    }

    #[test]
    fn coalescing_merges_adjacent_invalid_runs() {
        let (_gpu, _memory, mut smm, mut ctx) = setup();
        // Prime two pages with a hole, then request across all three.
        assert!(smm.request_range(&mut ctx, 0, PAGE_SIZE));
        assert!(smm.request_range(&mut ctx, PAGE_SIZE * 2, PAGE_SIZE));
        ctx.deferred.reset();
        assert!(smm.request_range(&mut ctx, 0, PAGE_SIZE * 3));
        let copies: Vec<_> = ctx
            .deferred
            .commands()
            .iter()
            .filter_map(|c| match c {
                crate::deferred::DeferredCommand::Host(HostCommand::CopyBufferRegion {
                    dst_offset,
                    num_bytes,
                    ..
                }) => Some((*dst_offset, *num_bytes)),
                _ => None,
            })
            .collect();
        assert_eq!(copies, vec![(PAGE_SIZE as u64, PAGE_SIZE as u64)]);
    }
}
