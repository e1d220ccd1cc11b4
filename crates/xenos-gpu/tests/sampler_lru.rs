//! Sampler cache bounds and eviction policy.

mod common;

use pretty_assertions::assert_eq;
use xenos_gpu::texture_cache::{SamplerParameters, TextureCache};
use xenos_gpu::GpuConfig;
use xenos_hal::testing::MockGpu;
use xenos_hal::Capabilities;

/// Host limit of 20 leaves a budget of 4 after the headroom of 16.
fn small_sampler_cache() -> TextureCache {
    let gpu = MockGpu::with_capabilities(Capabilities {
        max_sampler_count: 20,
        ..Capabilities::default()
    });
    TextureCache::new(gpu.clone(), &GpuConfig::default()).unwrap()
}

#[test]
fn same_key_returns_the_same_slot() {
    let mut cache = small_sampler_cache();
    let a = cache.use_sampler(1, 0, SamplerParameters(0x11)).unwrap();
    let b = cache.use_sampler(1, 0, SamplerParameters(0x11)).unwrap();
    assert_eq!(a, b);
    assert_eq!(cache.sampler_count(), 1);
}

#[test]
fn exceeding_the_budget_in_one_submission_reports_the_await_target() {
    let mut cache = small_sampler_cache();
    for i in 0..4u32 {
        cache.use_sampler(1, 0, SamplerParameters(i)).unwrap();
    }
    // A fifth distinct key: everything is last-used in submission 1, which
    // has not completed, so the caller must await it.
    let err = cache.use_sampler(1, 0, SamplerParameters(4)).unwrap_err();
    assert_eq!(err, 1);
}

#[test]
fn eviction_frees_the_least_recently_used_completed_slot() {
    let mut cache = small_sampler_cache();
    for i in 0..4u32 {
        cache.use_sampler(1, 0, SamplerParameters(i)).unwrap();
    }
    // Key 0 becomes the most recently used.
    let slot_0 = cache.use_sampler(1, 0, SamplerParameters(0)).unwrap();
    let slot_1 = cache.use_sampler(1, 0, SamplerParameters(1)).unwrap();

    // Submission 1 completed: a new key evicts the LRU entry (key 2).
    let slot_new = cache.use_sampler(2, 1, SamplerParameters(4)).unwrap();
    assert_eq!(cache.sampler_count(), 4);
    assert_ne!(slot_new, slot_0);
    assert_ne!(slot_new, slot_1);

    // The evicted key gets a fresh slot on next use; the survivors kept
    // theirs.
    assert_eq!(cache.use_sampler(2, 1, SamplerParameters(0)).unwrap(), slot_0);
    assert_eq!(cache.use_sampler(2, 1, SamplerParameters(1)).unwrap(), slot_1);
}
