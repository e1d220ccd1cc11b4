//! Submission-level behaviors: deferred pipeline compilation and the trace
//! playback entry points.

mod common;

use common::{setup, StubTranslator};
use pretty_assertions::assert_eq;
use xenos_gpu::pm4::{type3_header, Type3Opcode};
use xenos_gpu::xenos::PrimitiveType;
use xenos_hal::HostCommand;

#[test]
fn draws_are_skipped_while_their_pipeline_compiles() {
    let mut t = setup(StubTranslator::default());
    t.gpu.set_deferred_pipelines(true);
    t.set_default_draw_state();
    t.load_stub_shaders();

    assert!(t.cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    assert!(!t.cp.can_end_submission_immediately());
    assert!(t.cp.end_submission(false));

    // The pipeline never resolved, so the draw was dropped at replay.
    let first = t.gpu.submission_commands(0);
    assert!(!first
        .iter()
        .any(|c| matches!(c, HostCommand::DrawInstanced { .. })));

    // Once compilation finishes, the same draw goes through.
    t.gpu.complete_pending_pipelines();
    assert!(t.cp.can_end_submission_immediately());
    assert!(t.cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    assert!(t.cp.end_submission(false));
    let second = t.gpu.submission_commands(1);
    assert_eq!(
        second
            .iter()
            .filter(|c| matches!(c, HostCommand::DrawInstanced { .. }))
            .count(),
        1
    );
}

#[test]
fn edram_snapshot_restore_uploads_the_blob() {
    let mut t = setup(StubTranslator::default());
    let snapshot = vec![0x5Au8; 4096];
    t.cp.restore_edram_snapshot(&snapshot);
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);
    let copy = commands
        .iter()
        .find_map(|c| match c {
            HostCommand::CopyBufferRegion {
                dst,
                dst_offset,
                num_bytes,
                ..
            } => Some((*dst, *dst_offset, *num_bytes)),
            _ => None,
        })
        .expect("the snapshot upload must be recorded");
    assert_eq!(copy.1, 0);
    assert_eq!(copy.2, 4096);
    let _ = copy.0;
}

#[test]
fn trace_playback_writes_invalidate_the_mirror() {
    let mut t = setup(StubTranslator {
        vertex_fetch_slots: vec![0],
        ..Default::default()
    });
    t.set_default_draw_state();
    t.load_stub_shaders();
    t.write_vertex_fetch_constant(0, 0x6000, 16);

    let initiator = 4 | (2 << 6) | (3 << 16);
    let stream = [type3_header(Type3Opcode::DrawIndx2, 1), initiator];
    t.execute_stream(0x0010_0000, &stream);
    assert!(t.cp.shared_memory().is_range_valid(0x6000, 64));

    t.cp.trace_playback_wrote_memory(0x6000, 64);
    assert!(!t.cp.shared_memory().is_range_valid(0x6000, 64));
}

#[test]
fn swap_closes_the_frame_and_presents() {
    struct CountingPresenter(std::sync::Arc<std::sync::atomic::AtomicU32>);
    impl xenos_gpu::Presenter for CountingPresenter {
        fn present(&mut self, _image: xenos_hal::ImageHandle, width: u32, height: u32) {
            assert_eq!((width, height), (1280, 720));
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    let mut t = setup(StubTranslator::default());
    let presents = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
    t.cp.set_presenter(Box::new(CountingPresenter(presents.clone())));

    assert!(t.cp.issue_swap(0x0100_0000, 1280, 720));
    assert_eq!(presents.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(t.cp.context().current_frame(), 2);
    assert!(!t.cp.context().is_submission_open());
}
