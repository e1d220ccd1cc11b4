//! First-light scenario: one vertex range upload and one non-indexed
//! triangle through the whole pipeline.

mod common;

use common::{setup, StubTranslator};
use pretty_assertions::assert_eq;
use xenos_gpu::pm4::{type3_header, Type3Opcode};
use xenos_hal::HostCommand;

#[test]
fn vertex_upload_and_triangle_draw() {
    let mut t = setup(StubTranslator {
        vertex_fetch_slots: vec![0],
        ..Default::default()
    });
    t.set_default_draw_state();
    t.load_stub_shaders();

    // Vertex stream of 64 dwords at 0x1000.
    t.write_vertex_fetch_constant(0, 0x1000, 64);
    for i in 0..64u32 {
        t.memory.write_u32(0x1000 + i * 4, 0x4000_0000 + i);
    }

    // Non-indexed 3-vertex triangle list.
    let initiator = 4 | (2 << 6) | (3 << 16);
    let stream = [type3_header(Type3Opcode::DrawIndx2, 1), initiator];
    t.execute_stream(0x0010_0000, &stream);

    assert!(t.cp.end_submission(false));
    t.cp.check_submission_fence(1);
    assert_eq!(t.cp.context().completed_submission(), 1);

    let commands = t.gpu.submission_commands(0);
    let shared_memory_buffer = t.cp.shared_memory().buffer();

    // Exactly one upload into the mirror, covering the page holding the
    // vertex stream.
    let uploads: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            HostCommand::CopyBufferRegion {
                dst,
                dst_offset,
                num_bytes,
                ..
            } if *dst == shared_memory_buffer => Some((*dst_offset, *num_bytes)),
            _ => None,
        })
        .collect();
    assert_eq!(uploads, vec![(0x1000, 0x1000)]);

    // After the upload, the GPU view of the page matches guest memory.
    assert!(t.cp.shared_memory().is_range_valid(0x1000, 0x100));
    assert_eq!(
        t.gpu.buffer_bytes(shared_memory_buffer, 0x1000, 4),
        0x4000_0000u32.to_le_bytes()
    );

    // One three-vertex draw made it to the host.
    let draws: Vec<_> = commands
        .iter()
        .filter(|c| {
            matches!(
                c,
                HostCommand::DrawInstanced {
                    vertex_count_per_instance: 3,
                    instance_count: 1,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(draws.len(), 1);
    assert!(t.gpu.violations().is_empty());
}

#[test]
fn draw_records_replay_in_order_after_await() {
    let mut t = setup(StubTranslator::default());
    t.set_default_draw_state();
    t.load_stub_shaders();

    let initiator = 4 | (2 << 6) | (3 << 16);
    let stream = [type3_header(Type3Opcode::DrawIndx2, 1), initiator];
    t.execute_stream(0x0010_0000, &stream);
    assert!(t.cp.end_submission(false));
    t.cp.check_submission_fence(1);

    // Everything recorded during the submission is on the host: the replay
    // log is non-empty, nothing is left deferred.
    assert!(!t.gpu.submission_commands(0).is_empty());
    assert!(t.cp.context().deferred.is_empty());
}
