//! Indexed triangle-fan conversion through the PM4 draw path.

mod common;

use common::{setup, StubTranslator};
use pretty_assertions::assert_eq;
use xenos_gpu::pm4::{type3_header, Type3Opcode};
use xenos_hal::HostCommand;

#[test]
fn indexed_fan_is_expanded_into_the_frame_arena() {
    let mut t = setup(StubTranslator::default());
    t.set_default_draw_state();
    t.load_stub_shaders();

    // Six u16 fan indices 0..5 at 0x2000.
    let indices: [u16; 6] = [0, 1, 2, 3, 4, 5];
    let mut bytes = Vec::new();
    for index in indices {
        bytes.extend_from_slice(&index.to_le_bytes());
    }
    t.memory.write(0x2000, &bytes);

    // DRAW_INDX with DMA indices: triangle fan, 6 indices, 16-bit.
    let initiator = 5 | (6 << 16);
    let stream = [
        type3_header(Type3Opcode::DrawIndx, 4),
        0, // viz query
        initiator,
        0x2000, // index base
        3,      // 3 dwords of index data, no swap
    ];
    t.execute_stream(0x0010_0000, &stream);
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);

    // The host draw uses 12 indices.
    assert!(commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawIndexedInstanced {
            index_count_per_instance: 12,
            instance_count: 1,
            ..
        }
    )));

    // The bound index buffer lives in the per-frame arena and contains the
    // expanded list (v[i-1], v[i], v[0]).
    let view = commands
        .iter()
        .find_map(|c| match c {
            HostCommand::SetIndexBuffer { view: Some(view) } => Some(*view),
            _ => None,
        })
        .expect("an index buffer must be bound");
    assert_eq!(view.size_bytes, 24);
    let (buffer, offset) = t.gpu.resolve_address(view.address);
    let raw = t.gpu.buffer_bytes(buffer, offset, 24);
    let host: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(host, vec![1, 2, 0, 2, 3, 0, 3, 4, 0, 4, 5, 0]);
}

#[test]
fn non_indexed_fan_with_two_vertices_draws_nothing() {
    let mut t = setup(StubTranslator::default());
    t.set_default_draw_state();
    t.load_stub_shaders();

    let initiator = 5 | (2 << 6) | (2 << 16);
    let stream = [type3_header(Type3Opcode::DrawIndx2, 1), initiator];
    t.execute_stream(0x0010_0000, &stream);
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);
    assert!(!commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced { .. } | HostCommand::DrawIndexedInstanced { .. }
    )));
}
