//! Memexport handling on the draw path.

mod common;

use common::{setup, StubTranslator};
use xenos_gpu::pm4::{type3_header, Type3Opcode};
use xenos_gpu::regs;
use xenos_hal::HostCommand;

fn draw_stream() -> [u32; 2] {
    let initiator = 4 | (2 << 6) | (3 << 16);
    [type3_header(Type3Opcode::DrawIndx2, 1), initiator]
}

/// Writes the eA descriptor for stream constant `constant`: the export base
/// and element count in dwords.
fn write_stream_descriptor(t: &mut common::TestGpu, constant: u32, address: u32, size_dwords: u32) {
    let base = regs::SHADER_CONSTANT_BASE + constant * 4;
    t.cp.write_register(base, address / 4);
    t.cp.write_register(base + 1, size_dwords);
}

#[test]
fn memexport_target_is_resident_and_marked_gpu_written() {
    let mut t = setup(StubTranslator {
        memexport_streams: vec![(4, 32)],
        ..Default::default()
    });
    t.set_default_draw_state();
    t.load_stub_shaders();
    write_stream_descriptor(&mut t, 4, 0x9000, 64);

    t.execute_stream(0x0010_0000, &draw_stream());
    assert!(t.cp.end_submission(false));

    // The export range is valid without ever uploading CPU data over it
    // again, and the draw itself landed.
    assert!(t.cp.shared_memory().is_range_valid(0x9000, 64 * 4));
    let commands = t.gpu.submission_commands(0);
    assert!(commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced {
            vertex_count_per_instance: 3,
            ..
        }
    )));
}

#[test]
fn memexport_with_narrow_elements_skips_the_draw_once_logged() {
    let mut t = setup(StubTranslator {
        memexport_streams: vec![(4, 16)],
        ..Default::default()
    });
    t.set_default_draw_state();
    t.load_stub_shaders();
    write_stream_descriptor(&mut t, 4, 0x9000, 64);

    // Two draws; both are skipped, the warning fires once.
    t.execute_stream(0x0010_0000, &draw_stream());
    t.execute_stream(0x0010_0100, &draw_stream());
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);
    assert!(!commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced { .. } | HostCommand::DrawIndexedInstanced { .. }
    )));
    assert!(!t.cp.shared_memory().is_range_valid(0x9000, 64 * 4));
}
