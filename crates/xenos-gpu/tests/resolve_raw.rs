//! Raw resolve: EDRAM tiles straight into tiled guest memory by compute.

mod common;

use common::{setup, StubTranslator};
use pretty_assertions::assert_eq;
use xenos_gpu::regs;
use xenos_hal::HostCommand;

fn resolve_regs(t: &mut common::TestGpu) {
    // 64-pixel surface, RT0 of guest 8_8_8_8 at EDRAM base 0, 1x AA.
    t.cp.write_register(regs::RB_SURFACE_INFO, 64);
    t.cp.write_register(regs::RB_COLOR_INFO, 0);
    // Window [0,0)-(64,64), no window offset applied.
    t.cp.write_register(regs::PA_SC_WINDOW_SCISSOR_TL, 1 << 31);
    t.cp.write_register(regs::PA_SC_WINDOW_SCISSOR_BR, 64 | (64 << 16));
    // Raw copy of color 0 with no clears.
    t.cp.write_register(regs::RB_COPY_CONTROL, 0);
    // Destination: texture format 8_8_8_8 (the same bits as the source).
    t.cp.write_register(regs::RB_COPY_DEST_INFO, 6 << 7);
    t.cp.write_register(regs::RB_COPY_DEST_BASE, 0x0030_0000);
    t.cp.write_register(regs::RB_COPY_DEST_PITCH, 64);
}

#[test]
fn raw_resolve_dispatches_one_tile_sample_pass() {
    let mut t = setup(StubTranslator::default());
    resolve_regs(&mut t);

    assert!(t.cp.issue_copy());
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);
    // One dispatch over ceil(64/80) x ceil(64/16) groups.
    let dispatches: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            HostCommand::Dispatch {
                group_count_x,
                group_count_y,
                group_count_z,
            } => Some((*group_count_x, *group_count_y, *group_count_z)),
            _ => None,
        })
        .collect();
    assert_eq!(dispatches, vec![(1, 4, 1)]);

    // No draws are involved in the raw path.
    assert!(!commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced { .. } | HostCommand::DrawIndexedInstanced { .. }
    )));

    // The destination range is resident and valid in the mirror.
    assert!(t.cp.shared_memory().is_range_valid(0x0030_0000, 64 * 4 * 64));
    assert!(t.gpu.violations().is_empty());
}

#[test]
fn resolve_with_empty_scissor_is_a_successful_no_op() {
    let mut t = setup(StubTranslator::default());
    resolve_regs(&mut t);
    // Zero-sized window.
    t.cp.write_register(regs::PA_SC_WINDOW_SCISSOR_BR, 0);

    assert!(t.cp.issue_copy());
    assert!(t.cp.end_submission(false));
    let commands = t.gpu.submission_commands(0);
    assert!(!commands
        .iter()
        .any(|c| matches!(c, HostCommand::Dispatch { .. })));
}

#[test]
fn mismatched_destination_format_takes_the_convert_path() {
    let mut t = setup(StubTranslator::default());
    resolve_regs(&mut t);
    // Destination 2_10_10_10 while the source is 8_8_8_8.
    t.cp.write_register(regs::RB_COPY_DEST_INFO, 7 << 7);
    // Converting copy.
    t.cp.write_register(regs::RB_COPY_CONTROL, 1 << 20);

    assert!(t.cp.issue_copy());
    assert!(t.cp.end_submission(false));
    let commands = t.gpu.submission_commands(0);
    // The convert path runs a fullscreen triangle into the resolve target.
    assert!(commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced {
            vertex_count_per_instance: 3,
            ..
        }
    )));
}
