//! Attachment update policy: overlap with unsaved EDRAM rows forces the
//! store/reallocate/reload cycle, identical binds reuse everything.

mod common;

use common::{setup, StubTranslator};
use pretty_assertions::assert_eq;
use xenos_gpu::regs;
use xenos_gpu::xenos::PrimitiveType;
use xenos_hal::HostCommand;

fn two_target_state(t: &mut common::TestGpu) {
    t.cp.write_register(regs::RB_MODECONTROL, 4);
    t.cp.write_register(regs::RB_SURFACE_INFO, 1280);
    t.cp.write_register(regs::RB_COLOR_INFO, 0); // RT0 at EDRAM base 0
    t.cp.write_register(regs::RB_COLOR1_INFO, 300); // RT1 at base 300
    t.cp.write_register(regs::RB_DEPTHCONTROL, 0);
    t.set_scissor(1280, 1440);
}

fn set_render_targets_records(commands: &[HostCommand]) -> Vec<usize> {
    commands
        .iter()
        .filter_map(|c| match c {
            HostCommand::SetRenderTargets { colors, .. } => Some(colors.len()),
            _ => None,
        })
        .collect()
}

#[test]
fn disabling_an_overlapping_target_forces_a_full_update() {
    let mut t = setup(StubTranslator::default());
    two_target_state(&mut t);
    t.load_stub_shaders();

    // Draw 1: RT0 and RT1 both written over 90 EDRAM rows.
    t.cp.write_register(regs::RB_COLOR_MASK, 0xFF);
    assert!(t.cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    assert_eq!(t.cp.render_targets().binding_dirty_rows(0), 90);
    assert_eq!(t.cp.render_targets().binding_dirty_rows(1), 90);

    // Draw 2: RT1 disabled. RT0 can now grow into RT1's space, and RT0's
    // new rows overlap RT1's unsaved rows, so everything must be stored,
    // reallocated and reloaded.
    t.cp.write_register(regs::RB_COLOR_MASK, 0x0F);
    assert!(t.cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);
    let binds = set_render_targets_records(&commands);
    // First bind has both colors, the full update rebinds only RT0.
    assert_eq!(binds, vec![2, 1]);

    // The full update stored both dirty targets and reloaded the survivor:
    // 2 loads (draw 1) + 2 stores + 1 load (draw 2).
    let dispatches = commands
        .iter()
        .filter(|c| matches!(c, HostCommand::Dispatch { .. }))
        .count();
    assert_eq!(dispatches, 5);
}

#[test]
fn identical_consecutive_binds_reuse_targets_without_traffic() {
    let mut t = setup(StubTranslator::default());
    two_target_state(&mut t);
    t.load_stub_shaders();
    t.cp.write_register(regs::RB_COLOR_MASK, 0xFF);

    assert!(t.cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    assert!(t.cp.end_submission(false));

    // Same bindings again in a fresh submission: no stores, no loads, no
    // rebind.
    assert!(t.cp.issue_draw(PrimitiveType::TriangleList, 3, None, false));
    assert!(t.cp.end_submission(false));

    let second = t.gpu.submission_commands(1);
    assert!(!second
        .iter()
        .any(|c| matches!(c, HostCommand::Dispatch { .. })));
    assert!(set_render_targets_records(&second).is_empty());
    assert!(second.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced {
            vertex_count_per_instance: 3,
            ..
        }
    )));
}
