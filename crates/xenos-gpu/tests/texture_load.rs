//! Guest texture decode: DXT1 through the compute load path.

mod common;

use common::{setup, texture_fetch_2d, StubTranslator};
use pretty_assertions::assert_eq;
use xenos_gpu::pm4::{type3_header, Type3Opcode};
use xenos_gpu::xenos::{TextureDimension, TextureFormat};
use xenos_hal::{Format, HostCommand, TextureCopyLocation};

#[test]
fn dxt1_texture_loads_with_one_dispatch_and_one_copy() {
    let mut t = setup(StubTranslator {
        texture_slots: vec![(0, TextureDimension::D2, false)],
        sampler_slots: vec![0],
        ..Default::default()
    });
    t.set_default_draw_state();
    t.load_stub_shaders();

    // 256x256 tiled DXT1 texture at guest page 0x100, no mips.
    t.write_texture_fetch_constant(0, texture_fetch_2d(0x100, 256, 256, TextureFormat::KDxt1, true));

    let initiator = 4 | (2 << 6) | (3 << 16);
    let stream = [type3_header(Type3Opcode::DrawIndx2, 1), initiator];
    t.execute_stream(0x0010_0000, &stream);
    assert!(t.cp.end_submission(false));

    let commands = t.gpu.submission_commands(0);

    // The load dispatch reads guest blocks from page 0x100 of the mirror:
    // its root constants start with the guest byte offset.
    let guest_offset = 0x100u32 << 12;
    let constants_index = commands
        .iter()
        .position(|c| {
            matches!(
                c,
                HostCommand::SetComputeRootConstants { values, .. }
                    if values.first() == Some(&guest_offset)
            )
        })
        .expect("texture load constants must be recorded");
    // 64x64 DXT1 blocks, 4 blocks per thread in X, 8x8 thread groups.
    let dispatch = commands[constants_index..]
        .iter()
        .find_map(|c| match c {
            HostCommand::Dispatch {
                group_count_x,
                group_count_y,
                group_count_z,
            } => Some((*group_count_x, *group_count_y, *group_count_z)),
            _ => None,
        })
        .expect("the load dispatch follows its constants");
    assert_eq!(dispatch, (2, 8, 1));

    // One buffer-to-image copy of the single 256x256 mip, 8-byte 4x4 blocks.
    let footprints: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            HostCommand::CopyTextureRegion {
                dst: TextureCopyLocation::Subresource { subresource, .. },
                src: TextureCopyLocation::Placed { footprint, .. },
            } if footprint.format == Format::Bc1RgbaUnorm => Some((*subresource, *footprint)),
            _ => None,
        })
        .collect();
    assert_eq!(footprints.len(), 1);
    let (subresource, footprint) = footprints[0];
    assert_eq!(subresource, 0);
    assert_eq!((footprint.width, footprint.height, footprint.depth), (256, 256, 1));
    // 64 blocks per row at 8 bytes each.
    assert_eq!(footprint.row_pitch_bytes, 512);

    // The backing pages were made resident and valid.
    assert!(t
        .cp
        .shared_memory()
        .is_range_valid(guest_offset, 64 * 64 * 8));
}

#[test]
fn invalid_fetch_constant_binds_the_null_image() {
    let mut t = setup(StubTranslator {
        texture_slots: vec![(0, TextureDimension::D2, false)],
        ..Default::default()
    });
    t.set_default_draw_state();
    t.load_stub_shaders();
    // Fetch constant slot 0 left all-zero (invalid type).

    let initiator = 4 | (2 << 6) | (3 << 16);
    let stream = [type3_header(Type3Opcode::DrawIndx2, 1), initiator];
    t.execute_stream(0x0010_0000, &stream);
    assert!(t.cp.end_submission(false));

    // The draw still lands; no texture load dispatch happened for the slot.
    let commands = t.gpu.submission_commands(0);
    assert!(commands.iter().any(|c| matches!(
        c,
        HostCommand::DrawInstanced {
            vertex_count_per_instance: 3,
            ..
        }
    )));
    assert!(!commands.iter().any(|c| matches!(
        c,
        HostCommand::CopyTextureRegion {
            src: TextureCopyLocation::Placed { footprint, .. },
            ..
        } if footprint.format == Format::Bc1RgbaUnorm
    )));
}
