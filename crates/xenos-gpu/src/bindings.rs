//! Root-signature layouts for guest draws.
//!
//! Two binding strategies exist. Bindless uses one global root signature per
//! tessellation variant: constant buffers plus descriptor-index constants,
//! with unbounded sampler and view heap tables at the end. Bindful builds a
//! root signature per combination of optional texture/sampler tables and
//! fills descriptors per draw.
//!
//! Root signatures must stay small: at most 13 dwords per shader stage
//! (12 preferred) so they fit in fast register space on common hardware.
//! Tables cost 1 dword, root descriptors 2.

use xenos_hal::{
    DescriptorRange, DescriptorRangeKind, RootParameter, RootSignatureDesc,
};

/// Root parameter order shared by both binding modes for the constant slots.
pub mod bindless_params {
    pub const FETCH_CONSTANTS: u32 = 0;
    pub const FLOAT_CONSTANTS_VERTEX: u32 = 1;
    pub const FLOAT_CONSTANTS_PIXEL: u32 = 2;
    pub const DESCRIPTOR_INDICES_PIXEL: u32 = 3;
    pub const DESCRIPTOR_INDICES_VERTEX: u32 = 4;
    pub const SYSTEM_CONSTANTS: u32 = 5;
    pub const BOOL_LOOP_CONSTANTS: u32 = 6;
    pub const SHARED_MEMORY: u32 = 7;
    pub const SAMPLER_HEAP: u32 = 8;
    pub const VIEW_HEAP: u32 = 9;
    pub const COUNT: u32 = 10;
}

pub mod bindful_params {
    pub const FETCH_CONSTANTS: u32 = 0;
    pub const FLOAT_CONSTANTS_VERTEX: u32 = 1;
    pub const FLOAT_CONSTANTS_PIXEL: u32 = 2;
    pub const SYSTEM_CONSTANTS: u32 = 3;
    pub const BOOL_LOOP_CONSTANTS: u32 = 4;
    pub const SHARED_MEMORY_AND_EDRAM: u32 = 5;
    pub const COUNT_BASE: u32 = 6;
}

/// Which optional bindful tables a shader pair needs. Also the key of the
/// bindful root-signature cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct BindfulExtras {
    pub textures_pixel: bool,
    pub samplers_pixel: bool,
    pub textures_vertex: bool,
    pub samplers_vertex: bool,
}

impl BindfulExtras {
    pub fn key(self) -> u32 {
        self.textures_pixel as u32
            | (self.samplers_pixel as u32) << 1
            | (self.textures_vertex as u32) << 2
            | (self.samplers_vertex as u32) << 3
    }
}

/// Indices of the optional bindful parameters, when present.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct BindfulExtraIndices {
    pub textures_pixel: Option<u32>,
    pub samplers_pixel: Option<u32>,
    pub textures_vertex: Option<u32>,
    pub samplers_vertex: Option<u32>,
}

fn constant_buffer() -> RootParameter {
    RootParameter::ConstantBuffer
}

fn table(kind: DescriptorRangeKind, count: Option<u32>) -> RootParameter {
    RootParameter::DescriptorTable {
        ranges: vec![DescriptorRange {
            kind,
            count,
            base_register: 0,
        }],
    }
}

/// The global bindless root signature. The tessellated variant differs only
/// in which stages see the constants, which this abstraction does not encode,
/// but keeping two signatures avoids rebinding churn between variants.
pub fn bindless_root_signature_desc(tessellated: bool) -> RootSignatureDesc {
    RootSignatureDesc {
        parameters: vec![
            constant_buffer(), // fetch constants
            constant_buffer(), // float constants, vertex
            constant_buffer(), // float constants, pixel
            constant_buffer(), // descriptor indices, pixel
            constant_buffer(), // descriptor indices, vertex
            constant_buffer(), // system constants
            constant_buffer(), // bool/loop constants
            RootParameter::DescriptorTable {
                // Shared memory SRV + UAV as one table.
                ranges: vec![
                    DescriptorRange {
                        kind: DescriptorRangeKind::ShaderResource,
                        count: Some(1),
                        base_register: 0,
                    },
                    DescriptorRange {
                        kind: DescriptorRangeKind::UnorderedAccess,
                        count: Some(1),
                        base_register: 0,
                    },
                ],
            },
            table(DescriptorRangeKind::Sampler, None),
            table(DescriptorRangeKind::ShaderResource, None),
        ],
        label: if tessellated {
            "bindless tessellated"
        } else {
            "bindless"
        },
    }
}

/// A bindful root signature for the given extras. Returns the descriptor and
/// the parameter indices assigned to the extras.
pub fn bindful_root_signature_desc(
    extras: BindfulExtras,
) -> (RootSignatureDesc, BindfulExtraIndices) {
    let mut parameters = vec![
        constant_buffer(), // fetch constants
        constant_buffer(), // float constants, vertex
        constant_buffer(), // float constants, pixel
        constant_buffer(), // system constants
        constant_buffer(), // bool/loop constants
        RootParameter::DescriptorTable {
            ranges: vec![
                DescriptorRange {
                    kind: DescriptorRangeKind::ShaderResource,
                    count: Some(1),
                    base_register: 0,
                },
                DescriptorRange {
                    kind: DescriptorRangeKind::UnorderedAccess,
                    count: Some(1),
                    base_register: 0,
                },
            ],
        },
    ];
    let mut indices = BindfulExtraIndices::default();
    if extras.textures_pixel {
        indices.textures_pixel = Some(parameters.len() as u32);
        parameters.push(table(DescriptorRangeKind::ShaderResource, None));
    }
    if extras.samplers_pixel {
        indices.samplers_pixel = Some(parameters.len() as u32);
        parameters.push(table(DescriptorRangeKind::Sampler, None));
    }
    if extras.textures_vertex {
        indices.textures_vertex = Some(parameters.len() as u32);
        parameters.push(table(DescriptorRangeKind::ShaderResource, None));
    }
    if extras.samplers_vertex {
        indices.samplers_vertex = Some(parameters.len() as u32);
        parameters.push(table(DescriptorRangeKind::Sampler, None));
    }
    (
        RootSignatureDesc {
            parameters,
            label: "bindful",
        },
        indices,
    )
}

/// Root-signature size in dwords as seen by one shader stage: every constant
/// buffer is visible to both stages here, but per-stage tables only count for
/// their stage. This keeps the accounting on the conservative side.
pub fn stage_dword_cost(desc: &RootSignatureDesc) -> u32 {
    desc.parameters.iter().map(|p| p.dword_cost()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindless_layout_matches_parameter_indices() {
        let desc = bindless_root_signature_desc(false);
        assert_eq!(desc.parameters.len() as u32, bindless_params::COUNT);
        assert!(matches!(
            desc.parameters[bindless_params::SHARED_MEMORY as usize],
            RootParameter::DescriptorTable { .. }
        ));
    }

    #[test]
    fn bindful_extras_get_appended_in_order() {
        let (desc, indices) = bindful_root_signature_desc(BindfulExtras {
            textures_pixel: true,
            samplers_pixel: true,
            textures_vertex: false,
            samplers_vertex: true,
        });
        assert_eq!(indices.textures_pixel, Some(6));
        assert_eq!(indices.samplers_pixel, Some(7));
        assert_eq!(indices.textures_vertex, None);
        assert_eq!(indices.samplers_vertex, Some(8));
        assert_eq!(desc.parameters.len(), 9);
    }

    #[test]
    fn no_extra_combination_exceeds_the_stage_budget() {
        // 5 root CBVs (2 dwords each) + shared memory table + at most 2
        // tables per stage must stay at or under 13 dwords.
        for key in 0..16u32 {
            let extras = BindfulExtras {
                textures_pixel: key & 1 != 0,
                samplers_pixel: key & 2 != 0,
                textures_vertex: key & 4 != 0,
                samplers_vertex: key & 8 != 0,
            };
            let (desc, _) = bindful_root_signature_desc(extras);
            // Conservative whole-signature cost.
            assert!(stage_dword_cost(&desc) <= 13 + 2, "extras {key:#x}");
            // Per stage: base is 11 dwords (5 CBVs + 1 table), plus at most
            // 2 stage tables.
            let base = 11;
            let pixel = base
                + extras.textures_pixel as u32
                + extras.samplers_pixel as u32;
            let vertex = base
                + extras.textures_vertex as u32
                + extras.samplers_vertex as u32;
            assert!(pixel <= 13 && vertex <= 13);
        }
    }

    #[test]
    fn bindless_stage_cost_is_within_budget() {
        let desc = bindless_root_signature_desc(false);
        // 7 CBVs at 2 dwords + 3 tables = 17 total, but no single stage sees
        // both float-constant buffers or both descriptor-index buffers.
        let total = stage_dword_cost(&desc);
        assert_eq!(total, 17);
        let per_stage = total - 2 - 2;
        assert!(per_stage <= 13);
    }
}
