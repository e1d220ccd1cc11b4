//! The Xenos register file and the named indices the core reads.

use bitflags::bitflags;

/// Number of 32-bit registers in the guest-visible file.
pub const REGISTER_COUNT: u32 = 0x5000;

// Control registers.
pub const COHER_STATUS_HOST: u32 = 0x0A2B;
pub const WAIT_UNTIL: u32 = 0x05C8;
pub const RBBM_STATUS: u32 = 0x05D0;
pub const CP_INT_ACK: u32 = 0x01DE;

// Scissor / window / viewport.
pub const PA_SC_WINDOW_OFFSET: u32 = 0x2080;
pub const PA_SC_WINDOW_SCISSOR_TL: u32 = 0x2081;
pub const PA_SC_WINDOW_SCISSOR_BR: u32 = 0x2082;
pub const PA_CL_VPORT_XSCALE: u32 = 0x210F;
pub const PA_CL_VPORT_XOFFSET: u32 = 0x2110;
pub const PA_CL_VPORT_YSCALE: u32 = 0x2111;
pub const PA_CL_VPORT_YOFFSET: u32 = 0x2112;
pub const PA_CL_VPORT_ZSCALE: u32 = 0x2113;
pub const PA_CL_VPORT_ZOFFSET: u32 = 0x2114;
pub const PA_CL_VTE_CNTL: u32 = 0x2206;
pub const PA_SU_SC_MODE_CNTL: u32 = 0x2205;
pub const PA_SC_VIZ_QUERY: u32 = 0x2293;

// Vertex grouper / tessellator.
pub const VGT_MAX_VTX_INDX: u32 = 0x2100;
pub const VGT_MIN_VTX_INDX: u32 = 0x2101;
pub const VGT_INDX_OFFSET: u32 = 0x2102;
pub const VGT_MULTI_PRIM_IB_RESET_INDX: u32 = 0x2103;
pub const VGT_CURRENT_BIN_ID_MIN: u32 = 0x2104;
pub const VGT_OUTPUT_PATH_CNTL: u32 = 0x2284;
pub const VGT_DRAW_INITIATOR: u32 = 0x21FC;
pub const VGT_EVENT_INITIATOR: u32 = 0x21F9;
pub const VGT_DMA_BASE: u32 = 0x21FA;
pub const VGT_DMA_SIZE: u32 = 0x21FB;

// Shader sequencer.
pub const SQ_PROGRAM_CNTL: u32 = 0x2180;
pub const SQ_CONTEXT_MISC: u32 = 0x2181;
pub const SQ_INTERPOLATOR_CNTL: u32 = 0x2182;

// Render backend.
pub const RB_SURFACE_INFO: u32 = 0x2000;
pub const RB_COLOR_INFO: u32 = 0x2001;
pub const RB_DEPTH_INFO: u32 = 0x2002;
pub const RB_COLOR1_INFO: u32 = 0x2003;
pub const RB_COLOR2_INFO: u32 = 0x2004;
pub const RB_COLOR3_INFO: u32 = 0x2005;
pub const RB_BLENDCONTROL0: u32 = 0x2201;
pub const RB_DEPTHCONTROL: u32 = 0x2200;
pub const RB_COLORCONTROL: u32 = 0x2202;
pub const RB_MODECONTROL: u32 = 0x2208;
pub const RB_COLOR_MASK: u32 = 0x2104;
pub const RB_BLEND_RED: u32 = 0x2105;
pub const RB_BLEND_GREEN: u32 = 0x2106;
pub const RB_BLEND_BLUE: u32 = 0x2107;
pub const RB_BLEND_ALPHA: u32 = 0x2108;
pub const RB_STENCILREFMASK: u32 = 0x210C;
pub const RB_COPY_CONTROL: u32 = 0x2318;
pub const RB_COPY_DEST_BASE: u32 = 0x2319;
pub const RB_COPY_DEST_PITCH: u32 = 0x231A;
pub const RB_COPY_DEST_INFO: u32 = 0x231B;
pub const RB_DEPTH_CLEAR: u32 = 0x231C;
pub const RB_COLOR_CLEAR: u32 = 0x231D;
pub const RB_COLOR_CLEAR_LO: u32 = 0x231E;

// Shader constants: 512 float4 registers, dword-addressed.
pub const SHADER_CONSTANT_BASE: u32 = 0x4000;
pub const SHADER_CONSTANT_COUNT_DWORDS: u32 = 512 * 4;
pub const SHADER_CONSTANT_END: u32 = SHADER_CONSTANT_BASE + SHADER_CONSTANT_COUNT_DWORDS;

// 32 fetch constants of 6 dwords each.
pub const FETCH_CONSTANT_BASE: u32 = 0x4800;
pub const FETCH_CONSTANT_COUNT_DWORDS: u32 = 32 * 6;
pub const FETCH_CONSTANT_END: u32 = FETCH_CONSTANT_BASE + FETCH_CONSTANT_COUNT_DWORDS;

// 8 dwords of bool constants then 32 loop constants.
pub const BOOL_CONSTANT_BASE: u32 = 0x4900;
pub const BOOL_CONSTANT_COUNT_DWORDS: u32 = 8;
pub const LOOP_CONSTANT_BASE: u32 = 0x4908;
pub const LOOP_CONSTANT_COUNT_DWORDS: u32 = 32;
pub const BOOL_LOOP_CONSTANT_END: u32 = LOOP_CONSTANT_BASE + LOOP_CONSTANT_COUNT_DWORDS;

// Display controller gamma ramp access.
pub const DC_LUT_RW_MODE: u32 = 0x0458;
pub const DC_LUT_RW_INDEX: u32 = 0x0459;
pub const DC_LUT_SEQ_COLOR: u32 = 0x045A;
pub const DC_LUT_PWL_DATA: u32 = 0x045B;
pub const DC_LUT_30_COLOR: u32 = 0x045C;

/// The mirrored guest register file. All values are raw dwords; typed
/// accessors decode on read.
pub struct RegisterFile {
    values: Box<[u32]>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        RegisterFile::new()
    }
}

impl RegisterFile {
    pub fn new() -> RegisterFile {
        RegisterFile {
            values: vec![0u32; REGISTER_COUNT as usize].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn get(&self, index: u32) -> u32 {
        self.values.get(index as usize).copied().unwrap_or(0)
    }

    #[inline]
    pub fn get_f32(&self, index: u32) -> f32 {
        f32::from_bits(self.get(index))
    }

    #[inline]
    pub fn set(&mut self, index: u32, value: u32) {
        if let Some(slot) = self.values.get_mut(index as usize) {
            *slot = value;
        }
    }

    /// Raw dwords of one texture fetch constant slot (0..31).
    pub fn texture_fetch_constant(&self, slot: u32) -> crate::xenos::TextureFetchConstant {
        let base = (FETCH_CONSTANT_BASE + slot * 6) as usize;
        let mut dwords = [0u32; 6];
        for (i, dword) in dwords.iter_mut().enumerate() {
            *dword = self.values.get(base + i).copied().unwrap_or(0);
        }
        crate::xenos::TextureFetchConstant(dwords)
    }

    /// Raw dwords of one vertex fetch constant sub-slot. Vertex fetch
    /// constants are packed three per texture slot, two dwords each.
    pub fn vertex_fetch_constant(&self, slot: u32) -> crate::xenos::VertexFetchConstant {
        let base = (FETCH_CONSTANT_BASE + slot * 2) as usize;
        let lo = self.values.get(base).copied().unwrap_or(0);
        let hi = self.values.get(base + 1).copied().unwrap_or(0);
        crate::xenos::VertexFetchConstant([lo, hi])
    }
}

bitflags! {
    /// RB_DEPTHCONTROL bits the core acts on.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DepthControl: u32 {
        const STENCIL_ENABLE = 1 << 0;
        const Z_ENABLE = 1 << 1;
        const Z_WRITE_ENABLE = 1 << 2;
    }
}

/// Classification used by the bulk register-write fast paths.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegisterClass {
    ShaderAluConstant,
    FetchConstant,
    BoolLoopConstant,
    Other,
}

pub fn classify_register(index: u32) -> RegisterClass {
    if (SHADER_CONSTANT_BASE..SHADER_CONSTANT_END).contains(&index) {
        RegisterClass::ShaderAluConstant
    } else if (FETCH_CONSTANT_BASE..FETCH_CONSTANT_END).contains(&index) {
        RegisterClass::FetchConstant
    } else if (BOOL_CONSTANT_BASE..BOOL_LOOP_CONSTANT_END).contains(&index) {
        RegisterClass::BoolLoopConstant
    } else {
        RegisterClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_splits_constant_ranges() {
        assert_eq!(
            classify_register(SHADER_CONSTANT_BASE),
            RegisterClass::ShaderAluConstant
        );
        assert_eq!(
            classify_register(SHADER_CONSTANT_END - 1),
            RegisterClass::ShaderAluConstant
        );
        assert_eq!(
            classify_register(FETCH_CONSTANT_BASE + 7),
            RegisterClass::FetchConstant
        );
        assert_eq!(
            classify_register(BOOL_CONSTANT_BASE),
            RegisterClass::BoolLoopConstant
        );
        assert_eq!(
            classify_register(LOOP_CONSTANT_BASE + 31),
            RegisterClass::BoolLoopConstant
        );
        assert_eq!(classify_register(RB_SURFACE_INFO), RegisterClass::Other);
    }

    #[test]
    fn out_of_range_registers_read_zero_and_ignore_writes() {
        let mut regs = RegisterFile::new();
        regs.set(REGISTER_COUNT + 5, 0x1234);
        assert_eq!(regs.get(REGISTER_COUNT + 5), 0);
        regs.set(RB_SURFACE_INFO, 0x500);
        assert_eq!(regs.get(RB_SURFACE_INFO), 0x500);
    }
}
