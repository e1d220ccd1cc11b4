//! Guest-side (Xenos) enums, fetch-constant layouts and endian helpers.

/// Endian swap mode carried in fetch constants and index buffer info.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Endian {
    None = 0,
    Swap8In16 = 1,
    Swap8In32 = 2,
    Swap16In32 = 3,
}

impl Endian {
    pub fn from_bits(bits: u32) -> Endian {
        match bits & 0b11 {
            0 => Endian::None,
            1 => Endian::Swap8In16,
            2 => Endian::Swap8In32,
            _ => Endian::Swap16In32,
        }
    }
}

/// Applies a Xenos endian swap to one dword.
pub fn gpu_swap(value: u32, endian: Endian) -> u32 {
    match endian {
        Endian::None => value,
        Endian::Swap8In16 => ((value & 0x00FF00FF) << 8) | ((value & 0xFF00FF00) >> 8),
        Endian::Swap8In32 => value.swap_bytes(),
        Endian::Swap16In32 => value.rotate_left(16),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PrimitiveType {
    None = 0,
    PointList = 1,
    LineList = 2,
    LineStrip = 3,
    TriangleList = 4,
    TriangleFan = 5,
    TriangleStrip = 6,
    TriangleWithWFlags = 7,
    Rectangle = 8,
    LineLoop = 12,
    QuadList = 13,
    QuadStrip = 14,
    Polygon = 15,
}

impl PrimitiveType {
    pub fn from_u32(value: u32) -> Option<PrimitiveType> {
        Some(match value {
            0 => PrimitiveType::None,
            1 => PrimitiveType::PointList,
            2 => PrimitiveType::LineList,
            3 => PrimitiveType::LineStrip,
            4 => PrimitiveType::TriangleList,
            5 => PrimitiveType::TriangleFan,
            6 => PrimitiveType::TriangleStrip,
            7 => PrimitiveType::TriangleWithWFlags,
            8 => PrimitiveType::Rectangle,
            12 => PrimitiveType::LineLoop,
            13 => PrimitiveType::QuadList,
            14 => PrimitiveType::QuadStrip,
            15 => PrimitiveType::Polygon,
            _ => return None,
        })
    }

    /// Minimum vertex count for one complete primitive.
    pub fn minimum_vertex_count(self) -> u32 {
        match self {
            PrimitiveType::PointList => 1,
            PrimitiveType::LineList | PrimitiveType::LineStrip | PrimitiveType::LineLoop => 2,
            PrimitiveType::QuadList | PrimitiveType::QuadStrip => 4,
            _ => 3,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IndexFormat {
    Int16 = 0,
    Int32 = 1,
}

impl IndexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::Int16 => 2,
            IndexFormat::Int32 => 4,
        }
    }

    /// The reset index the host expects for this format.
    pub fn host_reset_index(self) -> u32 {
        match self {
            IndexFormat::Int16 => 0xFFFF,
            IndexFormat::Int32 => 0xFFFF_FFFF,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum MsaaSamples {
    X1 = 0,
    X2 = 1,
    X4 = 2,
}

impl MsaaSamples {
    pub fn from_bits(bits: u32) -> MsaaSamples {
        match bits & 0b11 {
            1 => MsaaSamples::X2,
            2 => MsaaSamples::X4,
            _ => MsaaSamples::X1,
        }
    }

    /// Sample grid along X: 2 for 4x, 1 otherwise.
    pub fn samples_x(self) -> u32 {
        if self >= MsaaSamples::X4 {
            2
        } else {
            1
        }
    }

    /// Sample grid along Y: 2 for 2x and 4x.
    pub fn samples_y(self) -> u32 {
        if self >= MsaaSamples::X2 {
            2
        } else {
            1
        }
    }
}

/// Guest color render-target formats (RB_COLOR_INFO bits 16..19).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ColorRenderTargetFormat {
    K8888 = 0,
    K8888Gamma = 1,
    K2101010 = 2,
    K2101010Float = 3,
    K1616 = 4,
    K16161616 = 5,
    K1616Float = 6,
    K16161616Float = 7,
    K2101010As101010 = 10,
    K2101010FloatAs16161616 = 12,
    K32Float = 14,
    K3232Float = 15,
}

impl ColorRenderTargetFormat {
    pub fn from_bits(bits: u32) -> Option<ColorRenderTargetFormat> {
        Some(match bits & 0xF {
            0 => ColorRenderTargetFormat::K8888,
            1 => ColorRenderTargetFormat::K8888Gamma,
            2 => ColorRenderTargetFormat::K2101010,
            3 => ColorRenderTargetFormat::K2101010Float,
            4 => ColorRenderTargetFormat::K1616,
            5 => ColorRenderTargetFormat::K16161616,
            6 => ColorRenderTargetFormat::K1616Float,
            7 => ColorRenderTargetFormat::K16161616Float,
            10 => ColorRenderTargetFormat::K2101010As101010,
            12 => ColorRenderTargetFormat::K2101010FloatAs16161616,
            14 => ColorRenderTargetFormat::K32Float,
            15 => ColorRenderTargetFormat::K3232Float,
            _ => return None,
        })
    }

    /// Collapses `AS_` aliases onto the base storage format.
    pub fn base(self) -> ColorRenderTargetFormat {
        match self {
            ColorRenderTargetFormat::K2101010As101010 => ColorRenderTargetFormat::K2101010,
            ColorRenderTargetFormat::K2101010FloatAs16161616 => {
                ColorRenderTargetFormat::K2101010Float
            }
            other => other,
        }
    }

    pub fn is_64bpp(self) -> bool {
        matches!(
            self.base(),
            ColorRenderTargetFormat::K16161616
                | ColorRenderTargetFormat::K16161616Float
                | ColorRenderTargetFormat::K3232Float
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum DepthRenderTargetFormat {
    /// 24-bit unorm depth, 8-bit stencil.
    D24S8 = 0,
    /// 20e4 float depth, 8-bit stencil.
    D24FS8 = 1,
}

impl DepthRenderTargetFormat {
    pub fn from_bits(bits: u32) -> DepthRenderTargetFormat {
        if bits & 1 != 0 {
            DepthRenderTargetFormat::D24FS8
        } else {
            DepthRenderTargetFormat::D24S8
        }
    }
}

/// Guest texture formats, 6 bits in the fetch constant.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u32)]
#[rustfmt::skip]
pub enum TextureFormat {
    K1Reverse = 0, K1 = 1, K8 = 2, K1555 = 3, K565 = 4, K655 = 5,
    K8888 = 6, K2101010 = 7, K8A = 8, K8B = 9, K88 = 10,
    KCrY1CbY0Rep = 11, KY1CrY0CbRep = 12, K1616Edram = 13, K8888A = 14,
    K4444 = 15, K101111 = 16, K111110 = 17, KDxt1 = 18, KDxt23 = 19,
    KDxt45 = 20, K16161616Edram = 21, K248 = 22, K248Float = 23,
    K16 = 24, K1616 = 25, K16161616 = 26, K16Expand = 27, K1616Expand = 28,
    K16161616Expand = 29, K16Float = 30, K1616Float = 31, K16161616Float = 32,
    K32 = 33, K3232 = 34, K32323232 = 35, K32Float = 36, K3232Float = 37,
    K32323232Float = 38, K32As8 = 39, K32As88 = 40, K16Mpeg = 41,
    K1616Mpeg = 42, K8Interlaced = 43, K32As8Interlaced = 44,
    K32As88Interlaced = 45, K16Interlaced = 46, K16MpegInterlaced = 47,
    K1616MpegInterlaced = 48, KDxn = 49, K8888As16161616 = 50,
    KDxt1As16161616 = 51, KDxt23As16161616 = 52, KDxt45As16161616 = 53,
    K2101010As16161616 = 54, K101111As16161616 = 55, K111110As16161616 = 56,
    K323232Float = 57, KDxt3a = 58, KDxt5a = 59, KCtx1 = 60,
    KDxt3aAs1111 = 61, K8888GammaEdram = 62, K2101010FloatEdram = 63,
}

impl TextureFormat {
    #[rustfmt::skip]
    pub fn from_bits(bits: u32) -> TextureFormat {
        use TextureFormat as F;
        match bits & 0x3F {
            0 => F::K1Reverse, 1 => F::K1, 2 => F::K8, 3 => F::K1555,
            4 => F::K565, 5 => F::K655, 6 => F::K8888, 7 => F::K2101010,
            8 => F::K8A, 9 => F::K8B, 10 => F::K88, 11 => F::KCrY1CbY0Rep,
            12 => F::KY1CrY0CbRep, 13 => F::K1616Edram, 14 => F::K8888A,
            15 => F::K4444, 16 => F::K101111, 17 => F::K111110, 18 => F::KDxt1,
            19 => F::KDxt23, 20 => F::KDxt45, 21 => F::K16161616Edram,
            22 => F::K248, 23 => F::K248Float, 24 => F::K16, 25 => F::K1616,
            26 => F::K16161616, 27 => F::K16Expand, 28 => F::K1616Expand,
            29 => F::K16161616Expand, 30 => F::K16Float, 31 => F::K1616Float,
            32 => F::K16161616Float, 33 => F::K32, 34 => F::K3232,
            35 => F::K32323232, 36 => F::K32Float, 37 => F::K3232Float,
            38 => F::K32323232Float, 39 => F::K32As8, 40 => F::K32As88,
            41 => F::K16Mpeg, 42 => F::K1616Mpeg, 43 => F::K8Interlaced,
            44 => F::K32As8Interlaced, 45 => F::K32As88Interlaced,
            46 => F::K16Interlaced, 47 => F::K16MpegInterlaced,
            48 => F::K1616MpegInterlaced, 49 => F::KDxn,
            50 => F::K8888As16161616, 51 => F::KDxt1As16161616,
            52 => F::KDxt23As16161616, 53 => F::KDxt45As16161616,
            54 => F::K2101010As16161616, 55 => F::K101111As16161616,
            56 => F::K111110As16161616, 57 => F::K323232Float,
            58 => F::KDxt3a, 59 => F::KDxt5a, 60 => F::KCtx1,
            61 => F::KDxt3aAs1111, 62 => F::K8888GammaEdram,
            _ => F::K2101010FloatEdram,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TextureDimension {
    D1 = 0,
    D2 = 1,
    D3 = 2,
    Cube = 3,
}

impl TextureDimension {
    pub fn from_bits(bits: u32) -> TextureDimension {
        match bits & 0b11 {
            0 => TextureDimension::D1,
            1 => TextureDimension::D2,
            2 => TextureDimension::D3,
            _ => TextureDimension::Cube,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ClampMode {
    Repeat = 0,
    MirroredRepeat = 1,
    ClampToEdge = 2,
    MirrorClampToEdge = 3,
    ClampToHalfway = 4,
    MirrorClampToHalfway = 5,
    ClampToBorder = 6,
    MirrorClampToBorder = 7,
}

impl ClampMode {
    pub fn from_bits(bits: u32) -> ClampMode {
        match bits & 0b111 {
            0 => ClampMode::Repeat,
            1 => ClampMode::MirroredRepeat,
            2 => ClampMode::ClampToEdge,
            3 => ClampMode::MirrorClampToEdge,
            4 => ClampMode::ClampToHalfway,
            5 => ClampMode::MirrorClampToHalfway,
            6 => ClampMode::ClampToBorder,
            _ => ClampMode::MirrorClampToBorder,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TextureFilter {
    Point = 0,
    Linear = 1,
    /// Use the fetch instruction default.
    UseFetchConst = 3,
}

impl TextureFilter {
    pub fn from_bits(bits: u32) -> TextureFilter {
        match bits & 0b11 {
            0 => TextureFilter::Point,
            1 => TextureFilter::Linear,
            _ => TextureFilter::UseFetchConst,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum AnisoFilter {
    Disabled = 0,
    Max1To1 = 1,
    Max2To1 = 2,
    Max4To1 = 3,
    Max8To1 = 4,
    Max16To1 = 5,
    UseFetchConst = 7,
}

impl AnisoFilter {
    pub fn from_bits(bits: u32) -> AnisoFilter {
        match bits & 0b111 {
            0 => AnisoFilter::Disabled,
            1 => AnisoFilter::Max1To1,
            2 => AnisoFilter::Max2To1,
            3 => AnisoFilter::Max4To1,
            4 => AnisoFilter::Max8To1,
            5 => AnisoFilter::Max16To1,
            _ => AnisoFilter::UseFetchConst,
        }
    }

    pub fn max_anisotropy(self) -> u32 {
        match self {
            AnisoFilter::Disabled | AnisoFilter::Max1To1 | AnisoFilter::UseFetchConst => 1,
            AnisoFilter::Max2To1 => 2,
            AnisoFilter::Max4To1 => 4,
            AnisoFilter::Max8To1 => 8,
            AnisoFilter::Max16To1 => 16,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BorderColor {
    AgbrBlack = 0,
    AgbrWhite = 1,
    AcbycrBlack = 2,
    AcbcryBlack = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TextureSign {
    Unsigned = 0,
    Signed = 1,
    UnsignedBiased = 2,
    Gamma = 3,
}

impl TextureSign {
    pub fn from_bits(bits: u32) -> TextureSign {
        match bits & 0b11 {
            0 => TextureSign::Unsigned,
            1 => TextureSign::Signed,
            2 => TextureSign::UnsignedBiased,
            _ => TextureSign::Gamma,
        }
    }
}

/// Fetch constant slot kind tag (bits 0..1 of the first dword).
pub const FETCH_CONSTANT_TYPE_INVALID: u32 = 0;
pub const FETCH_CONSTANT_TYPE_TEXTURE: u32 = 1;
pub const FETCH_CONSTANT_TYPE_VERTEX: u32 = 2;

/// A texture fetch constant: six dwords describing a guest texture.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TextureFetchConstant(pub [u32; 6]);

impl TextureFetchConstant {
    pub fn fetch_type(&self) -> u32 {
        self.0[0] & 0b11
    }

    pub fn is_texture(&self) -> bool {
        self.fetch_type() == FETCH_CONSTANT_TYPE_TEXTURE
    }

    pub fn sign_x(&self) -> TextureSign {
        TextureSign::from_bits(self.0[0] >> 2)
    }
    pub fn sign_y(&self) -> TextureSign {
        TextureSign::from_bits(self.0[0] >> 4)
    }
    pub fn sign_z(&self) -> TextureSign {
        TextureSign::from_bits(self.0[0] >> 6)
    }
    pub fn sign_w(&self) -> TextureSign {
        TextureSign::from_bits(self.0[0] >> 8)
    }

    /// True if any component requests the signed host view.
    pub fn any_sign_signed(&self) -> bool {
        [self.sign_x(), self.sign_y(), self.sign_z(), self.sign_w()]
            .iter()
            .any(|s| *s == TextureSign::Signed)
    }

    pub fn clamp_x(&self) -> ClampMode {
        ClampMode::from_bits(self.0[0] >> 10)
    }
    pub fn clamp_y(&self) -> ClampMode {
        ClampMode::from_bits(self.0[0] >> 13)
    }
    pub fn clamp_z(&self) -> ClampMode {
        ClampMode::from_bits(self.0[0] >> 16)
    }

    /// Row pitch in 32-texel groups.
    pub fn pitch_texels(&self) -> u32 {
        ((self.0[0] >> 22) & 0x1FF) << 5
    }

    pub fn tiled(&self) -> bool {
        self.0[0] & (1 << 31) != 0
    }

    pub fn format(&self) -> TextureFormat {
        TextureFormat::from_bits(self.0[1] & 0x3F)
    }

    pub fn endianness(&self) -> Endian {
        Endian::from_bits(self.0[1] >> 6)
    }

    /// Base mip (level 0) address in 4 KiB pages.
    pub fn base_page(&self) -> u32 {
        self.0[1] >> 12
    }

    pub fn dimension(&self) -> TextureDimension {
        TextureDimension::from_bits(self.0[5] >> 9)
    }

    /// Width/height/depth in texels, decoded per dimension.
    pub fn size(&self) -> (u32, u32, u32) {
        let size = self.0[2];
        match self.dimension() {
            TextureDimension::D1 => ((size & 0xFF_FFFF) + 1, 1, 1),
            TextureDimension::D2 | TextureDimension::Cube => {
                ((size & 0x1FFF) + 1, ((size >> 13) & 0x1FFF) + 1, 1)
            }
            TextureDimension::D3 => (
                (size & 0x7FF) + 1,
                ((size >> 11) & 0x7FF) + 1,
                ((size >> 22) & 0x3FF) + 1,
            ),
        }
    }

    /// Component swizzle, 3 bits per component (R, G, B, A).
    pub fn swizzle(&self) -> u32 {
        self.0[3] & 0xFFF
    }

    pub fn mag_filter(&self) -> TextureFilter {
        TextureFilter::from_bits(self.0[3] >> 19)
    }
    pub fn min_filter(&self) -> TextureFilter {
        TextureFilter::from_bits(self.0[3] >> 21)
    }
    pub fn mip_filter(&self) -> TextureFilter {
        TextureFilter::from_bits(self.0[3] >> 23)
    }
    pub fn aniso_filter(&self) -> AnisoFilter {
        AnisoFilter::from_bits(self.0[3] >> 25)
    }

    /// Mip chain address in 4 KiB pages.
    pub fn mip_page(&self) -> u32 {
        self.0[4] >> 12
    }

    pub fn mip_min_level(&self) -> u32 {
        (self.0[4] >> 6) & 0xF
    }
    pub fn mip_max_level(&self) -> u32 {
        (self.0[4] >> 2) & 0xF
    }

    pub fn border_color(&self) -> BorderColor {
        match self.0[5] & 0b11 {
            0 => BorderColor::AgbrBlack,
            1 => BorderColor::AgbrWhite,
            2 => BorderColor::AcbycrBlack,
            _ => BorderColor::AcbcryBlack,
        }
    }

    pub fn packed_mips(&self) -> bool {
        self.0[5] & (1 << 11) != 0
    }
}

/// A vertex fetch constant: two dwords describing a vertex stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct VertexFetchConstant(pub [u32; 2]);

impl VertexFetchConstant {
    pub fn fetch_type(&self) -> u32 {
        self.0[0] & 0b11
    }

    pub fn is_vertex(&self) -> bool {
        self.fetch_type() == FETCH_CONSTANT_TYPE_VERTEX
    }

    /// Byte address of the stream (dword-aligned).
    pub fn address(&self) -> u32 {
        self.0[0] & !0b11
    }

    pub fn endianness(&self) -> Endian {
        Endian::from_bits(self.0[1])
    }

    /// Stream length in dwords.
    pub fn size_dwords(&self) -> u32 {
        (self.0[1] >> 2) & 0xFF_FFFF
    }
}

/// EDRAM geometry. One tile holds 80x16 samples of 32bpp data.
pub const EDRAM_TILE_WIDTH_SAMPLES: u32 = 80;
pub const EDRAM_TILE_HEIGHT_SAMPLES: u32 = 16;
pub const EDRAM_TILE_SIZE_BYTES: u32 =
    EDRAM_TILE_WIDTH_SAMPLES * EDRAM_TILE_HEIGHT_SAMPLES * 4;
pub const EDRAM_TILE_COUNT: u32 = 2048;
pub const EDRAM_SIZE_BYTES: u32 = EDRAM_TILE_COUNT * EDRAM_TILE_SIZE_BYTES;

/// Largest guest surface pitch in pixels.
pub const MAX_SURFACE_PITCH: u32 = 2560;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_swap_modes() {
        assert_eq!(gpu_swap(0x1122_3344, Endian::None), 0x1122_3344);
        assert_eq!(gpu_swap(0x1122_3344, Endian::Swap8In16), 0x2211_4433);
        assert_eq!(gpu_swap(0x1122_3344, Endian::Swap8In32), 0x4433_2211);
        assert_eq!(gpu_swap(0x1122_3344, Endian::Swap16In32), 0x3344_1122);
    }

    #[test]
    fn texture_format_round_trips_all_six_bit_values() {
        for bits in 0..64u32 {
            assert_eq!(TextureFormat::from_bits(bits) as u32, bits);
        }
    }

    #[test]
    fn color_format_base_collapses_aliases() {
        assert_eq!(
            ColorRenderTargetFormat::K2101010As101010.base(),
            ColorRenderTargetFormat::K2101010
        );
        assert_eq!(
            ColorRenderTargetFormat::K2101010FloatAs16161616.base(),
            ColorRenderTargetFormat::K2101010Float
        );
        assert!(ColorRenderTargetFormat::K16161616Float.is_64bpp());
        assert!(!ColorRenderTargetFormat::K8888.is_64bpp());
    }

    #[test]
    fn texture_fetch_size_decodes_per_dimension() {
        let mut fetch = TextureFetchConstant::default();
        // 2D 256x256: dimension bits in dword 5, size in dword 2.
        fetch.0[5] = 1 << 9;
        fetch.0[2] = 255 | (255 << 13);
        assert_eq!(fetch.size(), (256, 256, 1));

        fetch.0[5] = 2 << 9;
        fetch.0[2] = 31 | (63 << 11) | (7 << 22);
        assert_eq!(fetch.size(), (32, 64, 8));
    }
}
