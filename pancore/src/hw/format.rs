/// Pixel and vertex formats understood by the core.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Format {
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    R16G16B16A16Sfloat,
    R32Sfloat,
    R32G32Sfloat,
    R32G32B32Sfloat,
    R32G32B32A32Sfloat,
    D16Unorm,
    D32Sfloat,
    S8Uint,
    D24UnormS8Uint,
    D32SfloatS8Uint,
}

impl Format {
    pub fn block_size(self) -> u32 {
        match self {
            Format::S8Uint => 1,
            Format::D16Unorm => 2,
            Format::R8G8B8A8Unorm
            | Format::B8G8R8A8Unorm
            | Format::R32Sfloat
            | Format::D32Sfloat
            | Format::D24UnormS8Uint => 4,
            Format::R16G16B16A16Sfloat | Format::R32G32Sfloat | Format::D32SfloatS8Uint => 8,
            Format::R32G32B32Sfloat => 12,
            Format::R32G32B32A32Sfloat => 16,
        }
    }

    pub fn has_depth(self) -> bool {
        matches!(
            self,
            Format::D16Unorm | Format::D32Sfloat | Format::D24UnormS8Uint | Format::D32SfloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            Format::S8Uint | Format::D24UnormS8Uint | Format::D32SfloatS8Uint
        )
    }

    pub fn is_depth_and_stencil(self) -> bool {
        self.has_depth() && self.has_stencil()
    }

    /// Hardware format code.
    pub fn hw_code(self) -> u32 {
        match self {
            Format::R8G8B8A8Unorm => 0x01,
            Format::B8G8R8A8Unorm => 0x02,
            Format::R16G16B16A16Sfloat => 0x03,
            Format::R32Sfloat => 0x04,
            Format::R32G32Sfloat => 0x05,
            Format::R32G32B32Sfloat => 0x06,
            Format::R32G32B32A32Sfloat => 0x07,
            Format::D16Unorm => 0x10,
            Format::D32Sfloat => 0x11,
            Format::S8Uint => 0x12,
            Format::D24UnormS8Uint => 0x13,
            Format::D32SfloatS8Uint => 0x14,
        }
    }
}
