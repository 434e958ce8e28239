//! LOD and mip range helpers
//!
//! LOD 0 is the finest level. A resource resident at LOD `n` that wants
//! detail down to LOD `m < n` needs LODs `n-1, n-2, ..., m` generated, in
//! that order, because finer levels of one instance may reuse state built
//! while generating the coarser ones. Mips follow the same numbering.

/// Maximum LOD count a mesh may carry
pub const MAX_MESH_LODS: u8 = 8;

/// Maximum mip count a texture may carry
pub const MAX_MIPS: u8 = 16;

/// LODs missing between the resident first LOD and the requested first LOD
///
/// Returned coarse to fine, which is the generation order.
///
/// # Examples
/// ```
/// use procgen_stream::streaming::lod::lods_to_generate;
///
/// assert_eq!(lods_to_generate(2, 0), vec![1, 0]);
/// assert_eq!(lods_to_generate(3, 2), vec![2]);
/// assert!(lods_to_generate(1, 1).is_empty());
/// assert!(lods_to_generate(0, 2).is_empty()); // already finer than asked
/// ```
pub fn lods_to_generate(resident_first: u8, requested_first: u8) -> Vec<u8> {
    (requested_first..resident_first).rev().collect()
}

/// Extent of a mip level, never below 1
///
/// # Examples
/// ```
/// use procgen_stream::streaming::lod::mip_extent;
///
/// assert_eq!(mip_extent(256, 0), 256);
/// assert_eq!(mip_extent(256, 3), 32);
/// assert_eq!(mip_extent(4, 5), 1);
/// ```
pub fn mip_extent(base: u32, mip: u8) -> u32 {
    base.checked_shr(mip as u32).unwrap_or(0).max(1)
}

/// Byte size of a mip level for an uncompressed format
pub fn mip_byte_size(width: u32, height: u32, bytes_per_pixel: u32, mip: u8) -> usize {
    mip_extent(width, mip) as usize * mip_extent(height, mip) as usize * bytes_per_pixel as usize
}

/// Layout of a texture's full mip chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLayout {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub mip_count: u8,
}

impl MipLayout {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32, mip_count: u8) -> Self {
        Self { width, height, bytes_per_pixel, mip_count: mip_count.min(MAX_MIPS) }
    }

    /// Full chain down to 1x1
    pub fn full_chain(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        let largest = width.max(height).max(1);
        let mip_count = (32 - largest.leading_zeros()) as u8;
        Self::new(width, height, bytes_per_pixel, mip_count)
    }

    pub fn level_size(&self, mip: u8) -> usize {
        mip_byte_size(self.width, self.height, self.bytes_per_pixel, mip)
    }

    pub fn level_extent(&self, mip: u8) -> (u32, u32) {
        (mip_extent(self.width, mip), mip_extent(self.height, mip))
    }
}
