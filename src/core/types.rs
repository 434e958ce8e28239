//! Core type aliases and resource addressing

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Stable key of a streamable resource (mesh or texture) owned by the host.
pub type ResourceId = u64;

/// What a generation request produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Mesh,
    Image,
}

/// Address of one generated resource.
///
/// Used both to ask the generation engine for content and to key
/// auxiliary block maps. For images `lod` is the first mip of the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceAddress {
    pub component: u16,
    pub lod: u8,
    pub section: u16,
    pub kind: ContentKind,
}

impl ResourceAddress {
    pub fn mesh(component: u16, lod: u8) -> Self {
        Self { component, lod, section: 0, kind: ContentKind::Mesh }
    }

    pub fn image(component: u16, surface: u16, first_mip: u8) -> Self {
        Self { component, lod: first_mip, section: surface, kind: ContentKind::Image }
    }

    /// Same address at a different LOD (or first mip)
    pub fn with_lod(self, lod: u8) -> Self {
        Self { lod, ..self }
    }
}

/// Kind of auxiliary data a generated mesh can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamedKind {
    RealTimeMorphTarget = 1,
    Clothing = 2,
}

/// Auxiliary resource reference carried by generated meshes.
///
/// Packed into a u64: top byte is the kind, low 32 bits the block id.
/// Id 0 never names a valid block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamedResourceId {
    pub kind: StreamedKind,
    pub id: u32,
}

impl StreamedResourceId {
    const KIND_SHIFT: u32 = 56;

    pub fn new(kind: StreamedKind, id: u32) -> Self {
        Self { kind, id }
    }

    pub fn pack(self) -> u64 {
        ((self.kind as u64) << Self::KIND_SHIFT) | self.id as u64
    }

    /// Unpack a raw id; `None` for unknown kinds or id 0.
    pub fn unpack(raw: u64) -> Option<Self> {
        let kind = match (raw >> Self::KIND_SHIFT) as u8 {
            1 => StreamedKind::RealTimeMorphTarget,
            2 => StreamedKind::Clothing,
            _ => return None,
        };
        let id = (raw & u32::MAX as u64) as u32;
        if id == 0 {
            return None;
        }
        Some(Self { kind, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streamed_id_packing() {
        let id = StreamedResourceId::new(StreamedKind::Clothing, 42);
        let raw = id.pack();
        assert_eq!(raw >> 56, 2);
        assert_eq!(StreamedResourceId::unpack(raw), Some(id));
    }

    #[test]
    fn test_streamed_id_rejects_invalid() {
        assert_eq!(StreamedResourceId::unpack(0), None);
        // Valid kind, id 0
        assert_eq!(StreamedResourceId::unpack(1 << 56), None);
        // Unknown kind
        assert_eq!(StreamedResourceId::unpack((7 << 56) | 3), None);
    }

    #[test]
    fn test_address_with_lod() {
        let addr = ResourceAddress::mesh(3, 2);
        let finer = addr.with_lod(0);
        assert_eq!(finer.component, 3);
        assert_eq!(finer.lod, 0);
        assert_eq!(finer.kind, ContentKind::Mesh);
    }
}
