/// First four bytes of every serialized profile.
pub const PROFILE_MAGIC: [u8; 4] = *b"pro\0";

/// Version tag for per-app (regular) profiles.
pub const VERSION_REGULAR: [u8; 4] = *b"010\0";

/// Version tag for system-wide (boot) profiles.
pub const VERSION_BOOT: [u8; 4] = *b"009\0";

/// Name of the profile entry inside an archive container.
pub const ARCHIVE_PROFILE_ENTRY: &str = "primary.prof";

/// Index of a module within one profile store.
///
/// In memory both flavors use the full `u16` range; serialization narrows the
/// index to `u8` for regular profiles, which record few modules and benefit
/// from the smaller encoding.
pub type ProfileIndex = u16;

/// Profile flavor. Fixed at store construction; boot profiles aggregate data
/// from many apps and therefore use wider indices and a larger flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileKind {
    Regular,
    Boot,
}

impl ProfileKind {
    pub fn version_tag(self) -> [u8; 4] {
        match self {
            ProfileKind::Regular => VERSION_REGULAR,
            ProfileKind::Boot => VERSION_BOOT,
        }
    }

    pub fn from_version_tag(tag: &[u8; 4]) -> Option<Self> {
        match *tag {
            VERSION_REGULAR => Some(ProfileKind::Regular),
            VERSION_BOOT => Some(ProfileKind::Boot),
            _ => None,
        }
    }

    pub fn is_boot(self) -> bool {
        matches!(self, ProfileKind::Boot)
    }

    /// Serialized width of a profile index (and of the module count in the
    /// file header).
    pub(crate) fn index_width(self) -> usize {
        match self {
            ProfileKind::Regular => 1,
            ProfileKind::Boot => 2,
        }
    }

    /// Maximum number of modules a store of this flavor may record.
    pub(crate) fn max_module_count(self) -> usize {
        match self {
            ProfileKind::Regular => u8::MAX as usize,
            ProfileKind::Boot => u16::MAX as usize,
        }
    }
}
