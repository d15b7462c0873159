use bitflags::bitflags;

use crate::format::ProfileKind;

bitflags! {
    /// Execution flags recorded per method.
    ///
    /// `HOT` is special: it is represented by the method's presence in the
    /// method map, never by a bitmap bit. All other flags live in the packed
    /// flag bitmap. Flags above `BITNESS_64` are only valid for boot
    /// profiles.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MethodFlags: u32 {
        /// Executed often enough to be worth compiling.
        const HOT = 1 << 0;
        /// Executed during app startup, as observed by the runtime.
        const STARTUP = 1 << 1;
        /// Executed after app startup, as observed by the runtime.
        const POST_STARTUP = 1 << 2;
        /// Executed by a 32-bit process.
        const BITNESS_32 = 1 << 3;
        /// Executed by a 64-bit process.
        const BITNESS_64 = 1 << 4;
        /// Executed on a latency-sensitive thread.
        const SENSITIVE_THREAD = 1 << 5;
        /// Executed during startup, as observed by the framework.
        const AM_STARTUP = 1 << 6;
        /// Executed after startup, as observed by the framework.
        const AM_POST_STARTUP = 1 << 7;
        /// Executed during system boot.
        const BOOT = 1 << 8;
        /// Executed after the system booted.
        const POST_BOOT = 1 << 9;
        // Relative order in which the method became hot. Successive merges
        // may set several bins for the same method.
        const STARTUP_BIN_0 = 1 << 10;
        const STARTUP_BIN_1 = 1 << 11;
        const STARTUP_BIN_2 = 1 << 12;
        const STARTUP_BIN_3 = 1 << 13;
        const STARTUP_BIN_4 = 1 << 14;
        const STARTUP_BIN_5 = 1 << 15;
    }
}

impl Default for MethodFlags {
    fn default() -> Self {
        MethodFlags::empty()
    }
}

impl MethodFlags {
    /// Flags a store of the given flavor accepts.
    pub fn valid_for(kind: ProfileKind) -> MethodFlags {
        match kind {
            ProfileKind::Regular => MethodFlags::HOT
                | MethodFlags::STARTUP
                | MethodFlags::POST_STARTUP
                | MethodFlags::BITNESS_32
                | MethodFlags::BITNESS_64,
            ProfileKind::Boot => MethodFlags::all(),
        }
    }

    /// Bitmap row of a single non-`HOT` flag. Rows start at the `STARTUP`
    /// flag, so the row of flag bit `1 << k` is `k - 1`.
    pub(crate) fn bitmap_row(self) -> Option<u32> {
        if self == MethodFlags::HOT || self.bits().count_ones() != 1 {
            return None;
        }
        Some(self.bits().trailing_zeros() - 1)
    }

    /// Flag whose bitmap row is `row`, inverse of [`MethodFlags::bitmap_row`].
    pub(crate) fn from_bitmap_row(row: u32) -> MethodFlags {
        MethodFlags::from_bits_truncate(1u32 << (row + 1))
    }

    /// Number of bitmap rows for the given flavor: every valid flag except
    /// `HOT` gets one.
    pub(crate) fn bitmap_row_count(kind: ProfileKind) -> u32 {
        let last = match kind {
            ProfileKind::Regular => MethodFlags::BITNESS_64,
            ProfileKind::Boot => MethodFlags::STARTUP_BIN_5,
        };
        // Row of the last flag, plus one.
        last.bits().trailing_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_rows_skip_hot() {
        assert_eq!(MethodFlags::HOT.bitmap_row(), None);
        assert_eq!(MethodFlags::STARTUP.bitmap_row(), Some(0));
        assert_eq!(MethodFlags::POST_STARTUP.bitmap_row(), Some(1));
        assert_eq!(MethodFlags::STARTUP_BIN_5.bitmap_row(), Some(14));
    }

    #[test]
    fn row_counts_match_flavor_flag_sets() {
        assert_eq!(MethodFlags::bitmap_row_count(ProfileKind::Regular), 4);
        assert_eq!(MethodFlags::bitmap_row_count(ProfileKind::Boot), 15);
    }

    #[test]
    fn from_bitmap_row_inverts_bitmap_row() {
        for row in 0..MethodFlags::bitmap_row_count(ProfileKind::Boot) {
            let flag = MethodFlags::from_bitmap_row(row);
            assert_eq!(flag.bitmap_row(), Some(row));
        }
    }

    #[test]
    fn regular_flags_exclude_boot_only_bits() {
        let regular = MethodFlags::valid_for(ProfileKind::Regular);
        assert!(regular.contains(MethodFlags::BITNESS_64));
        assert!(!regular.contains(MethodFlags::BOOT));
        assert!(MethodFlags::valid_for(ProfileKind::Boot).contains(MethodFlags::BOOT));
    }
}
