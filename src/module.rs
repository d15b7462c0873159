use std::collections::{BTreeMap, BTreeSet};

use crate::bitmap::MethodBitmap;
use crate::flags::MethodFlags;
use crate::format::{ProfileIndex, ProfileKind};
use crate::inline_cache::{ClassRef, InlineCacheMap};

/// Profile data of one (module location, checksum, annotation) group.
///
/// The profile index is the module's position in the owning store and is
/// stable for the lifetime of the store; inline-cache class references name
/// modules by this index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleData {
    pub(crate) profile_key: String,
    pub(crate) profile_index: ProfileIndex,
    pub(crate) checksum: u32,
    pub(crate) num_method_ids: u32,
    pub(crate) method_map: BTreeMap<u16, InlineCacheMap>,
    pub(crate) class_set: BTreeSet<u16>,
    pub(crate) bitmap: MethodBitmap,
    pub(crate) kind: ProfileKind,
}

impl ModuleData {
    pub(crate) fn new(
        profile_key: String,
        profile_index: ProfileIndex,
        checksum: u32,
        num_method_ids: u32,
        kind: ProfileKind,
    ) -> Self {
        ModuleData {
            profile_key,
            profile_index,
            checksum,
            num_method_ids,
            method_map: BTreeMap::new(),
            class_set: BTreeSet::new(),
            bitmap: MethodBitmap::new(kind, num_method_ids),
            kind,
        }
    }

    pub fn profile_key(&self) -> &str {
        &self.profile_key
    }

    pub fn profile_index(&self) -> ProfileIndex {
        self.profile_index
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn num_method_ids(&self) -> u32 {
        self.num_method_ids
    }

    pub fn is_boot(&self) -> bool {
        self.kind.is_boot()
    }

    /// Methods with recorded inline-cache data. Presence in this map is what
    /// makes a method hot; a hot method without call-site data has an empty
    /// cache map here.
    pub fn method_map(&self) -> &BTreeMap<u16, InlineCacheMap> {
        &self.method_map
    }

    /// Type indices of the classes resolved in this module.
    pub fn class_set(&self) -> &BTreeSet<u16> {
        &self.class_set
    }

    /// Record execution flags for a method. The hot flag materializes a
    /// method-map entry; every other flag is ORed into the bitmap.
    /// Out-of-range indices and flags invalid for the flavor fail.
    pub fn add_method(&mut self, flags: MethodFlags, method_index: u32) -> bool {
        if method_index >= self.num_method_ids || method_index > u32::from(u16::MAX) {
            return false;
        }
        if !MethodFlags::valid_for(self.kind).contains(flags) {
            return false;
        }
        if flags.contains(MethodFlags::HOT) {
            self.find_or_add_method(method_index as u16);
        }
        let bitmap_flags = flags & !MethodFlags::HOT;
        if bitmap_flags.is_empty() {
            return true;
        }
        self.bitmap.set(bitmap_flags, method_index)
    }

    /// Record call-site observations for a method: sentinels are applied
    /// first, then classes, with the monotone per-site transition rules.
    pub fn add_inline_cache(
        &mut self,
        method_index: u32,
        pc: u16,
        classes: &[ClassRef],
        is_megamorphic: bool,
        is_missing_types: bool,
    ) -> bool {
        if method_index >= self.num_method_ids || method_index > u32::from(u16::MAX) {
            return false;
        }
        let cache = self
            .find_or_add_method(method_index as u16)
            .entry(pc)
            .or_default();
        if is_missing_types {
            cache.set_missing_types();
        } else if is_megamorphic {
            cache.set_megamorphic();
        }
        for &class in classes {
            cache.add_class(class);
        }
        true
    }

    /// Flags and inline caches of one method. Out-of-range indices report as
    /// not in the profile.
    pub fn hotness(&self, method_index: u32) -> MethodHotness<'_> {
        let mut flags = self.bitmap.flags(method_index);
        let inline_caches = if method_index <= u32::from(u16::MAX) {
            self.method_map.get(&(method_index as u16))
        } else {
            None
        };
        if inline_caches.is_some() {
            flags |= MethodFlags::HOT;
        }
        MethodHotness {
            flags,
            inline_caches,
        }
    }

    pub fn contains_class(&self, type_index: u16) -> bool {
        self.class_set.contains(&type_index)
    }

    pub(crate) fn add_class(&mut self, type_index: u16) {
        self.class_set.insert(type_index);
    }

    pub(crate) fn find_or_add_method(&mut self, method_index: u16) -> &mut InlineCacheMap {
        self.method_map.entry(method_index).or_default()
    }

    pub(crate) fn bitmap(&self) -> &MethodBitmap {
        &self.bitmap
    }

    pub(crate) fn bitmap_mut(&mut self) -> &mut MethodBitmap {
        &mut self.bitmap
    }
}

/// Hotness information of a single method, as recorded in a profile.
#[derive(Clone, Copy, Debug, Default)]
pub struct MethodHotness<'a> {
    flags: MethodFlags,
    inline_caches: Option<&'a InlineCacheMap>,
}

impl<'a> MethodHotness<'a> {
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_hot(&self) -> bool {
        self.flags.contains(MethodFlags::HOT)
    }

    pub fn is_startup(&self) -> bool {
        self.flags.contains(MethodFlags::STARTUP)
    }

    pub fn is_post_startup(&self) -> bool {
        self.flags.contains(MethodFlags::POST_STARTUP)
    }

    /// A method is in the profile if any flag is recorded for it.
    pub fn is_in_profile(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn inline_caches(&self) -> Option<&'a InlineCacheMap> {
        self.inline_caches
    }
}
