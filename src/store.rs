use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;

use tracing::warn;

use crate::flags::MethodFlags;
use crate::flatten::FlattenProfileData;
use crate::format::{ProfileIndex, ProfileKind};
use crate::inline_cache::{ClassRef, InlineCache};
use crate::key::{
    annotation_from_key, augmented_key, base_key_for_location, base_key_from_augmented,
    SampleAnnotation, ANNOTATION_SEPARATOR,
};
use crate::module::{MethodHotness, ModuleData};
use crate::{ModuleProvider, ProfileMethodInfo};

/// Top-level container for profile compilation information.
///
/// Modules are appended as first seen and never removed individually; the
/// profile index of a module is its position in the append order. The store
/// performs no internal synchronization: mutating operations require
/// exclusive access from the caller.
#[derive(Clone, Debug)]
pub struct ProfileStore {
    kind: ProfileKind,
    modules: Vec<ModuleData>,
    // Derived cache over `modules`; rebuilt on clear and key updates.
    key_to_index: HashMap<String, ProfileIndex>,
}

/// Per-module extraction of the data relevant to compilation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassesAndMethods {
    pub classes: BTreeSet<u16>,
    pub hot_methods: BTreeSet<u16>,
    pub startup_methods: BTreeSet<u16>,
    pub post_startup_methods: BTreeSet<u16>,
}

impl Default for ProfileStore {
    fn default() -> Self {
        ProfileStore::new(ProfileKind::Regular)
    }
}

impl PartialEq for ProfileStore {
    fn eq(&self, other: &Self) -> bool {
        // `key_to_index` is derived from `modules` and excluded on purpose.
        self.kind == other.kind && self.modules == other.modules
    }
}

impl Eq for ProfileStore {}

impl ProfileStore {
    pub fn new(kind: ProfileKind) -> Self {
        ProfileStore {
            kind,
            modules: Vec::new(),
            key_to_index: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn is_for_boot_image(&self) -> bool {
        self.kind.is_boot()
    }

    pub fn same_version(&self, other: &ProfileStore) -> bool {
        self.kind == other.kind
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// Number of profiled (hot) methods across all modules.
    pub fn num_methods(&self) -> usize {
        self.modules.iter().map(|m| m.method_map.len()).sum()
    }

    /// Number of resolved classes across all modules.
    pub fn num_resolved_classes(&self) -> usize {
        self.modules.iter().map(|m| m.class_set.len()).sum()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleData> {
        self.modules.iter()
    }

    pub fn module(&self, profile_index: ProfileIndex) -> Option<&ModuleData> {
        self.modules.get(usize::from(profile_index))
    }

    pub(crate) fn module_mut(&mut self, profile_index: ProfileIndex) -> Option<&mut ModuleData> {
        self.modules.get_mut(usize::from(profile_index))
    }

    /// Resolve or create the module entry for `(module, annotation)`.
    ///
    /// Fails when the key already exists with a different checksum or method
    /// count, when the flavor's module capacity is exhausted, or when the
    /// location contains the reserved annotation separator.
    pub fn get_or_add_module(
        &mut self,
        module: &dyn ModuleProvider,
        annotation: &SampleAnnotation,
    ) -> Option<&mut ModuleData> {
        let base_key = base_key_for_location(module.location());
        if base_key.contains(ANNOTATION_SEPARATOR) {
            return None;
        }
        let profile_key = augmented_key(base_key, annotation);
        self.get_or_add_module_by_key(profile_key, module.checksum(), module.num_method_ids())
    }

    pub(crate) fn get_or_add_module_by_key(
        &mut self,
        profile_key: String,
        checksum: u32,
        num_method_ids: u32,
    ) -> Option<&mut ModuleData> {
        if let Some(&index) = self.key_to_index.get(&profile_key) {
            let data = &mut self.modules[usize::from(index)];
            if data.checksum != checksum || data.num_method_ids != num_method_ids {
                return None;
            }
            return Some(data);
        }
        if self.modules.len() >= self.kind.max_module_count() {
            return None;
        }
        let index = self.modules.len() as ProfileIndex;
        self.key_to_index.insert(profile_key.clone(), index);
        self.modules.push(ModuleData::new(
            profile_key,
            index,
            checksum,
            num_method_ids,
            self.kind,
        ));
        Some(&mut self.modules[usize::from(index)])
    }

    fn find_module(
        &self,
        module: &dyn ModuleProvider,
        annotation: &SampleAnnotation,
    ) -> Option<&ModuleData> {
        let base_key = base_key_for_location(module.location());
        let data = if annotation.is_none() {
            // Without an annotation only the first base-key match is
            // considered, mirroring how compilation queries ignore sample
            // origins.
            self.modules
                .iter()
                .find(|d| base_key_from_augmented(&d.profile_key) == base_key)
        } else {
            let profile_key = augmented_key(base_key, annotation);
            self.key_to_index
                .get(&profile_key)
                .map(|&index| &self.modules[usize::from(index)])
        }?;
        (data.checksum == module.checksum()).then_some(data)
    }

    /// Record execution flags for a batch of methods of one module.
    pub fn add_methods_for_module(
        &mut self,
        module: &dyn ModuleProvider,
        flags: MethodFlags,
        method_indices: impl IntoIterator<Item = u16>,
        annotation: &SampleAnnotation,
    ) -> bool {
        let Some(data) = self.get_or_add_module(module, annotation) else {
            return false;
        };
        for method_index in method_indices {
            if !data.add_method(flags, u32::from(method_index)) {
                return false;
            }
        }
        true
    }

    /// Record resolved classes of one module.
    pub fn add_classes_for_module(
        &mut self,
        module: &dyn ModuleProvider,
        type_indices: impl IntoIterator<Item = u16>,
        annotation: &SampleAnnotation,
    ) -> bool {
        let Some(data) = self.get_or_add_module(module, annotation) else {
            return false;
        };
        for type_index in type_indices {
            data.add_class(type_index);
        }
        true
    }

    /// Record one method with flags and call-site observations. Inline caches
    /// are only stored for hot methods; receiver classes may live in other
    /// modules, which are resolved or created under the same annotation.
    pub fn add_method(
        &mut self,
        method: &ProfileMethodInfo<'_>,
        flags: MethodFlags,
        annotation: &SampleAnnotation,
    ) -> bool {
        let Some(data_index) = self
            .get_or_add_module(method.module, annotation)
            .map(|d| d.profile_index)
        else {
            return false;
        };
        // Resolve foreign class references first: doing so may append
        // modules, which would invalidate a held borrow of the target entry.
        let mut caches: Vec<(u16, bool, bool, Vec<ClassRef>)> =
            Vec::with_capacity(method.inline_caches.len());
        for cache in &method.inline_caches {
            let mut classes = Vec::with_capacity(cache.classes.len());
            for class in &cache.classes {
                let Some(owner) = self
                    .get_or_add_module(class.module, annotation)
                    .map(|d| d.profile_index)
                else {
                    return false;
                };
                classes.push(ClassRef {
                    module: owner,
                    type_index: class.type_index,
                });
            }
            caches.push((
                cache.pc,
                cache.is_megamorphic,
                cache.is_missing_types,
                classes,
            ));
        }
        let data = &mut self.modules[usize::from(data_index)];
        if !data.add_method(flags, method.method_index) {
            return false;
        }
        if !flags.contains(MethodFlags::HOT) {
            return true;
        }
        for (pc, is_megamorphic, is_missing_types, classes) in caches {
            if !data.add_inline_cache(
                method.method_index,
                pc,
                &classes,
                is_megamorphic,
                is_missing_types,
            ) {
                return false;
            }
        }
        true
    }

    /// Record a batch of methods with the same flags.
    pub fn add_methods(
        &mut self,
        methods: &[ProfileMethodInfo<'_>],
        flags: MethodFlags,
        annotation: &SampleAnnotation,
    ) -> bool {
        methods
            .iter()
            .all(|method| self.add_method(method, flags, annotation))
    }

    /// Hotness of a method, or the empty hotness if the module (or method)
    /// is not in the profile.
    pub fn get_method_hotness(
        &self,
        module: &dyn ModuleProvider,
        method_index: u32,
        annotation: &SampleAnnotation,
    ) -> MethodHotness<'_> {
        self.find_module(module, annotation)
            .map(|data| data.hotness(method_index))
            .unwrap_or_default()
    }

    /// Whether the class is recorded as resolved in the profile.
    pub fn contains_class(
        &self,
        module: &dyn ModuleProvider,
        type_index: u16,
        annotation: &SampleAnnotation,
    ) -> bool {
        self.find_module(module, annotation)
            .is_some_and(|data| data.contains_class(type_index))
    }

    /// Classes and flagged method sets of one module, or `None` if the
    /// module is not in the profile (or its checksum differs).
    pub fn get_classes_and_methods(
        &self,
        module: &dyn ModuleProvider,
        annotation: &SampleAnnotation,
    ) -> Option<ClassesAndMethods> {
        let data = self.find_module(module, annotation)?;
        let mut out = ClassesAndMethods {
            classes: data.class_set.clone(),
            ..ClassesAndMethods::default()
        };
        for method_index in 0..data.num_method_ids.min(u32::from(u16::MAX) + 1) {
            let hotness = data.hotness(method_index);
            if hotness.is_hot() {
                out.hot_methods.insert(method_index as u16);
            }
            if hotness.is_startup() {
                out.startup_methods.insert(method_index as u16);
            }
            if hotness.is_post_startup() {
                out.post_startup_methods.insert(method_index as u16);
            }
        }
        Some(out)
    }

    /// Resolve a profile index back to one of the caller's modules by
    /// checksum and base key.
    pub fn find_module_for_index<'a>(
        &self,
        profile_index: ProfileIndex,
        modules: &[&'a dyn ModuleProvider],
    ) -> Option<&'a dyn ModuleProvider> {
        let data = self.module(profile_index)?;
        let base_key = base_key_from_augmented(&data.profile_key);
        modules
            .iter()
            .copied()
            .find(|m| m.checksum() == data.checksum && base_key_for_location(m.location()) == base_key)
    }

    /// Merge another store of the same flavor into this one.
    ///
    /// Modules are matched by augmented key; matches must agree on checksum
    /// and method count, missing modules are appended. Flag bitmaps merge by
    /// byte-wise OR, inline caches by the per-site policy, and class
    /// references are remapped from `other`'s index space into ours. Class
    /// sets merge only when `merge_classes` is set (boot-image assembly
    /// deliberately leaves them out).
    pub fn merge_with(&mut self, other: &ProfileStore, merge_classes: bool) -> bool {
        if !self.same_version(other) {
            return false;
        }
        // Validate every matching module before mutating anything, so an
        // incompatible input cannot leave a half-merged store.
        let mut new_modules = 0usize;
        for theirs in &other.modules {
            match self.key_to_index.get(&theirs.profile_key) {
                Some(&index) => {
                    let ours = &self.modules[usize::from(index)];
                    if ours.checksum != theirs.checksum
                        || ours.num_method_ids != theirs.num_method_ids
                    {
                        warn!(
                            profile_key = theirs.profile_key.as_str(),
                            "cannot merge profiles: module mismatch"
                        );
                        return false;
                    }
                }
                None => new_modules += 1,
            }
        }
        if self.modules.len() + new_modules > self.kind.max_module_count() {
            return false;
        }

        let mut remap: Vec<ProfileIndex> = Vec::with_capacity(other.modules.len());
        for theirs in &other.modules {
            let Some(data) = self.get_or_add_module_by_key(
                theirs.profile_key.clone(),
                theirs.checksum,
                theirs.num_method_ids,
            ) else {
                return false;
            };
            remap.push(data.profile_index);
        }

        for theirs in &other.modules {
            let self_index = usize::from(remap[usize::from(theirs.profile_index)]);
            let ours = &mut self.modules[self_index];
            for (&method_index, their_caches) in &theirs.method_map {
                let our_caches = ours.find_or_add_method(method_index);
                for (&pc, their_cache) in their_caches {
                    let our_cache = our_caches.entry(pc).or_default();
                    match their_cache {
                        InlineCache::MissingTypes => our_cache.set_missing_types(),
                        InlineCache::Megamorphic => our_cache.set_megamorphic(),
                        InlineCache::Types(classes) => {
                            for class in classes {
                                let Some(&module) = remap.get(usize::from(class.module)) else {
                                    return false;
                                };
                                our_cache.add_class(ClassRef {
                                    module,
                                    type_index: class.type_index,
                                });
                            }
                        }
                    }
                }
            }
            if merge_classes {
                ours.class_set.extend(theirs.class_set.iter().copied());
            }
            if !ours.bitmap_mut().merge(theirs.bitmap()) {
                return false;
            }
        }
        true
    }

    /// Rewrite profile keys after modules were moved on disk.
    ///
    /// Each profile entry is matched to at most one provided module by
    /// checksum and method count; its key is rebuilt from the module's
    /// current location with the annotation preserved. If any two entries
    /// would end up with the same key the whole operation aborts without
    /// mutating the store.
    pub fn update_profile_keys(&mut self, modules: &[&dyn ModuleProvider]) -> bool {
        let mut new_keys: Vec<Option<String>> = vec![None; self.modules.len()];
        for module in modules {
            let matched = self.modules.iter().position(|d| {
                d.checksum == module.checksum() && d.num_method_ids == module.num_method_ids()
            });
            let Some(position) = matched else {
                continue;
            };
            if new_keys[position].is_some() {
                continue;
            }
            let base_key = base_key_for_location(module.location());
            if base_key.contains(ANNOTATION_SEPARATOR) {
                return false;
            }
            let annotation = annotation_from_key(&self.modules[position].profile_key);
            new_keys[position] = Some(augmented_key(base_key, &annotation));
        }

        let mut final_keys: HashSet<&str> = HashSet::with_capacity(self.modules.len());
        for (index, data) in self.modules.iter().enumerate() {
            let key = new_keys[index].as_deref().unwrap_or(&data.profile_key);
            if !final_keys.insert(key) {
                warn!(profile_key = key, "profile key update would collide");
                return false;
            }
        }

        for (index, new_key) in new_keys.into_iter().enumerate() {
            if let Some(new_key) = new_key {
                self.modules[index].profile_key = new_key;
            }
        }
        self.rebuild_key_map();
        true
    }

    /// Check the profile against the caller's modules: checksums and method
    /// counts must agree, and every stored method, class, and inline-cache
    /// class reference must be in range for its module. Modules the caller
    /// did not provide are skipped.
    pub fn verify_profile_data(&self, modules: &[&dyn ModuleProvider]) -> bool {
        let resolved: Vec<Option<&dyn ModuleProvider>> = self
            .modules
            .iter()
            .map(|data| {
                let base_key = base_key_from_augmented(&data.profile_key);
                modules
                    .iter()
                    .copied()
                    .find(|m| base_key_for_location(m.location()) == base_key)
            })
            .collect();

        for (data, module) in self.modules.iter().zip(&resolved) {
            let Some(module) = module else {
                continue;
            };
            if data.checksum != module.checksum() {
                warn!(
                    profile_key = data.profile_key.as_str(),
                    "verification failed: checksum mismatch"
                );
                return false;
            }
            if data.num_method_ids != module.num_method_ids() {
                warn!(
                    profile_key = data.profile_key.as_str(),
                    "verification failed: method count mismatch"
                );
                return false;
            }
            for (&method_index, caches) in &data.method_map {
                if u32::from(method_index) >= module.num_method_ids() {
                    warn!(
                        profile_key = data.profile_key.as_str(),
                        method_index, "verification failed: method index out of range"
                    );
                    return false;
                }
                for cache in caches.values() {
                    let Some(classes) = cache.classes() else {
                        continue;
                    };
                    for class in classes {
                        let Some(target) = resolved
                            .get(usize::from(class.module))
                            .copied()
                            .flatten()
                        else {
                            continue;
                        };
                        if u32::from(class.type_index) >= target.num_type_ids() {
                            warn!(
                                profile_key = data.profile_key.as_str(),
                                type_index = class.type_index,
                                "verification failed: inline-cache type index out of range"
                            );
                            return false;
                        }
                    }
                }
            }
            for &type_index in &data.class_set {
                if u32::from(type_index) >= module.num_type_ids() {
                    warn!(
                        profile_key = data.profile_key.as_str(),
                        type_index, "verification failed: class type index out of range"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Build the flatten view: every method and class across all module
    /// groups, keyed by (location, index), with annotation multiplicity.
    pub fn extract_flatten(&self) -> FlattenProfileData {
        let mut flat = FlattenProfileData::default();
        for data in &self.modules {
            let location = base_key_from_augmented(&data.profile_key).to_owned();
            let annotation = annotation_from_key(&data.profile_key);
            for method_index in 0..data.num_method_ids.min(u32::from(u16::MAX) + 1) {
                let hotness = data.hotness(method_index);
                if !hotness.is_in_profile() {
                    continue;
                }
                flat.record_method(
                    location.clone(),
                    method_index as u16,
                    hotness.flags(),
                    annotation.clone(),
                );
            }
            for &type_index in &data.class_set {
                flat.record_class(location.clone(), type_index, annotation.clone());
            }
        }
        flat
    }

    /// Wipe all profile data, keeping the flavor.
    pub fn clear_data(&mut self) {
        self.modules.clear();
        self.key_to_index.clear();
    }

    /// Wipe all profile data and switch the store's flavor.
    pub fn clear_data_and_adjust_version(&mut self, kind: ProfileKind) {
        self.clear_data();
        self.kind = kind;
    }

    /// Human-readable dump of the whole store, for debugging and tests.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ProfileStore [{}] {} module(s)",
            if self.kind.is_boot() { "boot" } else { "regular" },
            self.modules.len()
        );
        for data in &self.modules {
            let _ = writeln!(
                out,
                "  {} [checksum={:#010x} methods={} index={}]",
                data.profile_key, data.checksum, data.num_method_ids, data.profile_index
            );
            for (method_index, caches) in &data.method_map {
                let _ = write!(out, "    method {method_index}:");
                for (pc, cache) in caches {
                    match cache {
                        InlineCache::MissingTypes => {
                            let _ = write!(out, " pc {pc}=missing-types");
                        }
                        InlineCache::Megamorphic => {
                            let _ = write!(out, " pc {pc}=megamorphic");
                        }
                        InlineCache::Types(classes) => {
                            let _ = write!(out, " pc {pc}={{");
                            for class in classes {
                                let _ = write!(out, "({},{})", class.module, class.type_index);
                            }
                            let _ = write!(out, "}}");
                        }
                    }
                }
                let _ = writeln!(out);
            }
            if !data.class_set.is_empty() {
                let _ = writeln!(
                    out,
                    "    classes: {:?}",
                    data.class_set.iter().collect::<Vec<_>>()
                );
            }
        }
        out
    }

    fn rebuild_key_map(&mut self) {
        self.key_to_index = self
            .modules
            .iter()
            .map(|data| (data.profile_key.clone(), data.profile_index))
            .collect();
    }
}
