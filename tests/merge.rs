use aot_profile::{
    FlattenProfileData, MethodFlags, ModuleProvider, ProfileInlineCache, ProfileKind,
    ProfileMethodInfo, ProfileStore, SampleAnnotation, TypeRef,
};
use pretty_assertions::assert_eq;

struct FakeModule {
    location: String,
    checksum: u32,
    num_method_ids: u32,
    num_type_ids: u32,
}

impl FakeModule {
    fn new(location: &str, checksum: u32, num_method_ids: u32) -> Self {
        FakeModule {
            location: location.to_owned(),
            checksum,
            num_method_ids,
            num_type_ids: 1024,
        }
    }
}

impl ModuleProvider for FakeModule {
    fn location(&self) -> &str {
        &self.location
    }

    fn checksum(&self) -> u32 {
        self.checksum
    }

    fn num_method_ids(&self) -> u32 {
        self.num_method_ids
    }

    fn num_type_ids(&self) -> u32 {
        self.num_type_ids
    }
}

fn cached_method<'a>(
    module: &'a FakeModule,
    method_index: u32,
    pc: u16,
    class_owner: &'a FakeModule,
    type_index: u16,
) -> ProfileMethodInfo<'a> {
    ProfileMethodInfo {
        module,
        method_index,
        inline_caches: vec![ProfileInlineCache {
            pc,
            is_missing_types: false,
            is_megamorphic: false,
            classes: vec![TypeRef {
                module: class_owner,
                type_index,
            }],
        }],
    }
}

/// Flatten views compare annotation lists in order; merge order permutes
/// them, so commutativity is checked up to annotation-list ordering.
fn normalized(flat: &FlattenProfileData) -> Vec<((String, u16), MethodFlags, Vec<String>)> {
    flat.method_data()
        .iter()
        .map(|(key, meta)| {
            let mut annotations: Vec<String> = meta
                .annotations()
                .iter()
                .map(|a| a.origin_package_name().to_owned())
                .collect();
            annotations.sort();
            (key.clone(), meta.flags(), annotations)
        })
        .collect()
}

#[test]
fn merge_is_idempotent() {
    let m = FakeModule::new("/a/b/m.dex", 7, 100);
    let n = FakeModule::new("/a/b/n.dex", 8, 100);
    let mut store = ProfileStore::default();
    assert!(store.add_methods_for_module(
        &m,
        MethodFlags::HOT | MethodFlags::STARTUP,
        [1, 2, 3],
        &SampleAnnotation::NONE
    ));
    assert!(store.add_classes_for_module(&m, [10, 11], &SampleAnnotation::NONE));
    assert!(store.add_method(
        &cached_method(&m, 2, 0, &n, 5),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    let snapshot = store.clone();
    assert!(store.merge_with(&snapshot, true));
    assert_eq!(store, snapshot);
}

#[test]
fn merge_remaps_class_references_between_index_spaces() {
    let m = FakeModule::new("m.dex", 1, 100);
    let n = FakeModule::new("n.dex", 2, 100);

    // P1 records only M, at profile index 0, with a receiver class in M.
    let mut p1 = ProfileStore::default();
    assert!(p1.add_method(
        &cached_method(&m, 0, 0, &m, 1),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    // P2 records N first, pushing M to profile index 1.
    let mut p2 = ProfileStore::default();
    assert!(p2.add_methods_for_module(&n, MethodFlags::HOT, [0], &SampleAnnotation::NONE));
    assert!(p2.add_method(
        &cached_method(&m, 0, 0, &m, 2),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));
    assert_eq!(p2.modules().nth(1).map(|d| d.profile_key()), Some("m.dex"));

    assert!(p1.merge_with(&p2, true));

    // Append order: M was already present, N is new.
    let keys: Vec<&str> = p1.modules().map(|d| d.profile_key()).collect();
    assert_eq!(keys, vec!["m.dex", "n.dex"]);

    let hotness = p1.get_method_hotness(&m, 0, &SampleAnnotation::NONE);
    let caches = hotness.inline_caches().expect("caches");
    let classes: Vec<(u16, u16)> = caches[&0]
        .classes()
        .expect("class state")
        .iter()
        .map(|c| (c.module, c.type_index))
        .collect();
    // P2's class reference (1, 2) was remapped into P1's index space.
    assert_eq!(classes, vec![(0, 1), (0, 2)]);
}

#[test]
fn merge_is_commutative_up_to_index_renumbering() {
    let m = FakeModule::new("m.dex", 1, 100);
    let n = FakeModule::new("n.dex", 2, 100);
    let ann_a = SampleAnnotation::new("com.a");
    let ann_b = SampleAnnotation::new("com.b");

    let mut a = ProfileStore::default();
    assert!(a.add_methods_for_module(&m, MethodFlags::HOT, [1, 2], &ann_a));
    assert!(a.add_methods_for_module(&n, MethodFlags::STARTUP, [3], &ann_a));
    assert!(a.add_classes_for_module(&m, [10], &ann_a));

    let mut b = ProfileStore::default();
    assert!(b.add_methods_for_module(&n, MethodFlags::HOT, [3, 4], &ann_b));
    assert!(b.add_methods_for_module(&m, MethodFlags::POST_STARTUP, [1], &ann_b));
    assert!(b.add_classes_for_module(&m, [10, 11], &ann_b));

    let mut ab = a.clone();
    assert!(ab.merge_with(&b, true));
    let mut ba = b.clone();
    assert!(ba.merge_with(&a, true));

    assert_eq!(normalized(&ab.extract_flatten()), normalized(&ba.extract_flatten()));
    assert_eq!(ab.num_methods(), ba.num_methods());
    assert_eq!(ab.num_resolved_classes(), ba.num_resolved_classes());
}

#[test]
fn merge_rejects_version_mismatch() {
    let mut regular = ProfileStore::new(ProfileKind::Regular);
    let boot = ProfileStore::new(ProfileKind::Boot);
    assert!(!regular.merge_with(&boot, true));
}

#[test]
fn merge_rejects_checksum_conflict_without_mutation() {
    let original = FakeModule::new("m.dex", 1, 100);
    let conflicting = FakeModule::new("m.dex", 2, 100);

    let mut ours = ProfileStore::default();
    assert!(ours.add_methods_for_module(
        &original,
        MethodFlags::HOT,
        [1],
        &SampleAnnotation::NONE
    ));
    let mut theirs = ProfileStore::default();
    assert!(theirs.add_methods_for_module(
        &conflicting,
        MethodFlags::HOT,
        [2],
        &SampleAnnotation::NONE
    ));

    let snapshot = ours.clone();
    assert!(!ours.merge_with(&theirs, true));
    assert_eq!(ours, snapshot);
}

#[test]
fn merge_rejects_method_count_conflict_without_mutation() {
    let original = FakeModule::new("m.dex", 1, 100);
    let conflicting = FakeModule::new("m.dex", 1, 200);

    let mut ours = ProfileStore::default();
    assert!(ours.add_methods_for_module(
        &original,
        MethodFlags::HOT,
        [1],
        &SampleAnnotation::NONE
    ));
    let mut theirs = ProfileStore::default();
    assert!(theirs.add_methods_for_module(
        &conflicting,
        MethodFlags::HOT,
        [2],
        &SampleAnnotation::NONE
    ));

    let snapshot = ours.clone();
    assert!(!ours.merge_with(&theirs, true));
    assert_eq!(ours, snapshot);
}

#[test]
fn merge_without_classes_leaves_class_sets_alone() {
    let m = FakeModule::new("m.dex", 1, 100);
    let mut ours = ProfileStore::default();
    assert!(ours.add_methods_for_module(&m, MethodFlags::HOT, [1], &SampleAnnotation::NONE));
    let mut theirs = ProfileStore::default();
    assert!(theirs.add_classes_for_module(&m, [5, 6], &SampleAnnotation::NONE));

    assert!(ours.merge_with(&theirs, false));
    assert_eq!(ours.num_resolved_classes(), 0);
    assert!(ours.merge_with(&theirs, true));
    assert_eq!(ours.num_resolved_classes(), 2);
}

#[test]
fn boot_flag_bitmaps_merge_by_byte_or() {
    let m = FakeModule::new("/system/framework/core.mod", 9, 2);

    let mut p1 = ProfileStore::new(ProfileKind::Boot);
    assert!(p1.add_methods_for_module(&m, MethodFlags::STARTUP, [0], &SampleAnnotation::NONE));
    assert!(p1.add_methods_for_module(&m, MethodFlags::BOOT, [1], &SampleAnnotation::NONE));

    let mut p2 = ProfileStore::new(ProfileKind::Boot);
    assert!(p2.add_methods_for_module(
        &m,
        MethodFlags::POST_STARTUP,
        [0],
        &SampleAnnotation::NONE
    ));

    assert!(p1.merge_with(&p2, true));
    assert_eq!(
        p1.get_method_hotness(&m, 0, &SampleAnnotation::NONE).flags(),
        MethodFlags::STARTUP | MethodFlags::POST_STARTUP
    );
    assert_eq!(
        p1.get_method_hotness(&m, 1, &SampleAnnotation::NONE).flags(),
        MethodFlags::BOOT
    );
}

#[test]
fn merging_inline_caches_applies_per_site_policy() {
    let m = FakeModule::new("m.dex", 1, 10);

    let mut ours = ProfileStore::default();
    assert!(ours.add_method(
        &cached_method(&m, 0, 0, &m, 1),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    let mut megamorphic = ProfileStore::default();
    assert!(megamorphic.add_method(
        &ProfileMethodInfo {
            module: &m,
            method_index: 0,
            inline_caches: vec![ProfileInlineCache {
                pc: 0,
                is_missing_types: false,
                is_megamorphic: true,
                classes: Vec::new(),
            }],
        },
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    assert!(ours.merge_with(&megamorphic, true));
    let hotness = ours.get_method_hotness(&m, 0, &SampleAnnotation::NONE);
    assert!(hotness.inline_caches().expect("caches")[&0].is_megamorphic());

    let mut missing = ProfileStore::default();
    assert!(missing.add_method(
        &ProfileMethodInfo {
            module: &m,
            method_index: 0,
            inline_caches: vec![ProfileInlineCache {
                pc: 0,
                is_missing_types: true,
                is_megamorphic: false,
                classes: Vec::new(),
            }],
        },
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    assert!(ours.merge_with(&missing, true));
    let hotness = ours.get_method_hotness(&m, 0, &SampleAnnotation::NONE);
    assert!(hotness.inline_caches().expect("caches")[&0].is_missing_types());
}
