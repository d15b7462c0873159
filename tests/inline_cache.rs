use std::io::Cursor;

use aot_profile::{
    MethodFlags, ModuleProvider, ProfileInlineCache, ProfileMethodInfo, ProfileStore,
    SampleAnnotation, TypeRef,
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

fn method_with_classes<'a>(
    module: &'a FakeModule,
    pc: u16,
    type_indices: &[u16],
) -> ProfileMethodInfo<'a> {
    ProfileMethodInfo {
        module,
        method_index: 3,
        inline_caches: vec![ProfileInlineCache {
            pc,
            is_missing_types: false,
            is_megamorphic: false,
            classes: type_indices
                .iter()
                .map(|&type_index| TypeRef {
                    module,
                    type_index,
                })
                .collect(),
        }],
    }
}

#[test]
fn sixth_distinct_class_transitions_to_megamorphic() {
    let module = FakeModule::new("/a/b/m.dex", 1, 100);
    let mut store = ProfileStore::default();
    for type_index in 1..=6u16 {
        assert!(store.add_method(
            &method_with_classes(&module, 0x20, &[type_index]),
            MethodFlags::HOT,
            &SampleAnnotation::NONE
        ));
        let hotness = store.get_method_hotness(&module, 3, &SampleAnnotation::NONE);
        let cache = &hotness.inline_caches().expect("caches")[&0x20];
        if type_index < 6 {
            assert_eq!(
                cache.classes().map(|c| c.len()),
                Some(usize::from(type_index))
            );
        } else {
            assert!(cache.is_megamorphic());
            assert_eq!(cache.classes(), None);
        }
    }
}

#[test]
fn missing_types_survives_all_later_observations() {
    let module = FakeModule::new("/a/b/m.dex", 1, 100);
    let mut store = ProfileStore::default();
    assert!(store.add_method(
        &ProfileMethodInfo {
            module: &module,
            method_index: 3,
            inline_caches: vec![ProfileInlineCache {
                pc: 0x20,
                is_missing_types: true,
                is_megamorphic: false,
                classes: Vec::new(),
            }],
        },
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    // Classes, then a megamorphic marker: neither may clear missing-types.
    assert!(store.add_method(
        &method_with_classes(&module, 0x20, &[1, 2]),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));
    assert!(store.add_method(
        &ProfileMethodInfo {
            module: &module,
            method_index: 3,
            inline_caches: vec![ProfileInlineCache {
                pc: 0x20,
                is_missing_types: false,
                is_megamorphic: true,
                classes: Vec::new(),
            }],
        },
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    let hotness = store.get_method_hotness(&module, 3, &SampleAnnotation::NONE);
    assert!(hotness.inline_caches().expect("caches")[&0x20].is_missing_types());

    // And it survives serialization.
    let mut bytes = Vec::new();
    store.save(&mut bytes).expect("save");
    let mut loaded = ProfileStore::default();
    loaded.load(&mut Cursor::new(&bytes), true).expect("load");
    let hotness = loaded.get_method_hotness(&module, 3, &SampleAnnotation::NONE);
    assert!(hotness.inline_caches().expect("caches")[&0x20].is_missing_types());
}

#[test]
fn megamorphic_set_drops_recorded_classes() {
    let module = FakeModule::new("/a/b/m.dex", 1, 100);
    let mut store = ProfileStore::default();
    assert!(store.add_method(
        &method_with_classes(&module, 0x10, &[1, 2, 3]),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));
    assert!(store.add_method(
        &ProfileMethodInfo {
            module: &module,
            method_index: 3,
            inline_caches: vec![ProfileInlineCache {
                pc: 0x10,
                is_missing_types: false,
                is_megamorphic: true,
                classes: Vec::new(),
            }],
        },
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    let hotness = store.get_method_hotness(&module, 3, &SampleAnnotation::NONE);
    let cache = &hotness.inline_caches().expect("caches")[&0x10];
    assert!(cache.is_megamorphic());
    assert_eq!(cache.classes(), None);
}

#[test]
fn distinct_call_sites_keep_independent_states() {
    let module = FakeModule::new("/a/b/m.dex", 1, 100);
    let mut store = ProfileStore::default();
    assert!(store.add_method(
        &method_with_classes(&module, 0x10, &[1]),
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));
    assert!(store.add_method(
        &ProfileMethodInfo {
            module: &module,
            method_index: 3,
            inline_caches: vec![ProfileInlineCache {
                pc: 0x30,
                is_missing_types: true,
                is_megamorphic: false,
                classes: Vec::new(),
            }],
        },
        MethodFlags::HOT,
        &SampleAnnotation::NONE
    ));

    let hotness = store.get_method_hotness(&module, 3, &SampleAnnotation::NONE);
    let caches = hotness.inline_caches().expect("caches");
    assert_eq!(caches[&0x10].classes().map(|c| c.len()), Some(1));
    assert!(caches[&0x30].is_missing_types());
}

#[test]
fn inline_caches_are_only_recorded_for_hot_methods() {
    let module = FakeModule::new("/a/b/m.dex", 1, 100);
    let mut store = ProfileStore::default();
    assert!(store.add_method(
        &method_with_classes(&module, 0x10, &[1]),
        MethodFlags::STARTUP,
        &SampleAnnotation::NONE
    ));

    let hotness = store.get_method_hotness(&module, 3, &SampleAnnotation::NONE);
    assert!(hotness.is_startup());
    assert!(!hotness.is_hot());
    assert!(hotness.inline_caches().is_none());
}
