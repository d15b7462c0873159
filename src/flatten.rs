use std::collections::BTreeMap;

use crate::flags::MethodFlags;
use crate::key::SampleAnnotation;

/// Flags and annotation multiplicity of one flattened method or class.
///
/// The annotation list may contain duplicates after merging: each occurrence
/// records one profile group that used the item.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ItemMetadata {
    flags: MethodFlags,
    annotations: Vec<SampleAnnotation>,
}

impl ItemMetadata {
    /// OR of the flags seen across all groups; empty for classes.
    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: MethodFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn annotations(&self) -> &[SampleAnnotation] {
        &self.annotations
    }
}

/// Read-only projection of a profile store that lists every method and class
/// across all module groups, keyed by (module location, index).
///
/// The max-aggregation counters equal the longest annotation list of any
/// entry; they are derivable but precomputed because consumers check them
/// often and the maps can be large.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlattenProfileData {
    method_data: BTreeMap<(String, u16), ItemMetadata>,
    class_data: BTreeMap<(String, u16), ItemMetadata>,
    max_aggregation_for_methods: u32,
    max_aggregation_for_classes: u32,
}

impl FlattenProfileData {
    pub fn method_data(&self) -> &BTreeMap<(String, u16), ItemMetadata> {
        &self.method_data
    }

    pub fn class_data(&self) -> &BTreeMap<(String, u16), ItemMetadata> {
        &self.class_data
    }

    pub fn max_aggregation_for_methods(&self) -> u32 {
        self.max_aggregation_for_methods
    }

    pub fn max_aggregation_for_classes(&self) -> u32 {
        self.max_aggregation_for_classes
    }

    pub(crate) fn record_method(
        &mut self,
        location: String,
        method_index: u16,
        flags: MethodFlags,
        annotation: SampleAnnotation,
    ) {
        let meta = self
            .method_data
            .entry((location, method_index))
            .or_default();
        meta.flags |= flags;
        meta.annotations.push(annotation);
        self.max_aggregation_for_methods = self
            .max_aggregation_for_methods
            .max(meta.annotations.len() as u32);
    }

    pub(crate) fn record_class(
        &mut self,
        location: String,
        type_index: u16,
        annotation: SampleAnnotation,
    ) {
        let meta = self.class_data.entry((location, type_index)).or_default();
        meta.annotations.push(annotation);
        self.max_aggregation_for_classes = self
            .max_aggregation_for_classes
            .max(meta.annotations.len() as u32);
    }

    /// Merge another flatten view: flags OR together, annotation lists
    /// concatenate, and the aggregation maxima are brought up to date.
    pub fn merge(&mut self, other: &FlattenProfileData) {
        for (key, theirs) in &other.method_data {
            let meta = self.method_data.entry(key.clone()).or_default();
            meta.flags |= theirs.flags;
            meta.annotations.extend(theirs.annotations.iter().cloned());
            self.max_aggregation_for_methods = self
                .max_aggregation_for_methods
                .max(meta.annotations.len() as u32);
        }
        for (key, theirs) in &other.class_data {
            let meta = self.class_data.entry(key.clone()).or_default();
            meta.flags |= theirs.flags;
            meta.annotations.extend(theirs.annotations.iter().cloned());
            self.max_aggregation_for_classes = self
                .max_aggregation_for_classes
                .max(meta.annotations.len() as u32);
        }
    }
}
