//! Profile keys.
//!
//! A module is identified within a profile by its *base key*, derived from
//! its on-disk location, optionally augmented with a sample annotation. The
//! annotation is appended after a reserved non-printable separator so the
//! augmented form parses back unambiguously and extracting the base key is a
//! subslice, not an allocation.

/// Separator between the base key and the serialized annotation. `0x1f`
/// (ASCII unit separator) cannot appear in a valid module location.
pub(crate) const ANNOTATION_SEPARATOR: char = '\u{1f}';

/// Marker separating an archive container path from the entry inside it.
pub const ARCHIVE_LOCATION_SEPARATOR: char = '!';

/// Auxiliary tag associated with profile samples, currently the name of the
/// package that generated them. The empty annotation is the "no annotation"
/// sentinel and leaves keys unaugmented.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SampleAnnotation {
    origin_package_name: String,
}

impl SampleAnnotation {
    pub const NONE: SampleAnnotation = SampleAnnotation {
        origin_package_name: String::new(),
    };

    pub fn new(origin_package_name: impl Into<String>) -> Self {
        SampleAnnotation {
            origin_package_name: origin_package_name.into(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.origin_package_name.is_empty()
    }

    pub fn origin_package_name(&self) -> &str {
        &self.origin_package_name
    }
}

/// Base profile key for a module location: the archive prefix (up to and
/// including the last `!`) is stripped, the remainder is the key.
pub fn base_key_for_location(location: &str) -> &str {
    match location.rfind(ARCHIVE_LOCATION_SEPARATOR) {
        Some(idx) => &location[idx + ARCHIVE_LOCATION_SEPARATOR.len_utf8()..],
        None => location,
    }
}

/// Augment a base key with an annotation. The none annotation leaves the key
/// untouched so unannotated profiles keep their historical keys.
pub(crate) fn augmented_key(base_key: &str, annotation: &SampleAnnotation) -> String {
    if annotation.is_none() {
        base_key.to_owned()
    } else {
        let mut key = String::with_capacity(
            base_key.len()
                + ANNOTATION_SEPARATOR.len_utf8()
                + annotation.origin_package_name().len(),
        );
        key.push_str(base_key);
        key.push(ANNOTATION_SEPARATOR);
        key.push_str(annotation.origin_package_name());
        key
    }
}

/// Base key of a possibly-augmented key, as a view into the input.
pub fn base_key_from_augmented(profile_key: &str) -> &str {
    match profile_key.find(ANNOTATION_SEPARATOR) {
        Some(idx) => &profile_key[..idx],
        None => profile_key,
    }
}

/// Annotation carried by an augmented key, or [`SampleAnnotation::NONE`] for
/// a bare base key.
pub fn annotation_from_key(profile_key: &str) -> SampleAnnotation {
    match profile_key.find(ANNOTATION_SEPARATOR) {
        Some(idx) => {
            SampleAnnotation::new(&profile_key[idx + ANNOTATION_SEPARATOR.len_utf8()..])
        }
        None => SampleAnnotation::NONE,
    }
}
