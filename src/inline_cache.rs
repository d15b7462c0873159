use std::collections::{BTreeMap, BTreeSet};

use crate::format::ProfileIndex;
use crate::limits::INLINE_CACHE_CLASS_LIMIT;

/// Receiver class observed at a call site. The owning module is named by its
/// profile index rather than by location, so references stay small, survive
/// reallocation, and serialize directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClassRef {
    pub module: ProfileIndex,
    pub type_index: u16,
}

/// Observed receiver types at one bytecode offset.
///
/// The three states are mutually exclusive and transitions are monotone
/// toward less information: once a site is megamorphic its class set is gone,
/// and once types went missing nothing restores them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InlineCache {
    /// The receiver classes seen so far; empty until the first observation.
    Types(BTreeSet<ClassRef>),
    /// Too many distinct receiver classes to usefully specialize.
    Megamorphic,
    /// At least one receiver class lives in a module not tracked for
    /// profiling, so the set recorded here would be incomplete.
    MissingTypes,
}

impl Default for InlineCache {
    fn default() -> Self {
        InlineCache::Types(BTreeSet::new())
    }
}

impl InlineCache {
    /// Record a receiver class. No-op in either sentinel state; tips the site
    /// into [`InlineCache::Megamorphic`] past the class limit.
    pub fn add_class(&mut self, class: ClassRef) {
        if let InlineCache::Types(classes) = self {
            classes.insert(class);
            if classes.len() > INLINE_CACHE_CLASS_LIMIT {
                *self = InlineCache::Megamorphic;
            }
        }
    }

    /// Mark the site megamorphic, dropping the class set. Missing types takes
    /// precedence and is never downgraded.
    pub fn set_megamorphic(&mut self) {
        if !matches!(self, InlineCache::MissingTypes) {
            *self = InlineCache::Megamorphic;
        }
    }

    /// Mark the site as having unrecordable receiver types. Overrides both
    /// other states.
    pub fn set_missing_types(&mut self) {
        *self = InlineCache::MissingTypes;
    }

    pub fn is_megamorphic(&self) -> bool {
        matches!(self, InlineCache::Megamorphic)
    }

    pub fn is_missing_types(&self) -> bool {
        matches!(self, InlineCache::MissingTypes)
    }

    pub fn classes(&self) -> Option<&BTreeSet<ClassRef>> {
        match self {
            InlineCache::Types(classes) => Some(classes),
            _ => None,
        }
    }

    /// Merge another site's observations into this one: missing types wins
    /// over everything, megamorphic wins over class sets, and class sets
    /// union with the megamorphic threshold re-checked.
    pub fn merge_from(&mut self, other: &InlineCache) {
        match other {
            InlineCache::MissingTypes => self.set_missing_types(),
            InlineCache::Megamorphic => self.set_megamorphic(),
            InlineCache::Types(classes) => {
                for &class in classes {
                    self.add_class(class);
                }
            }
        }
    }
}

/// Inline caches of one method, keyed by bytecode offset.
pub type InlineCacheMap = BTreeMap<u16, InlineCache>;
