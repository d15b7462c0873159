//! Profile compilation information store.
//!
//! Records, per managed-code module, which methods are hot, which execution
//! flags they carry, which receiver classes were observed at individual call
//! sites, and which classes were resolved. A profile-guided AOT compiler
//! consumes this to decide what to compile and how to specialize virtual
//! dispatch.
//!
//! The store serializes to a compact little-endian wire format (deflate
//! payload, delta-encoded varint method records, bit-packed per-method
//! flags) and merges profiles from other stores or files, remapping
//! cross-module references between index spaces. See [`ProfileStore`].

mod bitmap;
mod codec;
mod error;
mod flags;
mod flatten;
mod format;
mod inline_cache;
mod io;
mod key;
pub mod limits;
mod module;
mod store;

use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

pub use crate::bitmap::MethodBitmap;
pub use crate::error::{LoadStage, ProfileError, Result};
pub use crate::flags::MethodFlags;
pub use crate::flatten::{FlattenProfileData, ItemMetadata};
pub use crate::format::{
    ProfileIndex, ProfileKind, ARCHIVE_PROFILE_ENTRY, PROFILE_MAGIC, VERSION_BOOT, VERSION_REGULAR,
};
pub use crate::inline_cache::{ClassRef, InlineCache, InlineCacheMap};
pub use crate::key::{
    annotation_from_key, base_key_for_location, base_key_from_augmented, SampleAnnotation,
    ARCHIVE_LOCATION_SEPARATOR,
};
pub use crate::module::{MethodHotness, ModuleData};
pub use crate::store::{ClassesAndMethods, ProfileStore};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];

/// Identity of a managed-code module, as supplied by the module-file parser.
pub trait ModuleProvider {
    fn location(&self) -> &str;
    fn checksum(&self) -> u32;
    fn num_method_ids(&self) -> u32;
    fn num_type_ids(&self) -> u32;
}

/// A receiver class observed at a call site, before the owning module has
/// been resolved to a profile index.
pub struct TypeRef<'a> {
    pub module: &'a dyn ModuleProvider,
    pub type_index: u16,
}

/// Call-site observations of one method at one bytecode offset.
pub struct ProfileInlineCache<'a> {
    pub pc: u16,
    pub is_missing_types: bool,
    pub is_megamorphic: bool,
    pub classes: Vec<TypeRef<'a>>,
}

/// One method sample handed to the store by the runtime.
pub struct ProfileMethodInfo<'a> {
    pub module: &'a dyn ModuleProvider,
    pub method_index: u32,
    pub inline_caches: Vec<ProfileInlineCache<'a>>,
}

impl ProfileStore {
    /// Serialize the store. Returns the number of bytes written.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<u64> {
        codec::save(self, w)
    }

    /// Serialize to a file, atomically: the bytes land in a sibling temp
    /// file which is fsynced and renamed over the destination.
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let result: Result<u64> = (|| {
            let mut file = File::create(&tmp)?;
            let bytes = self.save(&mut file)?;
            file.sync_all()?;
            fs::rename(&tmp, path)?;
            Ok(bytes)
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }

    /// Deserialize a profile stream into this (empty) store.
    ///
    /// Fails with [`ProfileError::WouldOverwrite`] if the store already has
    /// data. A failed load leaves the store empty; callers wanting rollback
    /// keep the original and replace on success. An empty stream is a valid
    /// empty profile.
    pub fn load<R: Read + ?Sized>(&mut self, r: &mut R, merge_classes: bool) -> Result<()> {
        self.load_filtered(r, merge_classes, |_, _| true)
    }

    /// Like [`ProfileStore::load`], with a module filter: lines for which
    /// `filter(base_key, checksum)` is false are dropped, including their
    /// appearances in other modules' inline caches.
    pub fn load_filtered<R: Read + ?Sized>(
        &mut self,
        r: &mut R,
        merge_classes: bool,
        filter: impl Fn(&str, u32) -> bool,
    ) -> Result<()> {
        if !self.is_empty() {
            return Err(ProfileError::WouldOverwrite);
        }
        match codec::load(self, r, merge_classes, &filter) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.clear_data();
                Err(err)
            }
        }
    }

    /// Load a profile from a file, autodetecting an archive container: a
    /// zip-magic file is searched for the [`ARCHIVE_PROFILE_ENTRY`] entry,
    /// whose bytes are then treated as the profile stream. An archive
    /// without that entry, like an empty file, is a valid empty profile.
    ///
    /// With `clear_if_invalid`, an unparseable or flavor-mismatched file is
    /// truncated, the store stays empty, and the load reports success.
    pub fn load_from_path(
        &mut self,
        path: impl AsRef<Path>,
        clear_if_invalid: bool,
    ) -> Result<()> {
        let path = path.as_ref();
        match self.load_from_path_inner(path) {
            Err(
                ProfileError::BadData { .. }
                | ProfileError::VersionMismatch { .. }
                | ProfileError::TooLarge { .. },
            ) if clear_if_invalid => {
                warn!(path = %path.display(), "clearing invalid profile file");
                self.clear_data();
                fs::write(path, b"")?;
                Ok(())
            }
            other => other,
        }
    }

    fn load_from_path_inner(&mut self, path: &Path) -> Result<()> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 4];
        let n = codec::read_fill(&mut file, &mut magic)?;
        if n == 0 {
            if !self.is_empty() {
                return Err(ProfileError::WouldOverwrite);
            }
            return Ok(());
        }
        if n == 4 && magic == ZIP_MAGIC {
            let mut archive = zip::ZipArchive::new(file)?;
            let mut entry = match archive.by_name(ARCHIVE_PROFILE_ENTRY) {
                Ok(entry) => entry,
                Err(zip::result::ZipError::FileNotFound) => {
                    if !self.is_empty() {
                        return Err(ProfileError::WouldOverwrite);
                    }
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            if entry.size() > limits::SIZE_ERROR_THRESHOLD_BYTES {
                return Err(ProfileError::TooLarge {
                    len: entry.size(),
                    max: limits::SIZE_ERROR_THRESHOLD_BYTES,
                });
            }
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes)?;
            self.load(&mut Cursor::new(bytes), true)
        } else {
            file.seek(SeekFrom::Start(0))?;
            self.load(&mut BufReader::new(file), true)
        }
    }

    /// Merge a profile file into this store: the file is loaded into a
    /// scratch store of the same flavor and merged in memory, so this
    /// store's existing data is preserved.
    pub fn merge_from_path(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut other = ProfileStore::new(self.kind());
        other.load_from_path(path, false)?;
        if !self.merge_with(&other, true) {
            return Err(ProfileError::MergeConflict(
                "incompatible profile contents",
            ));
        }
        Ok(())
    }
}

/// Probe whether a stream starts with the profile magic. Consumes up to four
/// bytes from the reader.
pub fn is_profile_stream<R: Read + ?Sized>(r: &mut R) -> Result<bool> {
    let mut magic = [0u8; 4];
    let n = codec::read_fill(r, &mut magic)?;
    Ok(n == 4 && magic == PROFILE_MAGIC)
}

/// Write a deterministic pseudo-random profile, for tooling and stress
/// tests. `method_percentage` and `class_percentage` select roughly that
/// share of the synthetic modules' methods and classes.
pub fn generate_test_profile<W: Write + ?Sized>(
    w: &mut W,
    kind: ProfileKind,
    num_modules: u16,
    method_percentage: u8,
    class_percentage: u8,
    seed: u64,
) -> Result<u64> {
    const NUM_METHOD_IDS: u32 = 4096;
    const NUM_TYPE_IDS: u16 = 1024;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut store = ProfileStore::new(kind);
    for i in 0..num_modules {
        let profile_key = format!("synthetic-{i}.mod");
        let checksum = rng.gen::<u32>();
        let Some(module) = store.get_or_add_module_by_key(profile_key, checksum, NUM_METHOD_IDS)
        else {
            break;
        };
        for method_index in 0..NUM_METHOD_IDS {
            if rng.gen_range(0..100u32) < u32::from(method_percentage) {
                module.add_method(MethodFlags::HOT, method_index);
            }
        }
        for type_index in 0..NUM_TYPE_IDS {
            if rng.gen_range(0..100u32) < u32::from(class_percentage) {
                module.add_class(type_index);
            }
        }
    }
    store.save(w)
}
