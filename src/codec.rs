//! Binary serialization of profile stores.
//!
//! Wire layout:
//!
//! ```text
//! magic (4B) | version (4B) | num_modules (u8|u16) |
//! uncompressed_size (u32) | compressed_size (u32) | deflate(payload)
//! ```
//!
//! The payload is a concatenation of per-module lines, each a fixed header
//! (profile index, class count, methods-region length, checksum, method
//! count, key) followed by the methods region, the class-id list, and the
//! flag bitmap. Method indices are delta-encoded varints; inline-cache class
//! references are grouped by owning profile index with delta-encoded type
//! indices. All integers are little-endian.
//!
//! Loading reads every line header before any line body so that the
//! caller-supplied filter and the destination store can be consulted to
//! build the profile-index remap table up front; class references decoded
//! afterwards are translated through it.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::{debug, warn};

use crate::bitmap::MethodBitmap;
use crate::error::{LoadStage, ProfileError, Result};
use crate::format::{ProfileIndex, ProfileKind, PROFILE_MAGIC};
use crate::inline_cache::{ClassRef, InlineCache, InlineCacheMap};
use crate::io::{ReadLeExt, WriteLeExt};
use crate::key::base_key_from_augmented;
use crate::limits::{
    INLINE_CACHE_CLASS_LIMIT, SIZE_ERROR_THRESHOLD_BYTES, SIZE_WARNING_THRESHOLD_BYTES,
};
use crate::module::ModuleData;
use crate::store::ProfileStore;

// Sentinel kinds for an inline-cache record with `class_count == 0`.
const SENTINEL_NONE: u8 = 0;
const SENTINEL_MISSING_TYPES: u8 = 1;
const SENTINEL_MEGAMORPHIC: u8 = 2;

pub(crate) fn save<W: Write + ?Sized>(store: &ProfileStore, w: &mut W) -> Result<u64> {
    let payload = encode_payload(store)?;
    let payload_len = payload.len() as u64;
    if payload_len > SIZE_ERROR_THRESHOLD_BYTES {
        return Err(ProfileError::TooLarge {
            len: payload_len,
            max: SIZE_ERROR_THRESHOLD_BYTES,
        });
    }
    if payload_len > SIZE_WARNING_THRESHOLD_BYTES {
        warn!(bytes = payload_len, "profile payload is unusually large");
    }

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&payload)?;
    let compressed = encoder.finish()?;

    w.write_bytes(&PROFILE_MAGIC)?;
    w.write_bytes(&store.kind().version_tag())?;
    match store.kind() {
        ProfileKind::Regular => w.write_u8(store.num_modules() as u8)?,
        ProfileKind::Boot => w.write_u16_le(store.num_modules() as u16)?,
    }
    w.write_u32_le(payload.len() as u32)?;
    w.write_u32_le(compressed.len() as u32)?;
    w.write_bytes(&compressed)?;
    Ok((4 + 4 + store.kind().index_width() + 4 + 4 + compressed.len()) as u64)
}

fn encode_payload(store: &ProfileStore) -> Result<Vec<u8>> {
    let kind = store.kind();
    let mut out = Vec::new();
    for module in store.modules() {
        let methods = encode_methods_region(kind, module)?;
        if module.class_set().len() > usize::from(u16::MAX) {
            return Err(ProfileError::bad(
                LoadStage::Classes,
                "class set exceeds encodable size",
            ));
        }
        if module.profile_key().len() > usize::from(u16::MAX) {
            return Err(ProfileError::bad(
                LoadStage::LineHeader,
                "profile key exceeds encodable length",
            ));
        }
        write_profile_index(&mut out, kind, module.profile_index())?;
        out.write_u16_le(module.class_set().len() as u16)?;
        out.write_u32_le(methods.len() as u32)?;
        out.write_u32_le(module.checksum())?;
        out.write_u32_le(module.num_method_ids())?;
        out.write_u16_le(module.profile_key().len() as u16)?;
        out.write_bytes(module.profile_key().as_bytes())?;
        out.write_bytes(&methods)?;
        for &type_index in module.class_set() {
            out.write_u16_le(type_index)?;
        }
        out.write_bytes(module.bitmap().as_bytes())?;
    }
    Ok(out)
}

fn encode_methods_region(kind: ProfileKind, module: &ModuleData) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut previous: Option<u16> = None;
    for (&method_index, caches) in module.method_map() {
        // First record carries the absolute index, the rest are deltas.
        let delta = match previous {
            None => u32::from(method_index),
            Some(prev) => u32::from(method_index - prev),
        };
        previous = Some(method_index);
        out.write_varint_u32(delta)?;
        if caches.len() > usize::from(u16::MAX) {
            return Err(ProfileError::bad(
                LoadStage::Methods,
                "inline-cache map exceeds encodable size",
            ));
        }
        out.write_u16_le(caches.len() as u16)?;
        for (&pc, cache) in caches {
            out.write_u16_le(pc)?;
            encode_inline_cache(&mut out, kind, cache)?;
        }
    }
    Ok(out)
}

fn encode_inline_cache(out: &mut Vec<u8>, kind: ProfileKind, cache: &InlineCache) -> Result<()> {
    let classes = match cache {
        InlineCache::MissingTypes => {
            out.write_u8(0)?;
            return out.write_u8(SENTINEL_MISSING_TYPES);
        }
        InlineCache::Megamorphic => {
            out.write_u8(0)?;
            return out.write_u8(SENTINEL_MEGAMORPHIC);
        }
        InlineCache::Types(classes) if classes.is_empty() => {
            out.write_u8(0)?;
            return out.write_u8(SENTINEL_NONE);
        }
        InlineCache::Types(classes) => classes,
    };
    out.write_u8(classes.len() as u8)?;
    // The set orders by (module, type index), so equal-module runs are
    // contiguous and type indices within a run ascend.
    let mut run: Vec<u16> = Vec::with_capacity(classes.len());
    let mut run_module: Option<ProfileIndex> = None;
    for class in classes {
        if run_module != Some(class.module) {
            if let Some(module) = run_module {
                encode_class_run(out, kind, module, &run)?;
            }
            run.clear();
            run_module = Some(class.module);
        }
        run.push(class.type_index);
    }
    if let Some(module) = run_module {
        encode_class_run(out, kind, module, &run)?;
    }
    Ok(())
}

fn encode_class_run(
    out: &mut Vec<u8>,
    kind: ProfileKind,
    module: ProfileIndex,
    type_indices: &[u16],
) -> Result<()> {
    write_profile_index(out, kind, module)?;
    out.write_u8(type_indices.len() as u8)?;
    let mut previous = 0u16;
    for (i, &type_index) in type_indices.iter().enumerate() {
        let delta = if i == 0 {
            u32::from(type_index)
        } else {
            u32::from(type_index - previous)
        };
        previous = type_index;
        out.write_varint_u32(delta)?;
    }
    Ok(())
}

fn write_profile_index<W: Write + ?Sized>(
    w: &mut W,
    kind: ProfileKind,
    value: ProfileIndex,
) -> Result<()> {
    match kind {
        ProfileKind::Regular => w.write_u8(value as u8),
        ProfileKind::Boot => w.write_u16_le(value),
    }
}

fn read_profile_index<R: Read + ?Sized>(r: &mut R, kind: ProfileKind) -> Result<ProfileIndex> {
    match kind {
        ProfileKind::Regular => Ok(ProfileIndex::from(r.read_u8()?)),
        ProfileKind::Boot => r.read_u16_le(),
    }
}

struct LineHeader {
    profile_index: ProfileIndex,
    class_set_count: u16,
    methods_region_bytes: u32,
    checksum: u32,
    num_method_ids: u32,
    profile_key: String,
    body_offset: usize,
}

pub(crate) fn load<R: Read + ?Sized>(
    store: &mut ProfileStore,
    r: &mut R,
    merge_classes: bool,
    filter: &dyn Fn(&str, u32) -> bool,
) -> Result<()> {
    let kind = store.kind();

    // An empty source is a valid empty profile.
    let mut magic = [0u8; 4];
    if read_fill(r, &mut magic[..1])? == 0 {
        return Ok(());
    }
    read_header_exact(r, &mut magic[1..])?;
    if magic != PROFILE_MAGIC {
        return Err(ProfileError::bad(LoadStage::Header, "bad profile magic"));
    }
    let mut version = [0u8; 4];
    read_header_exact(r, &mut version)?;
    if version != kind.version_tag() {
        return Err(ProfileError::VersionMismatch { found: version });
    }

    let header = (|| -> Result<(u32, u32, u32)> {
        let num_modules = match kind {
            ProfileKind::Regular => u32::from(r.read_u8()?),
            ProfileKind::Boot => u32::from(r.read_u16_le()?),
        };
        let uncompressed_size = r.read_u32_le()?;
        let compressed_size = r.read_u32_le()?;
        Ok((num_modules, uncompressed_size, compressed_size))
    })()
    .map_err(|e| e.at_stage(LoadStage::Header))?;
    let (num_modules, uncompressed_size, compressed_size) = header;

    for size in [u64::from(uncompressed_size), u64::from(compressed_size)] {
        if size > SIZE_ERROR_THRESHOLD_BYTES {
            return Err(ProfileError::TooLarge {
                len: size,
                max: SIZE_ERROR_THRESHOLD_BYTES,
            });
        }
    }
    if u64::from(uncompressed_size) > SIZE_WARNING_THRESHOLD_BYTES {
        warn!(
            bytes = uncompressed_size,
            "profile payload is unusually large"
        );
    }

    let compressed = r
        .read_exact_vec(compressed_size as usize)
        .map_err(|e| e.at_stage(LoadStage::Header))?;
    let mut probe = [0u8; 1];
    if read_fill(r, &mut probe)? != 0 {
        return Err(ProfileError::bad(
            LoadStage::Header,
            "unexpected trailing data after profile",
        ));
    }

    let mut payload = Vec::new();
    payload
        .try_reserve_exact(uncompressed_size as usize)
        .map_err(|_| ProfileError::OutOfMemory {
            len: uncompressed_size as usize,
        })?;
    // One extra byte so a lying `uncompressed_size` is detected instead of
    // silently truncated.
    let mut decoder = ZlibDecoder::new(&compressed[..]).take(u64::from(uncompressed_size) + 1);
    decoder
        .read_to_end(&mut payload)
        .map_err(|_| ProfileError::bad(LoadStage::Header, "corrupt compressed payload"))?;
    if payload.len() as u64 != u64::from(uncompressed_size) {
        return Err(ProfileError::bad(
            LoadStage::Header,
            "uncompressed size mismatch",
        ));
    }

    // Pass 1: all line headers, bodies skipped by their declared lengths.
    let mut cursor = Cursor::new(&payload[..]);
    let mut lines = Vec::with_capacity((num_modules as usize).min(256));
    for _ in 0..num_modules {
        let line = read_line_header(&mut cursor, kind)
            .map_err(|e| e.at_stage(LoadStage::LineHeader))?;
        let bitmap_len = MethodBitmap::storage_len(kind, line.num_method_ids) as u64;
        let body_len = u64::from(line.methods_region_bytes)
            + u64::from(line.class_set_count) * 2
            + bitmap_len;
        let body_end = line.body_offset as u64 + body_len;
        if body_end > payload.len() as u64 {
            return Err(ProfileError::bad(
                LoadStage::LineHeader,
                "module line overruns payload",
            ));
        }
        cursor.set_position(body_end);
        lines.push(line);
    }
    if cursor.position() != payload.len() as u64 {
        return Err(ProfileError::bad(
            LoadStage::LineHeader,
            "trailing bytes after last module line",
        ));
    }

    // Pass 2: build the index remap, filtering and inserting modules.
    let mut remap: HashMap<ProfileIndex, Option<ProfileIndex>> =
        HashMap::with_capacity(lines.len());
    for line in &lines {
        if remap.contains_key(&line.profile_index) {
            return Err(ProfileError::bad(
                LoadStage::LineHeader,
                "duplicate profile index",
            ));
        }
        let base_key = base_key_from_augmented(&line.profile_key);
        if !filter(base_key, line.checksum) {
            remap.insert(line.profile_index, None);
            continue;
        }
        let Some(data) = store.get_or_add_module_by_key(
            line.profile_key.clone(),
            line.checksum,
            line.num_method_ids,
        ) else {
            return Err(ProfileError::bad(
                LoadStage::LineHeader,
                "module conflicts with existing profile data",
            ));
        };
        remap.insert(line.profile_index, Some(data.profile_index()));
    }

    // Pass 3: line bodies for the modules that survived the filter.
    for line in &lines {
        let Some(Some(target)) = remap.get(&line.profile_index).copied() else {
            continue;
        };
        let methods_end = line.body_offset + line.methods_region_bytes as usize;
        let classes_end = methods_end + usize::from(line.class_set_count) * 2;
        let bitmap_len = MethodBitmap::storage_len(kind, line.num_method_ids);
        let bitmap_end = classes_end + bitmap_len;

        decode_methods_region(
            store
                .module_mut(target)
                .ok_or_else(|| ProfileError::bad(LoadStage::Methods, "module vanished"))?,
            kind,
            &payload[line.body_offset..methods_end],
            &remap,
        )
        .map_err(|e| e.at_stage(LoadStage::Methods))?;

        let module = store
            .module_mut(target)
            .ok_or_else(|| ProfileError::bad(LoadStage::Classes, "module vanished"))?;
        let mut classes = Cursor::new(&payload[methods_end..classes_end]);
        for _ in 0..line.class_set_count {
            let type_index = classes
                .read_u16_le()
                .map_err(|e| e.at_stage(LoadStage::Classes))?;
            if merge_classes {
                module.add_class(type_index);
            }
        }

        if !module
            .bitmap_mut()
            .merge_bytes(&payload[classes_end..bitmap_end])
        {
            return Err(ProfileError::bad(
                LoadStage::Bitmap,
                "flag bitmap length mismatch",
            ));
        }
    }

    debug!(
        modules = store.num_modules(),
        methods = store.num_methods(),
        "profile loaded"
    );
    Ok(())
}

fn read_line_header(cursor: &mut Cursor<&[u8]>, kind: ProfileKind) -> Result<LineHeader> {
    let profile_index = read_profile_index(cursor, kind)?;
    let class_set_count = cursor.read_u16_le()?;
    let methods_region_bytes = cursor.read_u32_le()?;
    let checksum = cursor.read_u32_le()?;
    let num_method_ids = cursor.read_u32_le()?;
    let key_len = cursor.read_u16_le()?;
    if key_len == 0 {
        return Err(ProfileError::bad(LoadStage::LineHeader, "empty profile key"));
    }
    let key_bytes = cursor.read_exact_vec(usize::from(key_len))?;
    let profile_key = String::from_utf8(key_bytes).map_err(|_| {
        ProfileError::bad(LoadStage::LineHeader, "profile key is not valid UTF-8")
    })?;
    Ok(LineHeader {
        profile_index,
        class_set_count,
        methods_region_bytes,
        checksum,
        num_method_ids,
        profile_key,
        body_offset: cursor.position() as usize,
    })
}

fn decode_methods_region(
    module: &mut ModuleData,
    kind: ProfileKind,
    bytes: &[u8],
    remap: &HashMap<ProfileIndex, Option<ProfileIndex>>,
) -> Result<()> {
    let mut cursor = Cursor::new(bytes);
    let mut previous: Option<u16> = None;
    while (cursor.position() as usize) < bytes.len() {
        let delta = cursor.read_varint_u32()?;
        let method_index = match previous {
            None => delta,
            Some(prev) => u32::from(prev)
                .checked_add(delta)
                .ok_or_else(|| ProfileError::bad(LoadStage::Methods, "method index overflow"))?,
        };
        if method_index > u32::from(u16::MAX) || method_index >= module.num_method_ids() {
            return Err(ProfileError::bad(
                LoadStage::Methods,
                "method index out of range",
            ));
        }
        let method_index = method_index as u16;
        previous = Some(method_index);

        let num_inline_caches = cursor.read_u16_le()?;
        let caches = module.find_or_add_method(method_index);
        for _ in 0..num_inline_caches {
            decode_inline_cache(&mut cursor, kind, caches, remap)?;
        }
    }
    Ok(())
}

fn decode_inline_cache(
    cursor: &mut Cursor<&[u8]>,
    kind: ProfileKind,
    caches: &mut InlineCacheMap,
    remap: &HashMap<ProfileIndex, Option<ProfileIndex>>,
) -> Result<()> {
    let pc = cursor.read_u16_le()?;
    let class_count = cursor.read_u8()?;
    let cache = caches.entry(pc).or_default();
    if class_count == 0 {
        match cursor.read_u8()? {
            SENTINEL_NONE => {}
            SENTINEL_MISSING_TYPES => cache.set_missing_types(),
            SENTINEL_MEGAMORPHIC => cache.set_megamorphic(),
            _ => {
                return Err(ProfileError::bad(
                    LoadStage::Methods,
                    "unknown inline-cache sentinel",
                ))
            }
        }
        return Ok(());
    }
    if usize::from(class_count) > INLINE_CACHE_CLASS_LIMIT {
        return Err(ProfileError::bad(
            LoadStage::Methods,
            "inline cache exceeds class limit",
        ));
    }
    let mut remaining = usize::from(class_count);
    while remaining > 0 {
        let stored = read_profile_index(cursor, kind)?;
        let run_len = usize::from(cursor.read_u8()?);
        if run_len == 0 || run_len > remaining {
            return Err(ProfileError::bad(
                LoadStage::Methods,
                "bad inline-cache class run length",
            ));
        }
        remaining -= run_len;
        // A module the filter dropped is still a declared line; its classes
        // are skipped rather than rejected. Truly unknown indices are corrupt.
        let target = match remap.get(&stored) {
            Some(&target) => target,
            None => {
                return Err(ProfileError::bad(
                    LoadStage::Methods,
                    "class reference to unknown module",
                ))
            }
        };
        let mut type_index = 0u32;
        for i in 0..run_len {
            let delta = cursor.read_varint_u32()?;
            type_index = if i == 0 {
                delta
            } else {
                type_index.checked_add(delta).ok_or_else(|| {
                    ProfileError::bad(LoadStage::Methods, "type index overflow")
                })?
            };
            if type_index > u32::from(u16::MAX) {
                return Err(ProfileError::bad(
                    LoadStage::Methods,
                    "type index out of range",
                ));
            }
            if let Some(module) = target {
                cache.add_class(ClassRef {
                    module,
                    type_index: type_index as u16,
                });
            }
        }
    }
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns the number of bytes read.
pub(crate) fn read_fill<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn read_header_exact<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    if read_fill(r, buf)? != buf.len() {
        return Err(ProfileError::bad(LoadStage::Header, "truncated header"));
    }
    Ok(())
}
