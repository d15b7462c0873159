//! Profile size limits shared by the encoder and decoder.
//!
//! These bounds are enforced before any allocation sized from untrusted
//! header fields, so decoding a corrupt or hostile profile cannot request
//! unbounded memory. The encoder enforces the same limits so the crate never
//! produces profiles it cannot load back.

/// Uncompressed payload size above which save/load emit a warning.
pub const SIZE_WARNING_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;

/// Uncompressed payload size above which save/load fail outright.
pub const SIZE_ERROR_THRESHOLD_BYTES: u64 = 128 * 1024 * 1024;

/// Maximum number of receiver classes recorded at one call site before the
/// site is considered megamorphic and the class set is dropped.
pub const INLINE_CACHE_CLASS_LIMIT: usize = 5;
