//! The layer cache: step identity, local probing, and remote pull/push.
//!
//! The load-bearing invariant: a cache hit happens iff re-running the step
//! would produce byte-identical filesystem and configuration output,
//! modulo non-determinism the user explicitly opted into (timestamps,
//! remote URL bodies).
//!
//! ```text
//! created_by — canonical step identity, stored in image history
//! digester   — canonical-tar SHA-256 of ADD/COPY content
//! history    — local probe: stored image ↔ (base, step) match
//! key        — remote cache key over parents + identity + history
//! remote     — cache image pull/push through the Transport seam
//! ```

pub mod created_by;
mod digester;
mod history;
mod key;
pub mod remote;

pub use digester::{ContentDigester, tar_digest_of_path};
pub use history::{CacheQuery, ImageInfo, ImageInfoCache, find_cache_candidate};
pub use key::{CacheKeyInput, cache_key};
