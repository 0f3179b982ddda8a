//! Big-file support
//!
//! Payloads above the configured threshold are stored as numbered chunk
//! objects (`<key>,1`, `<key>,2`, ...) described by a text manifest under
//! `_big_info:<key>`. A `_big_pre:<key>` marker exists while a store is in
//! progress.

pub mod codec;
pub mod manifest;

pub use codec::BigFileCodec;
pub use manifest::{BigFileManifest, ChunkChecksum, ChunkDescriptor, chunk_key, info_key, pre_key};
