//! Casket Runtime - OCI image store and mutation engine.
//!
//! Provides the content-addressable store for OCI image layouts, the
//! filesystem changeset classifier, layer packaging and unpacking with
//! optional id mapping, and the image mutator that commits new
//! manifest/config chains.

#![allow(clippy::result_large_err)]

pub mod oci;

// Re-export common types
pub use oci::{Blob, BlobStore, CasEngine, DescriptorPath, ReferenceStore};
pub use oci::{Change, ChangeKind, EntryMeta, NodeType, Snapshot};
pub use oci::{ConfigEdit, Mutator};
pub use oci::{Descriptor, Digest, History, ImageConfig, Index, Manifest, MediaType};
pub use oci::{pack_changeset, pack_insert, LayerWriter, PackagedLayer};
pub use oci::{IdMap, MapOptions};
pub use oci::{snapshot_path, unpack, Unpacked};

/// Casket Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
