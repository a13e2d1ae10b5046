//! OCI image layout support for casket.
//!
//! This module implements a content-addressable store over an on-disk OCI
//! image layout and the pipeline that turns filesystem changes into new
//! image versions:
//!
//! - Blob and reference storage with atomic temp-file + rename writes
//! - Typed decoding of manifests, indexes and configs by media type
//! - Snapshot/diff of an unpacked rootfs
//! - Layer packaging (tar, optionally gzip) with whiteouts
//! - Layer unpacking into a runtime bundle
//! - Host/container uid and gid mapping for unprivileged use
//! - Image mutation: append layers or config edits and commit
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Casket Image Layout                       │
//! │                                                              │
//! │  image/                                                      │
//! │  ├── oci-layout           (layout marker)                    │
//! │  ├── refs/                                                   │
//! │  │   └── <name>           (descriptor JSON, mutable)         │
//! │  └── blobs/                                                  │
//! │      └── sha256/                                             │
//! │          ├── <manifest>   (immutable, keyed by digest)       │
//! │          ├── <config>                                        │
//! │          └── <layers>                                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod blob;
mod changeset;
mod digest;
mod engine;
mod idmap;
mod image;
mod layer;
mod mutate;
mod refs;
mod unpack;

pub use blob::{BlobStore, BlobWriter};
pub use changeset::{Change, ChangeKind, EntryMeta, NodeType, Snapshot};
pub use digest::{Digest, DigestWriter, VerifyingReader};
pub use engine::{Blob, CasEngine, DescriptorPath};
pub use idmap::{IdMap, MapOptions};
pub use image::{
    canonical_json, is_layer_media_type, Descriptor, History, ImageConfig, Index, Manifest,
    MediaType, RootFs, RuntimeConfig,
};
pub use layer::{layer_media_type, pack_changeset, pack_insert, LayerWriter, PackagedLayer};
pub use mutate::{ConfigEdit, Mutator};
pub use refs::ReferenceStore;
pub use unpack::{apply_layer, snapshot_path, unpack, Unpacked};
