//! OCI image object model: descriptors, manifests, indexes and configs.
//!
//! Fields the engine does not interpret are kept in `extra` maps so a
//! decode/encode cycle never drops data. Objects are written with
//! [`canonical_json`], which sorts keys, so logically identical objects
//! always hash to the same digest.

use std::collections::BTreeMap;

use casket_core::error::{CasketError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::digest::Digest;

pub use oci_spec::image::MediaType;

/// OCI schema version written into manifests and indexes.
pub const SCHEMA_VERSION: u32 = 2;

/// A typed pointer to a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: MediaType,

    pub digest: Digest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// `platform`, `urls` and anything else
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Descriptor {
    pub fn new(media_type: MediaType, digest: Digest, size: u64) -> Self {
        Self {
            media_type,
            digest,
            size,
            annotations: None,
            extra: Map::new(),
        }
    }

    /// Whether this descriptor points at a filesystem layer.
    pub fn is_layer(&self) -> bool {
        is_layer_media_type(&self.media_type)
    }
}

/// Layer media types, including the non-distributable variants.
pub fn is_layer_media_type(media_type: &MediaType) -> bool {
    matches!(
        media_type,
        MediaType::ImageLayer
            | MediaType::ImageLayerGzip
            | MediaType::ImageLayerZstd
            | MediaType::ImageLayerNonDistributable
            | MediaType::ImageLayerNonDistributableGzip
            | MediaType::ImageLayerNonDistributableZstd
    )
}

/// Image manifest: one config and an ordered list of layers (bottom first).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    pub config: Descriptor,

    #[serde(default)]
    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// A manifest with no layers.
    pub fn new(config: Descriptor) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: Some(MediaType::ImageManifest),
            config,
            layers: Vec::new(),
            annotations: None,
            extra: Map::new(),
        }
    }
}

/// Image index (manifest list).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<MediaType>,

    #[serde(default)]
    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Image configuration. Only `rootfs` and `history` are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default)]
    pub architecture: String,

    #[serde(default)]
    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<RuntimeConfig>,

    pub rootfs: RootFs,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageConfig {
    /// An empty image for the host platform.
    pub fn new() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            created: Some(chrono::Utc::now().to_rfc3339()),
            author: None,
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            config: None,
            rootfs: RootFs::default(),
            history: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Number of history entries that describe a real layer.
    pub fn layer_history_count(&self) -> usize {
        self.history.iter().filter(|h| !h.empty_layer).count()
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime defaults applied to containers created from the image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<BTreeMap<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Root filesystem description: uncompressed layer digests, bottom first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,

    #[serde(default)]
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// A single history entry in the image config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl History {
    /// A history entry stamped with the current time.
    pub fn new(created_by: impl Into<String>) -> Self {
        Self {
            created: Some(chrono::Utc::now().to_rfc3339()),
            created_by: Some(created_by.into()),
            ..Default::default()
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Override the creation time. Must be RFC 3339.
    pub fn with_created(mut self, created: &str) -> Result<Self> {
        let parsed = chrono::DateTime::parse_from_rfc3339(created).map_err(|e| {
            CasketError::ConfigError(format!("invalid history timestamp {:?}: {}", created, e))
        })?;
        self.created = Some(parsed.to_rfc3339());
        Ok(self)
    }
}

/// Serialize with sorted keys and no insignificant whitespace.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}
