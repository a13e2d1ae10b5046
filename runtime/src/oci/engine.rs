//! Content-addressable storage engine over an image layout.
//!
//! Combines the blob and reference stores and adds typed access: JSON
//! objects are written canonically, and blobs are decoded according to
//! the descriptor's media type.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use casket_core::error::{CasketError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::blob::BlobStore;
use super::digest::{Digest, VerifyingReader};
use super::image::{
    canonical_json, is_layer_media_type, Descriptor, ImageConfig, Index, Manifest, MediaType,
};
use super::refs::ReferenceStore;

const OCI_LAYOUT_FILE: &str = "oci-layout";
const OCI_LAYOUT_CONTENT: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// A decoded blob.
pub enum Blob {
    Manifest(Manifest),
    Index(Index),
    Config(ImageConfig),
    /// Raw layer stream (possibly compressed), verified at end of stream
    Layer(VerifyingReader<BufReader<File>>),
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Blob::Manifest(m) => f.debug_tuple("Manifest").field(m).finish(),
            Blob::Index(i) => f.debug_tuple("Index").field(i).finish(),
            Blob::Config(c) => f.debug_tuple("Config").field(c).finish(),
            Blob::Layer(r) => f.debug_tuple("Layer").field(r.expected()).finish(),
        }
    }
}

/// Chain of descriptors from a reference target down to a manifest.
///
/// The first element is what the reference points at; intermediate
/// elements are indexes; the last element is the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorPath {
    walk: Vec<Descriptor>,
}

impl DescriptorPath {
    pub fn new(root: Descriptor) -> Self {
        Self { walk: vec![root] }
    }

    /// Rebuild a path from its descriptors, root first.
    pub fn from_walk(walk: Vec<Descriptor>) -> Result<Self> {
        if walk.is_empty() {
            return Err(CasketError::InvalidState(
                "descriptor path cannot be empty".to_string(),
            ));
        }
        Ok(Self { walk })
    }

    fn child(&self, descriptor: Descriptor) -> Self {
        let mut walk = self.walk.clone();
        walk.push(descriptor);
        Self { walk }
    }

    pub fn root(&self) -> &Descriptor {
        &self.walk[0]
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.walk[self.walk.len() - 1]
    }

    pub fn walk(&self) -> &[Descriptor] {
        &self.walk
    }
}

/// An open image layout.
///
/// Dropping the engine releases it; [`CasEngine::close`] makes the end
/// of its use explicit.
#[derive(Debug)]
pub struct CasEngine {
    root: PathBuf,
    blobs: BlobStore,
    refs: ReferenceStore,
}

impl CasEngine {
    /// Create a new, empty image layout at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if root.join(OCI_LAYOUT_FILE).exists() {
            return Err(CasketError::InvalidState(format!(
                "image already exists at {}",
                root.display()
            )));
        }

        for dir in [root.join("blobs").join("sha256"), root.join("refs")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                CasketError::io(format!("Failed to create {}", dir.display()), e)
            })?;
        }
        std::fs::write(root.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT).map_err(|e| {
            CasketError::io(format!("Failed to write oci-layout in {}", root.display()), e)
        })?;

        tracing::info!(image = %root.display(), "Created image layout");
        Self::open(root)
    }

    /// Open an existing image layout.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        Self::validate_layout(&root)?;

        tracing::debug!(image = %root.display(), "Opened image layout");
        Ok(Self {
            blobs: BlobStore::new(&root.join("blobs")),
            refs: ReferenceStore::new(&root.join("refs")),
            root,
        })
    }

    /// Validate that the directory contains an image layout.
    fn validate_layout(root: &Path) -> Result<()> {
        if !root.join(OCI_LAYOUT_FILE).is_file() {
            return Err(CasketError::InvalidState(format!(
                "Not a valid image layout: missing oci-layout file in {}",
                root.display()
            )));
        }
        if !root.join("blobs").is_dir() {
            return Err(CasketError::InvalidState(format!(
                "Not a valid image layout: missing blobs directory in {}",
                root.display()
            )));
        }
        if !root.join("refs").is_dir() {
            return Err(CasketError::InvalidState(format!(
                "Not a valid image layout: missing refs directory in {}",
                root.display()
            )));
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Store raw content.
    pub fn put_blob<R: std::io::Read + ?Sized>(&self, reader: &mut R) -> Result<(Digest, u64)> {
        self.blobs.put(reader)
    }

    /// Store an object as canonical JSON and describe it.
    pub fn put_blob_json<T: Serialize>(&self, value: &T, media_type: MediaType) -> Result<Descriptor> {
        let data = canonical_json(value)?;
        let (digest, size) = self.blobs.put_bytes(&data)?;
        Ok(Descriptor::new(media_type, digest, size))
    }

    /// Store an image with no layers and no history for the host platform.
    ///
    /// Returns the manifest descriptor; no reference is created.
    pub fn put_empty_image(&self) -> Result<Descriptor> {
        let config = self.put_blob_json(&ImageConfig::new(), MediaType::ImageConfig)?;
        let manifest = self.put_blob_json(&Manifest::new(config), MediaType::ImageManifest)?;
        tracing::debug!(manifest = %manifest.digest, "Stored empty image");
        Ok(manifest)
    }

    /// Fetch and decode the blob a descriptor points at.
    pub fn get_blob(&self, descriptor: &Descriptor) -> Result<Blob> {
        match &descriptor.media_type {
            MediaType::ImageManifest => Ok(Blob::Manifest(self.get_json(descriptor)?)),
            MediaType::ImageIndex => Ok(Blob::Index(self.get_json(descriptor)?)),
            MediaType::ImageConfig => Ok(Blob::Config(self.get_json(descriptor)?)),
            media_type if is_layer_media_type(media_type) => {
                let size = self.blobs.size(&descriptor.digest)?;
                check_size(descriptor, size)?;
                Ok(Blob::Layer(self.blobs.get(&descriptor.digest)?))
            }
            other => Err(CasketError::UnsupportedMediaType(other.to_string())),
        }
    }

    /// Fetch a manifest, failing if the descriptor is anything else.
    pub fn get_manifest(&self, descriptor: &Descriptor) -> Result<Manifest> {
        match self.get_blob(descriptor)? {
            Blob::Manifest(manifest) => Ok(manifest),
            other => Err(unexpected("manifest", descriptor, &other)),
        }
    }

    /// Fetch an image config, failing if the descriptor is anything else.
    pub fn get_config(&self, descriptor: &Descriptor) -> Result<ImageConfig> {
        match self.get_blob(descriptor)? {
            Blob::Config(config) => Ok(config),
            other => Err(unexpected("config", descriptor, &other)),
        }
    }

    /// Fetch an index, failing if the descriptor is anything else.
    pub fn get_index(&self, descriptor: &Descriptor) -> Result<Index> {
        match self.get_blob(descriptor)? {
            Blob::Index(index) => Ok(index),
            other => Err(unexpected("index", descriptor, &other)),
        }
    }

    fn get_json<T: DeserializeOwned>(&self, descriptor: &Descriptor) -> Result<T> {
        let data = self.blobs.read(&descriptor.digest)?;
        check_size(descriptor, data.len() as u64)?;
        serde_json::from_slice(&data).map_err(|e| {
            CasketError::SerializationError(format!(
                "Failed to decode {} blob {}: {}",
                descriptor.media_type, descriptor.digest, e
            ))
        })
    }

    /// The descriptor a reference points at.
    pub fn get_reference(&self, name: &str) -> Result<Descriptor> {
        self.refs.get(name)
    }

    /// Every manifest a reference designates.
    ///
    /// Empty if the reference does not exist. More than one path means
    /// the reference reaches several manifests through an index.
    pub fn resolve_reference(&self, name: &str) -> Result<Vec<DescriptorPath>> {
        let root = match self.refs.get(name) {
            Ok(descriptor) => descriptor,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut paths = Vec::new();
        self.walk(DescriptorPath::new(root), &mut paths)?;
        tracing::debug!(reference = %name, count = paths.len(), "Resolved reference");
        Ok(paths)
    }

    /// Resolve a reference to exactly one manifest.
    pub fn resolve_single(&self, name: &str) -> Result<DescriptorPath> {
        let mut paths = self.resolve_reference(name)?;
        match paths.len() {
            0 => Err(CasketError::not_found("reference", name)),
            1 => Ok(paths.remove(0)),
            count => Err(CasketError::AmbiguousReference {
                name: name.to_string(),
                count,
            }),
        }
    }

    fn walk(&self, path: DescriptorPath, out: &mut Vec<DescriptorPath>) -> Result<()> {
        let descriptor = path.descriptor().clone();
        match &descriptor.media_type {
            MediaType::ImageManifest => out.push(path),
            MediaType::ImageIndex => {
                let index = self.get_index(&descriptor)?;
                for child in index.manifests {
                    self.walk(path.child(child), out)?;
                }
            }
            media_type
                if *media_type == MediaType::ImageConfig || is_layer_media_type(media_type) =>
            {
                tracing::debug!(
                    digest = %descriptor.digest,
                    media_type = %descriptor.media_type,
                    "Skipping non-manifest descriptor"
                );
            }
            other => return Err(CasketError::UnsupportedMediaType(other.to_string())),
        }
        Ok(())
    }

    /// Point a reference at a descriptor, replacing any previous target.
    pub fn update_reference(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        let previous = match self.refs.get(name) {
            Ok(previous) => Some(previous),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        self.refs.put(name, descriptor)?;

        match previous {
            Some(previous) if previous.digest != descriptor.digest => tracing::info!(
                reference = %name,
                from = %previous.digest,
                to = %descriptor.digest,
                "Replaced reference"
            ),
            Some(_) => {}
            None => tracing::info!(reference = %name, to = %descriptor.digest, "Created reference"),
        }
        Ok(())
    }

    /// Remove a reference if it exists.
    pub fn delete_reference(&self, name: &str) -> Result<()> {
        self.refs.delete(name)
    }

    pub fn list_references(&self) -> Result<Vec<String>> {
        self.refs.list()
    }

    /// Release the engine.
    pub fn close(self) {
        tracing::debug!(image = %self.root.display(), "Closed image layout");
    }
}

fn check_size(descriptor: &Descriptor, actual: u64) -> Result<()> {
    if descriptor.size != actual {
        return Err(CasketError::InvalidState(format!(
            "descriptor for {} claims {} bytes but the blob has {}",
            descriptor.digest, descriptor.size, actual
        )));
    }
    Ok(())
}

fn unexpected(wanted: &str, descriptor: &Descriptor, got: &Blob) -> CasketError {
    let kind = match got {
        Blob::Manifest(_) => "manifest",
        Blob::Index(_) => "index",
        Blob::Config(_) => "config",
        Blob::Layer(_) => "layer",
    };
    CasketError::InvalidState(format!(
        "expected {} at {} but found {}",
        wanted, descriptor.digest, kind
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::image::RootFs;
    use tempfile::TempDir;

    fn put_image(engine: &CasEngine) -> Descriptor {
        let config = ImageConfig {
            rootfs: RootFs::default(),
            ..ImageConfig::new()
        };
        let config_desc = engine.put_blob_json(&config, MediaType::ImageConfig).unwrap();
        engine
            .put_blob_json(&Manifest::new(config_desc), MediaType::ImageManifest)
            .unwrap()
    }

    fn index_of(manifests: Vec<Descriptor>) -> Index {
        Index {
            schema_version: 2,
            media_type: Some(MediaType::ImageIndex),
            manifests,
            annotations: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn test_create_and_open() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("image");
        CasEngine::create(&path).unwrap().close();

        assert!(path.join("oci-layout").exists());
        assert!(path.join("blobs/sha256").is_dir());
        assert!(path.join("refs").is_dir());

        let engine = CasEngine::open(&path).unwrap();
        assert!(engine.list_references().unwrap().is_empty());
    }

    #[test]
    fn test_create_refuses_existing_layout() {
        let tmp = TempDir::new().unwrap();
        CasEngine::create(tmp.path()).unwrap();
        assert!(matches!(
            CasEngine::create(tmp.path()),
            Err(CasketError::InvalidState(_))
        ));
    }

    #[test]
    fn test_open_rejects_non_layout() {
        let tmp = TempDir::new().unwrap();
        let err = CasEngine::open(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));
    }

    #[test]
    fn test_put_blob_json_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let manifest_desc = put_image(&engine);
        let manifest = engine.get_manifest(&manifest_desc).unwrap();
        let config = engine.get_config(&manifest.config).unwrap();
        assert_eq!(config.rootfs.fs_type, "layers");

        // Re-encoding identical data reproduces the digest
        let again = engine
            .put_blob_json(&manifest, MediaType::ImageManifest)
            .unwrap();
        assert_eq!(again, manifest_desc);
    }

    #[test]
    fn test_put_empty_image() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let manifest_desc = engine.put_empty_image().unwrap();
        let manifest = engine.get_manifest(&manifest_desc).unwrap();
        assert!(manifest.layers.is_empty());
        let config = engine.get_config(&manifest.config).unwrap();
        assert!(config.history.is_empty());
        assert!(config.rootfs.diff_ids.is_empty());
        assert_eq!(config.os, "linux");
    }

    #[test]
    fn test_get_blob_unknown_media_type() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let (digest, size) = engine.put_blob(&mut &b"opaque"[..]).unwrap();
        let descriptor = Descriptor::new(MediaType::Other("text/plain".into()), digest, size);
        assert!(matches!(
            engine.get_blob(&descriptor),
            Err(CasketError::UnsupportedMediaType(_))
        ));
    }

    #[test]
    fn test_get_blob_non_distributable_layer() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let (digest, size) = engine.put_blob(&mut &b"layer bytes"[..]).unwrap();
        let descriptor = Descriptor::new(MediaType::ImageLayerNonDistributableGzip, digest, size);
        assert!(descriptor.is_layer());
        match engine.get_blob(&descriptor).unwrap() {
            Blob::Layer(mut reader) => reader.drain().unwrap(),
            other => panic!("expected a layer, got {:?}", other),
        }
    }

    #[test]
    fn test_get_blob_wrong_type_is_not_guessed() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let manifest_desc = put_image(&engine);
        let mut as_config = manifest_desc.clone();
        as_config.media_type = MediaType::ImageConfig;
        // A manifest decodes as a config only if it has a rootfs, which it does not
        assert!(engine.get_config(&as_config).is_err());
    }

    #[test]
    fn test_get_blob_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let mut manifest_desc = put_image(&engine);
        manifest_desc.size += 1;
        assert!(matches!(
            engine.get_blob(&manifest_desc),
            Err(CasketError::InvalidState(_))
        ));
    }

    #[test]
    fn test_resolve_reference_single() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let manifest_desc = put_image(&engine);
        engine.update_reference("latest", &manifest_desc).unwrap();

        let paths = engine.resolve_reference("latest").unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].root(), &manifest_desc);
        assert_eq!(paths[0].descriptor(), &manifest_desc);
    }

    #[test]
    fn test_resolve_reference_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        assert!(engine.resolve_reference("nope").unwrap().is_empty());
        assert!(engine.resolve_single("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_resolve_reference_through_index() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let manifest_desc = put_image(&engine);
        let index_desc = engine
            .put_blob_json(&index_of(vec![manifest_desc.clone()]), MediaType::ImageIndex)
            .unwrap();
        engine.update_reference("multi", &index_desc).unwrap();

        let path = engine.resolve_single("multi").unwrap();
        assert_eq!(path.walk().len(), 2);
        assert_eq!(path.root(), &index_desc);
        assert_eq!(path.descriptor(), &manifest_desc);
    }

    #[test]
    fn test_resolve_reference_ambiguous() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let first = put_image(&engine);
        let mut second = engine.get_manifest(&first).unwrap();
        second.annotations = Some([("variant".to_string(), "b".to_string())].into());
        let second = engine
            .put_blob_json(&second, MediaType::ImageManifest)
            .unwrap();

        let index_desc = engine
            .put_blob_json(&index_of(vec![first, second]), MediaType::ImageIndex)
            .unwrap();
        engine.update_reference("multi", &index_desc).unwrap();

        assert_eq!(engine.resolve_reference("multi").unwrap().len(), 2);
        assert!(matches!(
            engine.resolve_single("multi"),
            Err(CasketError::AmbiguousReference { count: 2, .. })
        ));
    }

    #[test]
    fn test_update_and_delete_reference() {
        let tmp = TempDir::new().unwrap();
        let engine = CasEngine::create(tmp.path()).unwrap();

        let manifest_desc = put_image(&engine);
        engine.update_reference("v1", &manifest_desc).unwrap();
        engine.update_reference("v2", &manifest_desc).unwrap();
        assert_eq!(
            engine.list_references().unwrap(),
            vec!["v1".to_string(), "v2".to_string()]
        );

        engine.delete_reference("v1").unwrap();
        engine.delete_reference("v1").unwrap();
        assert_eq!(engine.list_references().unwrap(), vec!["v2".to_string()]);
        assert_eq!(engine.get_reference("v2").unwrap(), manifest_desc);
    }
}
