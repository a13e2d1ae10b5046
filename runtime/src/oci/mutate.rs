//! Image mutation.
//!
//! A [`Mutator`] loads a base manifest and config, accumulates new layers
//! and config edits in memory, and on [`Mutator::commit`] writes a new
//! config, a new manifest and rewritten ancestor indexes. Nothing already
//! in the store is modified, and no reference is touched: the caller
//! decides whether to repoint a tag at the returned root.

use std::collections::BTreeMap;
use std::io::{self, Read};

use casket_core::config::LayerConfig;
use casket_core::error::{CasketError, Result};
use serde_json::Value;

use super::digest::from_io;
use super::engine::{CasEngine, DescriptorPath};
use super::image::{Descriptor, History, ImageConfig, Manifest, MediaType, RuntimeConfig};
use super::layer::{LayerWriter, PackagedLayer};

/// Changes to an image's runtime configuration and platform fields.
///
/// Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigEdit {
    pub user: Option<String>,
    pub working_dir: Option<String>,
    /// `KEY=VALUE` pairs; an existing variable with the same key is replaced
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub remove_labels: Vec<String>,
    /// `port/proto` entries such as `8080/tcp`
    pub exposed_ports: Vec<String>,
    pub volumes: Vec<String>,
    pub stop_signal: Option<String>,
    pub author: Option<String>,
    pub architecture: Option<String>,
    pub os: Option<String>,
}

impl ConfigEdit {
    pub fn is_empty(&self) -> bool {
        *self == ConfigEdit::default()
    }

    /// Whether the edit sets anything inside the runtime `config` object.
    fn touches_runtime(&self) -> bool {
        self.user.is_some()
            || self.working_dir.is_some()
            || self.entrypoint.is_some()
            || self.cmd.is_some()
            || self.stop_signal.is_some()
            || !self.env.is_empty()
            || !self.labels.is_empty()
            || !self.remove_labels.is_empty()
            || !self.exposed_ports.is_empty()
            || !self.volumes.is_empty()
    }

    /// Apply the edit to a config in place.
    pub fn apply(&self, config: &mut ImageConfig) -> Result<()> {
        for pair in &self.env {
            if !pair.contains('=') {
                return Err(CasketError::ConfigError(format!(
                    "environment variable {:?} must have the form KEY=VALUE",
                    pair
                )));
            }
        }

        if let Some(author) = &self.author {
            config.author = Some(author.clone());
        }
        if let Some(architecture) = &self.architecture {
            config.architecture = architecture.clone();
        }
        if let Some(os) = &self.os {
            config.os = os.clone();
        }

        if !self.touches_runtime() {
            return Ok(());
        }
        let runtime = config.config.get_or_insert_with(RuntimeConfig::default);
        if let Some(user) = &self.user {
            runtime.user = Some(user.clone());
        }
        if let Some(working_dir) = &self.working_dir {
            runtime.working_dir = Some(working_dir.clone());
        }
        if let Some(entrypoint) = &self.entrypoint {
            runtime.entrypoint = Some(entrypoint.clone());
        }
        if let Some(cmd) = &self.cmd {
            runtime.cmd = Some(cmd.clone());
        }
        if let Some(stop_signal) = &self.stop_signal {
            runtime.stop_signal = Some(stop_signal.clone());
        }

        if !self.env.is_empty() {
            let env = runtime.env.get_or_insert_with(Vec::new);
            for pair in &self.env {
                let key = pair.split('=').next().unwrap_or_default();
                let prefix = format!("{}=", key);
                match env.iter_mut().find(|existing| existing.starts_with(&prefix)) {
                    Some(existing) => *existing = pair.clone(),
                    None => env.push(pair.clone()),
                }
            }
        }

        if !self.labels.is_empty() || !self.remove_labels.is_empty() {
            let labels = runtime.labels.get_or_insert_with(BTreeMap::new);
            for (key, value) in &self.labels {
                labels.insert(key.clone(), value.clone());
            }
            for key in &self.remove_labels {
                labels.remove(key);
            }
        }

        if !self.exposed_ports.is_empty() {
            let ports = runtime.exposed_ports.get_or_insert_with(BTreeMap::new);
            for port in &self.exposed_ports {
                ports.insert(port.clone(), Value::Object(Default::default()));
            }
        }
        if !self.volumes.is_empty() {
            let volumes = runtime.volumes.get_or_insert_with(BTreeMap::new);
            for volume in &self.volumes {
                volumes.insert(volume.clone(), Value::Object(Default::default()));
            }
        }

        Ok(())
    }
}

/// In-memory working copy of an image being modified.
pub struct Mutator<'a> {
    engine: &'a CasEngine,
    source: DescriptorPath,
    manifest: Manifest,
    config: ImageConfig,
    pending: usize,
}

impl<'a> Mutator<'a> {
    /// Load the manifest at the end of `source` as the base.
    pub fn new(engine: &'a CasEngine, source: DescriptorPath) -> Result<Self> {
        let descriptor = source.descriptor();
        if descriptor.media_type != MediaType::ImageManifest {
            return Err(CasketError::InvalidState(format!(
                "cannot mutate {}: descriptor path ends in {}, not a manifest",
                descriptor.digest, descriptor.media_type
            )));
        }

        let manifest = engine.get_manifest(descriptor)?;
        let config = engine.get_config(&manifest.config)?;
        check_history(&manifest, &config)?;

        Ok(Self {
            engine,
            source,
            manifest,
            config,
            pending: 0,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    pub fn source(&self) -> &DescriptorPath {
        &self.source
    }

    /// Append a stored layer and its history entry.
    pub fn add(&mut self, layer: &PackagedLayer, mut history: History) -> Result<()> {
        let descriptor = &layer.descriptor;
        if !descriptor.is_layer() {
            return Err(CasketError::InvalidState(format!(
                "{} has media type {}, not a layer",
                descriptor.digest, descriptor.media_type
            )));
        }
        if !self.engine.blobs().exists(&descriptor.digest) {
            return Err(CasketError::not_found("blob", descriptor.digest.to_string()));
        }

        history.empty_layer = false;
        self.manifest.layers.push(descriptor.clone());
        self.config.rootfs.diff_ids.push(layer.diff_id.clone());
        self.config.history.push(history);
        self.pending += 1;

        tracing::debug!(
            digest = %descriptor.digest,
            diff_id = %layer.diff_id,
            "Added layer"
        );
        Ok(())
    }

    /// Store an uncompressed tar stream as a layer and append it.
    pub fn add_layer_stream<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        config: &LayerConfig,
        history: History,
    ) -> Result<PackagedLayer> {
        let mut writer = LayerWriter::new(self.engine.blobs(), config)?;
        io::copy(reader, &mut writer).map_err(|e| from_io("Failed to stream layer", e))?;
        let layer = writer.finish()?;
        self.add(&layer, history)?;
        Ok(layer)
    }

    /// Apply a config edit, recorded as an empty-layer history entry.
    pub fn add_config_edit(&mut self, edit: &ConfigEdit, mut history: History) -> Result<()> {
        edit.apply(&mut self.config)?;

        history.empty_layer = true;
        self.config.history.push(history);
        self.pending += 1;

        tracing::debug!("Added config edit");
        Ok(())
    }

    /// Write the new config, manifest and ancestor indexes.
    ///
    /// Returns the descriptor path of the new image; its root is what a
    /// reference should point at.
    pub fn commit(mut self) -> Result<DescriptorPath> {
        if self.pending == 0 {
            return Err(CasketError::InvalidState(
                "nothing to commit: no layers or config edits were added".to_string(),
            ));
        }
        check_history(&self.manifest, &self.config)?;

        if let Some(created) = self.config.history.last().and_then(|h| h.created.clone()) {
            self.config.created = Some(created);
        }

        let config_desc = self
            .engine
            .put_blob_json(&self.config, MediaType::ImageConfig)?;
        self.manifest.config = carry_over(&self.manifest.config, config_desc);

        let manifest_desc = self
            .engine
            .put_blob_json(&self.manifest, MediaType::ImageManifest)?;

        let old_walk = self.source.walk();
        let mut walk = old_walk.to_vec();
        let last = walk.len() - 1;
        walk[last] = carry_over(&old_walk[last], manifest_desc);

        for i in (0..last).rev() {
            let mut index = self.engine.get_index(&old_walk[i])?;
            let old_child = &old_walk[i + 1];
            let slot = index
                .manifests
                .iter_mut()
                .find(|d| d.digest == old_child.digest && d.media_type == old_child.media_type)
                .ok_or_else(|| {
                    CasketError::InvalidState(format!(
                        "index {} no longer contains {}",
                        old_walk[i].digest, old_child.digest
                    ))
                })?;
            *slot = walk[i + 1].clone();

            let index_desc = self
                .engine
                .put_blob_json(&index, old_walk[i].media_type.clone())?;
            walk[i] = carry_over(&old_walk[i], index_desc);
        }

        let path = DescriptorPath::from_walk(walk)?;
        tracing::info!(
            root = %path.root().digest,
            manifest = %path.descriptor().digest,
            changes = self.pending,
            "Committed image"
        );
        Ok(path)
    }
}

/// A new descriptor that keeps the annotations and extra fields of the
/// one it replaces.
fn carry_over(old: &Descriptor, new: Descriptor) -> Descriptor {
    Descriptor {
        annotations: old.annotations.clone(),
        extra: old.extra.clone(),
        ..new
    }
}

/// Layers, diffIDs and non-empty history entries must line up.
fn check_history(manifest: &Manifest, config: &ImageConfig) -> Result<()> {
    let layers = manifest.layers.len();
    let diff_ids = config.rootfs.diff_ids.len();
    let history = config.layer_history_count();
    if layers != diff_ids || diff_ids != history {
        return Err(CasketError::InvalidState(format!(
            "image is inconsistent: {} layers, {} diff_ids, {} non-empty history entries",
            layers, diff_ids, history
        )));
    }
    Ok(())
}
