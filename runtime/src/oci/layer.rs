//! Layer packaging.
//!
//! Serializes a changeset (or a host path for insert) into a tar stream
//! that is hashed twice on its way to the blob store:
//!
//! ```text
//! tar ─▶ diffID hasher ─▶ gzip ─▶ blob hasher ─▶ temp file ─▶ rename
//! ```

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};

use casket_core::config::{LayerCompression, LayerConfig};
use casket_core::error::{CasketError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{EntryType, Header, HeaderMode};

use super::blob::{BlobStore, BlobWriter};
use super::changeset::{Change, ChangeKind, NodeType};
use super::digest::{from_io, Digest, DigestWriter};
use super::idmap::MapOptions;
use super::image::{Descriptor, MediaType};

/// Prefix marking a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Entry marking a directory whose lower contents are hidden.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A layer blob that has been written to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedLayer {
    /// Descriptor of the stored (possibly compressed) blob
    pub descriptor: Descriptor,
    /// Digest of the uncompressed tar stream
    pub diff_id: Digest,
}

/// Media type of layers written with the given compression.
pub fn layer_media_type(compression: LayerCompression) -> MediaType {
    match compression {
        LayerCompression::Gzip => MediaType::ImageLayerGzip,
        LayerCompression::None => MediaType::ImageLayer,
    }
}

enum Encoder {
    Gzip(GzEncoder<BlobWriter>),
    Plain(BlobWriter),
}

impl Write for Encoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Gzip(w) => w.write(buf),
            Encoder::Plain(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Gzip(w) => w.flush(),
            Encoder::Plain(w) => w.flush(),
        }
    }
}

/// Streaming writer for an uncompressed tar stream that lands in the
/// blob store as a layer.
pub struct LayerWriter {
    inner: DigestWriter<Encoder>,
    compression: LayerCompression,
}

impl LayerWriter {
    pub fn new(blobs: &BlobStore, config: &LayerConfig) -> Result<Self> {
        let blob = blobs.writer()?;
        let encoder = match config.compression {
            LayerCompression::Gzip => {
                Encoder::Gzip(GzEncoder::new(blob, Compression::new(config.gzip_level)))
            }
            LayerCompression::None => Encoder::Plain(blob),
        };
        Ok(Self {
            inner: DigestWriter::new(encoder),
            compression: config.compression,
        })
    }

    /// Close the compressor and commit the blob.
    pub fn finish(self) -> Result<PackagedLayer> {
        let (encoder, diff_id, _) = self.inner.finish();
        let blob = match encoder {
            Encoder::Gzip(gz) => gz
                .finish()
                .map_err(|e| CasketError::io("Failed to finish layer compression", e))?,
            Encoder::Plain(blob) => blob,
        };
        let (digest, size) = blob.commit()?;

        tracing::debug!(
            digest = %digest,
            diff_id = %diff_id,
            size,
            compression = %self.compression,
            "Packaged layer"
        );
        Ok(PackagedLayer {
            descriptor: Descriptor::new(layer_media_type(self.compression), digest, size),
            diff_id,
        })
    }
}

impl Write for LayerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Package a changeset against `rootfs` into a new layer blob.
///
/// Only paths named by the changeset are read. Deleting a directory
/// emits a single whiteout; its removed descendants are implied. Host
/// ownership is written as container ids through `map`.
pub fn pack_changeset(
    blobs: &BlobStore,
    rootfs: &Path,
    changes: &[Change],
    config: &LayerConfig,
    map: &MapOptions,
) -> Result<PackagedLayer> {
    let mut builder = tar::Builder::new(LayerWriter::new(blobs, config)?);
    builder.follow_symlinks(false);

    let mut removed_dirs: Vec<&Path> = Vec::new();
    for change in changes {
        let path = change.path.as_path();
        let was_dir = matches!(&change.before, Some(m) if m.node_type == NodeType::Directory);

        match change.kind {
            ChangeKind::Deleted => {
                if removed_dirs.iter().any(|dir| path.starts_with(dir)) {
                    continue;
                }
                append_whiteout(&mut builder, path)?;
                if was_dir {
                    removed_dirs.push(path);
                }
            }
            ChangeKind::TypeChanged => {
                append_whiteout(&mut builder, path)?;
                if was_dir {
                    removed_dirs.push(path);
                }
                append_path(&mut builder, &rootfs.join(path), path, map)?;
            }
            ChangeKind::Added | ChangeKind::Modified => {
                append_path(&mut builder, &rootfs.join(path), path, map)?;
            }
        }
    }

    let writer = builder
        .into_inner()
        .map_err(|e| from_io("Failed to finish layer archive", e))?;
    let layer = writer.finish()?;

    tracing::info!(
        digest = %layer.descriptor.digest,
        changes = changes.len(),
        "Packaged changeset layer"
    );
    Ok(layer)
}

/// Package a host file or directory as a layer placing it at `target`
/// inside the image. Directories are added recursively.
pub fn pack_insert(
    blobs: &BlobStore,
    source: &Path,
    target: &str,
    config: &LayerConfig,
    map: &MapOptions,
) -> Result<PackagedLayer> {
    let target = image_path(target)?;
    std::fs::symlink_metadata(source)
        .map_err(|e| CasketError::io(format!("Failed to stat {}", source.display()), e))?;

    let mut builder = tar::Builder::new(LayerWriter::new(blobs, config)?);
    builder.follow_symlinks(false);
    append_tree(&mut builder, source, &target, map)?;

    let writer = builder
        .into_inner()
        .map_err(|e| from_io("Failed to finish layer archive", e))?;
    let layer = writer.finish()?;

    tracing::info!(
        digest = %layer.descriptor.digest,
        source = %source.display(),
        target = %target.display(),
        "Packaged insert layer"
    );
    Ok(layer)
}

/// Turn an absolute or relative image path into an archive path.
fn image_path(target: &str) -> Result<PathBuf> {
    let mut path = PathBuf::new();
    for component in Path::new(target).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => path.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(CasketError::LayerError(format!(
                    "target path {:?} must not contain '..'",
                    target
                )))
            }
        }
    }
    if path.as_os_str().is_empty() {
        return Err(CasketError::LayerError(format!(
            "target path {:?} does not name anything below /",
            target
        )));
    }
    Ok(path)
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    name: &Path,
    map: &MapOptions,
) -> Result<()> {
    append_path(builder, source, name, map)?;

    let metadata = std::fs::symlink_metadata(source)
        .map_err(|e| CasketError::io(format!("Failed to stat {}", source.display()), e))?;
    if !metadata.is_dir() {
        return Ok(());
    }

    let mut children = std::fs::read_dir(source)
        .map_err(|e| CasketError::io(format!("Failed to read directory {}", source.display()), e))?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<OsString>>>()
        .map_err(|e| CasketError::io(format!("Failed to read entry in {}", source.display()), e))?;
    children.sort();

    for child in children {
        append_tree(builder, &source.join(&child), &name.join(&child), map)?;
    }
    Ok(())
}

/// Append one node with its full metadata, without following symlinks.
///
/// The rootfs itself is appended under the name `.`.
fn append_path<W: Write>(
    builder: &mut tar::Builder<W>,
    source: &Path,
    name: &Path,
    map: &MapOptions,
) -> Result<()> {
    let metadata = std::fs::symlink_metadata(source)
        .map_err(|e| CasketError::io(format!("Failed to stat {}", source.display()), e))?;
    let file_type = metadata.file_type();

    let mut header = Header::new_gnu();
    header.set_metadata_in_mode(&metadata, HeaderMode::Complete);
    header.set_mode(metadata.mode() & 0o7777);
    header.set_uid(map.to_container_uid(metadata.uid())?.into());
    header.set_gid(map.to_container_gid(metadata.gid())?.into());

    let result = if file_type.is_dir() {
        header.set_size(0);
        builder.append_data(&mut header, name, io::empty())
    } else if file_type.is_symlink() {
        let target = std::fs::read_link(source)
            .map_err(|e| CasketError::io(format!("Failed to read link {}", source.display()), e))?;
        header.set_size(0);
        builder.append_link(&mut header, name, target)
    } else if file_type.is_file() {
        let file = File::open(source)
            .map_err(|e| CasketError::io(format!("Failed to open {}", source.display()), e))?;
        // Size must describe the bytes actually streamed.
        let opened = file
            .metadata()
            .map_err(|e| CasketError::io(format!("Failed to stat {}", source.display()), e))?;
        header.set_size(opened.len());
        builder.append_data(&mut header, name, file)
    } else {
        tracing::warn!(path = %source.display(), "Skipping unsupported node type");
        return Ok(());
    };

    result.map_err(|e| from_io(format!("Failed to add {} to layer", name.display()), e))
}

fn append_whiteout<W: Write>(builder: &mut tar::Builder<W>, path: &Path) -> Result<()> {
    let file_name = path.file_name().ok_or_else(|| {
        CasketError::LayerError(format!("cannot white out {}", path.display()))
    })?;
    let mut whiteout = OsString::from(WHITEOUT_PREFIX);
    whiteout.push(file_name);
    let name = path.with_file_name(whiteout);

    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(0);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);

    builder
        .append_data(&mut header, &name, io::empty())
        .map_err(|e| from_io(format!("Failed to add whiteout {} to layer", name.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::changeset::Snapshot;
    use casket_core::config::Keyword;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn entries(blobs: &BlobStore, layer: &PackagedLayer) -> Vec<(String, EntryType)> {
        let data = blobs.read(&layer.descriptor.digest).unwrap();
        let tar_bytes = match layer.descriptor.media_type {
            MediaType::ImageLayerGzip => {
                let mut out = Vec::new();
                GzDecoder::new(&data[..]).read_to_end(&mut out).unwrap();
                out
            }
            _ => data,
        };
        assert_eq!(Digest::of_bytes(&tar_bytes), layer.diff_id);

        let mut archive = tar::Archive::new(&tar_bytes[..]);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (
                    e.path().unwrap().display().to_string(),
                    e.header().entry_type(),
                )
            })
            .collect()
    }

    #[test]
    fn test_layer_writer_plain_digests() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        let config = LayerConfig {
            compression: LayerCompression::None,
            ..Default::default()
        };

        let mut writer = LayerWriter::new(&blobs, &config).unwrap();
        writer.write_all(b"not really a tar").unwrap();
        let layer = writer.finish().unwrap();

        // Without compression the blob is the diff
        assert_eq!(layer.descriptor.digest, layer.diff_id);
        assert_eq!(layer.descriptor.media_type, MediaType::ImageLayer);
        assert_eq!(layer.descriptor.size, 16);
    }

    #[test]
    fn test_layer_writer_gzip_digests() {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(&tmp.path().join("blobs"));

        let mut writer = LayerWriter::new(&blobs, &LayerConfig::default()).unwrap();
        writer.write_all(b"payload").unwrap();
        let layer = writer.finish().unwrap();

        assert_ne!(layer.descriptor.digest, layer.diff_id);
        assert_eq!(layer.diff_id, Digest::of_bytes(b"payload"));
        assert_eq!(layer.descriptor.media_type, MediaType::ImageLayerGzip);
        assert!(blobs.exists(&layer.descriptor.digest));
    }

    #[test]
    fn test_pack_changeset_entries_and_whiteouts() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::create_dir_all(rootfs.join("var/cache/apk")).unwrap();
        std::fs::write(rootfs.join("var/cache/apk/index"), "idx").unwrap();
        std::fs::write(rootfs.join("etc/hostname"), "box\n").unwrap();

        let snapshot = Snapshot::capture(&rootfs, &Keyword::defaults()).unwrap();

        std::fs::remove_dir_all(rootfs.join("var/cache")).unwrap();
        std::fs::write(rootfs.join("etc/motd"), "welcome\n").unwrap();
        symlink("motd", rootfs.join("etc/issue")).unwrap();

        let changes = snapshot.diff(&rootfs).unwrap();
        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        let layer = pack_changeset(
            &blobs,
            &rootfs,
            &changes,
            &LayerConfig::default(),
            &MapOptions::default(),
        )
        .unwrap();

        let entries = entries(&blobs, &layer);
        let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();

        assert!(names.contains(&"etc/motd"));
        assert!(names.contains(&"var/.wh.cache"));
        // Descendants of a removed directory are implied
        assert!(!names.iter().any(|n| n.starts_with("var/cache")));
        assert!(!names.contains(&"etc/hostname"));

        let issue = entries.iter().find(|(n, _)| n == "etc/issue").unwrap();
        assert_eq!(issue.1, EntryType::Symlink);
    }

    #[test]
    fn test_pack_changeset_type_change_emits_whiteout_first() {
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("opt/data")).unwrap();
        std::fs::write(rootfs.join("opt/data/a"), "a").unwrap();

        let snapshot = Snapshot::capture(&rootfs, &Keyword::defaults()).unwrap();
        std::fs::remove_dir_all(rootfs.join("opt/data")).unwrap();
        std::fs::write(rootfs.join("opt/data"), "now a file").unwrap();

        let changes = snapshot.diff(&rootfs).unwrap();
        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        let layer = pack_changeset(
            &blobs,
            &rootfs,
            &changes,
            &LayerConfig::default(),
            &MapOptions::default(),
        )
        .unwrap();

        let names: Vec<String> = entries(&blobs, &layer).into_iter().map(|(n, _)| n).collect();
        let whiteout = names.iter().position(|n| n == "opt/.wh.data").unwrap();
        let file = names.iter().position(|n| n == "opt/data").unwrap();
        assert!(whiteout < file);
        assert!(!names.iter().any(|n| n.starts_with("opt/data/")));
    }

    #[test]
    fn test_pack_insert_directory() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("conf");
        std::fs::create_dir_all(source.join("sub")).unwrap();
        std::fs::write(source.join("b.conf"), "b").unwrap();
        std::fs::write(source.join("a.conf"), "a").unwrap();
        std::fs::write(source.join("sub/c.conf"), "c").unwrap();

        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        let layer = pack_insert(
            &blobs,
            &source,
            "/etc/app",
            &LayerConfig::default(),
            &MapOptions::default(),
        )
        .unwrap();

        let names: Vec<String> = entries(&blobs, &layer).into_iter().map(|(n, _)| n).collect();
        let names: Vec<&str> = names.iter().map(|n| n.trim_end_matches('/')).collect();
        assert_eq!(
            names,
            vec![
                "etc/app",
                "etc/app/a.conf",
                "etc/app/b.conf",
                "etc/app/sub",
                "etc/app/sub/c.conf"
            ]
        );
    }

    #[test]
    fn test_pack_changeset_includes_root_entry() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::set_permissions(&rootfs, std::fs::Permissions::from_mode(0o755)).unwrap();

        let snapshot = Snapshot::capture(&rootfs, &[Keyword::Type, Keyword::Mode]).unwrap();
        std::fs::set_permissions(&rootfs, std::fs::Permissions::from_mode(0o711)).unwrap();

        let changes = snapshot.diff(&rootfs).unwrap();
        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        let layer = pack_changeset(
            &blobs,
            &rootfs,
            &changes,
            &LayerConfig::default(),
            &MapOptions::default(),
        )
        .unwrap();

        let entries = entries(&blobs, &layer);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.trim_end_matches('/'), ".");
        assert_eq!(entries[0].1, EntryType::Directory);
    }

    #[test]
    fn test_pack_insert_maps_owner() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("file");
        std::fs::write(&source, "x").unwrap();
        let metadata = std::fs::metadata(&source).unwrap();
        let map = MapOptions::new(
            false,
            vec![format!("0:{}", metadata.uid()).parse().unwrap()],
            vec![format!("5:{}", metadata.gid()).parse().unwrap()],
        );

        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        let config = LayerConfig {
            compression: LayerCompression::None,
            ..Default::default()
        };
        let layer = pack_insert(&blobs, &source, "/etc/file", &config, &map).unwrap();

        let data = blobs.read(&layer.descriptor.digest).unwrap();
        let mut archive = tar::Archive::new(&data[..]);
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().uid().unwrap(), 0);
        assert_eq!(entry.header().gid().unwrap(), 5);
    }

    #[test]
    fn test_pack_insert_rejects_unmapped_owner() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("file");
        std::fs::write(&source, "x").unwrap();
        let uid = std::fs::metadata(&source).unwrap().uid();
        let map = MapOptions::new(
            false,
            vec![format!("0:{}", uid.wrapping_add(1)).parse().unwrap()],
            Vec::new(),
        );

        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        assert!(matches!(
            pack_insert(&blobs, &source, "/etc/file", &LayerConfig::default(), &map),
            Err(CasketError::LayerError(_))
        ));
    }

    #[test]
    fn test_pack_insert_rejects_escaping_target() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("file");
        std::fs::write(&source, "x").unwrap();

        let blobs = BlobStore::new(&tmp.path().join("blobs"));
        for target in ["/../etc/passwd", "/"] {
            assert!(matches!(
                pack_insert(
                    &blobs,
                    &source,
                    target,
                    &LayerConfig::default(),
                    &MapOptions::default()
                ),
                Err(CasketError::LayerError(_))
            ));
        }
    }
}
