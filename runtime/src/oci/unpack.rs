//! Layer extraction into a runtime bundle.
//!
//! Layers are applied bottom to top onto `<bundle>/<rootfs>`. After the
//! last layer a [`Snapshot`] of the tree is written next to the rootfs so
//! a later repack can classify what changed.

use std::collections::HashSet;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use casket_core::config::CasketConfig;
use casket_core::error::{CasketError, Result};
use filetime::FileTime;
use flate2::read::GzDecoder;

use super::changeset::Snapshot;
use super::digest::{from_io, Digest};
use super::engine::{Blob, CasEngine, DescriptorPath};
use super::idmap::MapOptions;
use super::image::MediaType;
use super::layer::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// Result of unpacking an image into a bundle.
#[derive(Debug)]
pub struct Unpacked {
    pub rootfs: PathBuf,
    pub snapshot_path: PathBuf,
    pub snapshot: Snapshot,
}

/// Where the snapshot for a manifest lives inside a bundle.
pub fn snapshot_path(bundle: &Path, manifest: &Digest) -> PathBuf {
    bundle.join(Snapshot::file_name(manifest))
}

/// Extract the manifest at the end of `path` into `bundle`.
///
/// Ownership in the layers is translated to host ids through `map`, and
/// the mapping is stored with the snapshot for the later repack.
pub fn unpack(
    engine: &CasEngine,
    path: &DescriptorPath,
    bundle: &Path,
    config: &CasketConfig,
    map: &MapOptions,
) -> Result<Unpacked> {
    let manifest_desc = path.descriptor();
    let manifest = engine.get_manifest(manifest_desc)?;
    let rootfs = bundle.join(&config.rootfs_name);
    prepare_rootfs(&rootfs)?;

    for (i, layer) in manifest.layers.iter().enumerate() {
        tracing::debug!(
            index = i,
            digest = %layer.digest,
            media_type = %layer.media_type,
            "Applying layer"
        );

        let gzip = match &layer.media_type {
            MediaType::ImageLayer | MediaType::ImageLayerNonDistributable => false,
            MediaType::ImageLayerGzip | MediaType::ImageLayerNonDistributableGzip => true,
            other => return Err(CasketError::UnsupportedMediaType(other.to_string())),
        };
        let reader = match engine.get_blob(layer)? {
            Blob::Layer(reader) => reader,
            _ => {
                return Err(CasketError::InvalidState(format!(
                    "{} is not a layer",
                    layer.digest
                )))
            }
        };

        let mut reader = if gzip {
            let mut decoder = apply_layer(GzDecoder::new(reader), &rootfs, map)?;
            io::copy(&mut decoder, &mut io::sink())
                .map_err(|e| from_io(format!("Failed to read layer {}", layer.digest), e))?;
            decoder.into_inner()
        } else {
            apply_layer(reader, &rootfs, map)?
        };
        // The archive may end before the blob does
        reader.drain()?;
    }

    let snapshot = Snapshot::capture_mapped(&rootfs, &config.snapshot.keywords, map)?;
    let snapshot_path = snapshot_path(bundle, &manifest_desc.digest);
    snapshot.save(&snapshot_path)?;

    tracing::info!(
        manifest = %manifest_desc.digest,
        layers = manifest.layers.len(),
        rootfs = %rootfs.display(),
        "Unpacked image"
    );
    Ok(Unpacked {
        rootfs,
        snapshot_path,
        snapshot,
    })
}

fn prepare_rootfs(rootfs: &Path) -> Result<()> {
    match std::fs::read_dir(rootfs) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(CasketError::InvalidState(format!(
                    "rootfs {} already exists and is not empty",
                    rootfs.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => std::fs::create_dir_all(rootfs)
            .map_err(|e| CasketError::io(format!("Failed to create {}", rootfs.display()), e)),
        Err(e) => Err(CasketError::io(
            format!("Failed to read {}", rootfs.display()),
            e,
        )),
    }
}

/// Apply one uncompressed layer stream onto `rootfs`, returning the
/// reader once the archive ends.
///
/// `.wh.<name>` removes `<name>` from lower layers and `.wh..wh..opq`
/// empties its directory of lower content. Entries written earlier in
/// the same layer are never removed by either. Directory and symlink
/// mtimes are set once the whole layer is applied, since extracting
/// children touches them.
pub fn apply_layer<R: Read>(reader: R, rootfs: &Path, map: &MapOptions) -> Result<R> {
    let root = rootfs
        .canonicalize()
        .map_err(|e| CasketError::io(format!("Failed to resolve {}", rootfs.display()), e))?;

    // Ownership can only be restored with privileges
    let privileged = !map.rootless && unsafe { libc::geteuid() } == 0;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    archive.set_preserve_ownerships(privileged && map.is_identity());

    let mut extracted: HashSet<PathBuf> = HashSet::new();
    let mut times: Vec<(PathBuf, FileTime)> = Vec::new();
    {
        let entries = archive
            .entries()
            .map_err(|e| from_io("Failed to read layer archive", e))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| from_io("Failed to read layer entry", e))?;
            let raw = entry
                .path()
                .map_err(|e| from_io("Failed to read layer entry path", e))?
                .into_owned();
            let header = entry.header();
            let is_dir = header.entry_type().is_dir();
            let is_symlink = header.entry_type().is_symlink();

            let Some(path) = clean_path(&raw)? else {
                if is_dir {
                    apply_root(&root, header, map, privileged)?;
                    times.push((root.clone(), header_mtime(header, &raw)?));
                }
                continue;
            };

            let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let parent = path.parent().unwrap_or_else(|| Path::new(""));

            if file_name == OPAQUE_WHITEOUT {
                clear_lower(&root, parent, &extracted)?;
                continue;
            }
            if let Some(target) = file_name.strip_prefix(WHITEOUT_PREFIX) {
                let target = parent.join(target);
                if !extracted.contains(&target) {
                    remove_lower(&root, &target)?;
                }
                continue;
            }

            // A lower node of another type is replaced wholesale
            let dest = root.join(&path);
            if let Ok(existing) = std::fs::symlink_metadata(&dest) {
                if !(existing.is_dir() && is_dir) {
                    remove_lower(&root, &path)?;
                }
            }

            let unpacked = entry
                .unpack_in(&root)
                .map_err(|e| from_io(format!("Failed to extract {}", path.display()), e))?;
            if !unpacked {
                return Err(CasketError::LayerError(format!(
                    "entry {} escapes the rootfs",
                    raw.display()
                )));
            }
            if privileged && !map.is_identity() {
                chown_mapped(&dest, entry.header(), map)?;
            }
            if is_dir || is_symlink {
                let mtime = header_mtime(entry.header(), &path)?;
                times.push((dest, mtime));
            }
            extracted.insert(path);
        }
    }

    for (path, mtime) in &times {
        match filetime::set_symlink_file_times(path, *mtime, *mtime) {
            Ok(()) => {}
            // Replaced later in the same layer
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CasketError::io(
                    format!("Failed to set mtime of {}", path.display()),
                    e,
                ))
            }
        }
    }

    tracing::debug!(rootfs = %rootfs.display(), entries = extracted.len(), "Applied layer");
    Ok(archive.into_inner())
}

fn header_mtime(header: &tar::Header, path: &Path) -> Result<FileTime> {
    let secs = header
        .mtime()
        .map_err(|e| from_io(format!("Failed to read mtime of {}", path.display()), e))?;
    Ok(FileTime::from_unix_time(
        i64::try_from(secs).unwrap_or(i64::MAX),
        0,
    ))
}

/// Apply the metadata of the archive's root entry to the rootfs itself.
fn apply_root(root: &Path, header: &tar::Header, map: &MapOptions, privileged: bool) -> Result<()> {
    if privileged {
        chown_mapped(root, header, map)?;
    }
    let mode = header
        .mode()
        .map_err(|e| from_io("Failed to read mode of the root entry", e))?;
    std::fs::set_permissions(root, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| CasketError::io(format!("Failed to chmod {}", root.display()), e))
}

/// Set the host owner of an extracted node from the container ids in
/// its header.
fn chown_mapped(dest: &Path, header: &tar::Header, map: &MapOptions) -> Result<()> {
    let id = |value: io::Result<u64>, what: &str| -> Result<u32> {
        let value = value
            .map_err(|e| from_io(format!("Failed to read {} of {}", what, dest.display()), e))?;
        u32::try_from(value).map_err(|_| {
            CasketError::LayerError(format!(
                "{} {} of {} is out of range",
                what,
                value,
                dest.display()
            ))
        })
    };
    let uid = map.to_host_uid(id(header.uid(), "uid")?)?;
    let gid = map.to_host_gid(id(header.gid(), "gid")?)?;

    std::os::unix::fs::lchown(dest, Some(uid), Some(gid))
        .map_err(|e| CasketError::io(format!("Failed to chown {}", dest.display()), e))?;

    // chown clears setuid and setgid bits
    if !header.entry_type().is_symlink() {
        let mode = header
            .mode()
            .map_err(|e| from_io(format!("Failed to read mode of {}", dest.display()), e))?;
        std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| CasketError::io(format!("Failed to chmod {}", dest.display()), e))?;
    }
    Ok(())
}

/// Normalize an archive path. `None` for the archive root.
fn clean_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut path = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(CasketError::LayerError(format!(
                    "entry {} escapes the rootfs",
                    raw.display()
                )))
            }
        }
    }
    Ok((!path.as_os_str().is_empty()).then_some(path))
}

/// Resolve the parent of `relative` and make sure it is inside `root`.
///
/// Returns `None` when the parent does not exist.
fn resolve_parent(root: &Path, relative: &Path) -> Result<Option<PathBuf>> {
    let parent = root.join(relative.parent().unwrap_or_else(|| Path::new("")));
    let resolved = match parent.canonicalize() {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CasketError::io(
                format!("Failed to resolve {}", parent.display()),
                e,
            ))
        }
    };
    if !resolved.starts_with(root) {
        return Err(CasketError::LayerError(format!(
            "{} resolves outside the rootfs",
            relative.display()
        )));
    }
    Ok(Some(resolved))
}

fn remove_lower(root: &Path, relative: &Path) -> Result<()> {
    let Some(parent) = resolve_parent(root, relative)? else {
        return Ok(());
    };
    let Some(name) = relative.file_name() else {
        return Ok(());
    };
    remove_node(&parent.join(name))
}

fn clear_lower(root: &Path, dir: &Path, keep: &HashSet<PathBuf>) -> Result<()> {
    let Some(resolved) = resolve_parent(root, &dir.join(OPAQUE_WHITEOUT))? else {
        return Ok(());
    };
    let entries = match std::fs::read_dir(&resolved) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(CasketError::io(
                format!("Failed to read {}", resolved.display()),
                e,
            ))
        }
    };
    for entry in entries {
        let entry =
            entry.map_err(|e| CasketError::io(format!("Failed to read {}", resolved.display()), e))?;
        if keep.contains(&dir.join(entry.file_name())) {
            continue;
        }
        remove_node(&entry.path())?;
    }
    Ok(())
}

fn remove_node(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CasketError::io(format!("Failed to stat {}", path.display()), e)),
    };
    let result = if metadata.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    result.map_err(|e| CasketError::io(format!("Failed to remove {}", path.display()), e))
}
