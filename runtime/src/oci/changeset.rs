//! Filesystem snapshots and change classification.
//!
//! A [`Snapshot`] records the metadata of every node under a rootfs at
//! unpack time. Comparing it against the live tree yields an ordered list
//! of [`Change`]s, which the layer packager turns into a new layer.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use casket_core::config::Keyword;
use casket_core::error::{CasketError, Result};
use serde::{Deserialize, Serialize};

use super::digest::{Digest, DigestWriter};
use super::idmap::MapOptions;

/// Key under which a snapshot records the rootfs itself.
pub const ROOT_ENTRY: &str = ".";

/// Kind of filesystem node tracked by snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Directory,
    Symlink,
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "dir"),
            Self::Symlink => write!(f, "link"),
        }
    }
}

/// Metadata of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Permission bits including setuid/setgid/sticky
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Always 0 for directories
    pub size: u64,
    /// Whole seconds, the precision layers carry
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl EntryMeta {
    /// Whether two entries agree on every tracked keyword.
    ///
    /// Node type is compared regardless of the keyword set.
    pub fn matches(&self, other: &EntryMeta, keywords: &[Keyword]) -> bool {
        if self.node_type != other.node_type {
            return false;
        }
        keywords.iter().all(|keyword| match keyword {
            Keyword::Type => true,
            Keyword::Mode => self.mode == other.mode,
            Keyword::Uid => self.uid == other.uid,
            Keyword::Gid => self.gid == other.gid,
            Keyword::Size => self.size == other.size,
            Keyword::Mtime => self.mtime == other.mtime,
            Keyword::Link => self.link == other.link,
            Keyword::Sha256 => self.sha256 == other.sha256,
        })
    }
}

/// How a path differs between a snapshot and the live tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    TypeChanged,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
            Self::TypeChanged => write!(f, "type-changed"),
        }
    }
}

/// A single classified change, relative to the rootfs.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Metadata recorded in the snapshot
    pub before: Option<EntryMeta>,
    /// Metadata of the live node
    pub after: Option<EntryMeta>,
}

/// Metadata of every node at or below a root directory.
///
/// The root itself is recorded as `.`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub keywords: Vec<Keyword>,
    /// Id mapping the ownership in `entries` was translated through
    #[serde(default)]
    pub map: MapOptions,
    pub entries: BTreeMap<PathBuf, EntryMeta>,
}

impl Snapshot {
    /// Record the metadata of `root` and everything under it, with host
    /// ownership.
    pub fn capture(root: &Path, keywords: &[Keyword]) -> Result<Self> {
        Self::capture_mapped(root, keywords, &MapOptions::default())
    }

    /// Record the metadata of `root` and everything under it, translating
    /// ownership to container ids through `map`.
    pub fn capture_mapped(root: &Path, keywords: &[Keyword], map: &MapOptions) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let hash = keywords.contains(&Keyword::Sha256);
        if let Some(meta) = read_entry(root, hash, map)? {
            entries.insert(PathBuf::from(ROOT_ENTRY), meta);
        }
        walk_dir(root, root, hash, map, &mut entries)?;

        tracing::debug!(root = %root.display(), entries = entries.len(), "Captured snapshot");
        Ok(Self {
            keywords: keywords.to_vec(),
            map: map.clone(),
            entries,
        })
    }

    /// File name under which the snapshot of an image is stored in a bundle.
    pub fn file_name(manifest: &Digest) -> String {
        format!("{}_{}.snapshot.json", manifest.algorithm(), manifest.hex())
    }

    /// Write the snapshot atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let data = serde_json::to_vec(self)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".casket-")
            .tempfile_in(dir)
            .map_err(|e| CasketError::io(format!("Failed to stage snapshot in {}", dir.display()), e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CasketError::io(format!("Failed to write snapshot {}", path.display()), e))?;
        tmp.persist(path).map_err(|e| {
            CasketError::io(format!("Failed to store snapshot {}", path.display()), e.error)
        })?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CasketError::not_found("snapshot", path.display().to_string())
            } else {
                CasketError::io(format!("Failed to read snapshot {}", path.display()), e)
            }
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            CasketError::SerializationError(format!(
                "Failed to parse snapshot {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Classify how the live tree at `root` differs from this snapshot.
    pub fn diff(&self, root: &Path) -> Result<Vec<Change>> {
        let live = Snapshot::capture_mapped(root, &self.keywords, &self.map)?;
        Ok(self.compare(&live))
    }

    /// Classify how `after` differs from this snapshot, ordered by path.
    pub fn compare(&self, after: &Snapshot) -> Vec<Change> {
        let paths: BTreeSet<&PathBuf> = self.entries.keys().chain(after.entries.keys()).collect();

        let mut changes = Vec::new();
        for path in paths {
            let before = self.entries.get(path);
            let now = after.entries.get(path);
            let kind = match (before, now) {
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Deleted,
                (Some(b), Some(a)) if b.node_type != a.node_type => ChangeKind::TypeChanged,
                (Some(b), Some(a)) if !b.matches(a, &self.keywords) => ChangeKind::Modified,
                _ => continue,
            };
            changes.push(Change {
                path: path.clone(),
                kind,
                before: before.cloned(),
                after: now.cloned(),
            });
        }
        changes
    }
}

/// Read the metadata of a single node without following symlinks.
///
/// Returns `None` for node types snapshots do not track.
fn read_entry(path: &Path, hash: bool, map: &MapOptions) -> Result<Option<EntryMeta>> {
    let metadata = std::fs::symlink_metadata(path)
        .map_err(|e| CasketError::io(format!("Failed to stat {}", path.display()), e))?;

    let file_type = metadata.file_type();
    let node_type = if file_type.is_dir() {
        NodeType::Directory
    } else if file_type.is_symlink() {
        NodeType::Symlink
    } else if file_type.is_file() {
        NodeType::File
    } else {
        return Ok(None);
    };

    let link = if node_type == NodeType::Symlink {
        let target = std::fs::read_link(path)
            .map_err(|e| CasketError::io(format!("Failed to read link {}", path.display()), e))?;
        Some(target.to_string_lossy().into_owned())
    } else {
        None
    };

    let sha256 = if hash && node_type == NodeType::File {
        Some(hash_file(path)?)
    } else {
        None
    };

    Ok(Some(EntryMeta {
        node_type,
        mode: metadata.mode() & 0o7777,
        uid: map.to_container_uid(metadata.uid())?,
        gid: map.to_container_gid(metadata.gid())?,
        size: if node_type == NodeType::Directory {
            0
        } else {
            metadata.len()
        },
        mtime: metadata.mtime(),
        link,
        sha256,
    }))
}

fn walk_dir(
    root: &Path,
    current: &Path,
    hash: bool,
    map: &MapOptions,
    entries: &mut BTreeMap<PathBuf, EntryMeta>,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        CasketError::io(format!("Failed to read directory {}", current.display()), e)
    })?;

    for entry in read_dir {
        let entry = entry.map_err(|e| {
            CasketError::io(format!("Failed to read entry in {}", current.display()), e)
        })?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|_| {
                CasketError::InvalidState(format!(
                    "{} is outside {}",
                    path.display(),
                    root.display()
                ))
            })?
            .to_path_buf();

        if relative.to_str().is_none() {
            tracing::warn!(path = %path.display(), "Skipping non UTF-8 path");
            continue;
        }

        let Some(meta) = read_entry(&path, hash, map)? else {
            tracing::warn!(path = %path.display(), "Skipping unsupported node type");
            continue;
        };

        let is_dir = meta.node_type == NodeType::Directory;
        entries.insert(relative, meta);
        if is_dir {
            walk_dir(root, &path, hash, map, entries)?;
        }
    }

    Ok(())
}

fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| CasketError::io(format!("Failed to open {}", path.display()), e))?;
    let mut writer = DigestWriter::new(std::io::sink());
    std::io::copy(&mut file, &mut writer)
        .map_err(|e| CasketError::io(format!("Failed to hash {}", path.display()), e))?;
    let (_, digest, _) = writer.finish();
    Ok(digest.hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        std::fs::write(root.join("etc/hostname"), "box\n").unwrap();
        std::fs::write(root.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        symlink("tool", root.join("usr/bin/alias")).unwrap();
        tmp
    }

    fn kinds(changes: &[Change]) -> Vec<(String, ChangeKind)> {
        changes
            .iter()
            .map(|c| (c.path.display().to_string(), c.kind))
            .collect()
    }

    #[test]
    fn test_capture_records_types() {
        let tmp = fixture();
        let snapshot = Snapshot::capture(tmp.path(), &Keyword::defaults()).unwrap();

        let etc = &snapshot.entries[Path::new("etc")];
        assert_eq!(etc.node_type, NodeType::Directory);
        assert_eq!(etc.size, 0);

        let hostname = &snapshot.entries[Path::new("etc/hostname")];
        assert_eq!(hostname.node_type, NodeType::File);
        assert_eq!(hostname.size, 4);
        assert!(hostname.sha256.is_none());

        let alias = &snapshot.entries[Path::new("usr/bin/alias")];
        assert_eq!(alias.node_type, NodeType::Symlink);
        assert_eq!(alias.link.as_deref(), Some("tool"));
    }

    #[test]
    fn test_unchanged_tree_has_no_changes() {
        let tmp = fixture();
        let snapshot = Snapshot::capture(tmp.path(), &Keyword::defaults()).unwrap();
        assert!(snapshot.diff(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_classifies_added_modified_deleted() {
        let tmp = fixture();
        let root = tmp.path();
        let snapshot = Snapshot::capture(root, &Keyword::defaults()).unwrap();

        std::fs::write(root.join("etc/hostname"), "renamed-box\n").unwrap();
        std::fs::write(root.join("etc/motd"), "hi\n").unwrap();
        std::fs::remove_file(root.join("usr/bin/tool")).unwrap();

        let changes = snapshot.diff(root).unwrap();
        let by_path: BTreeMap<_, _> = kinds(&changes).into_iter().collect();
        assert_eq!(by_path["etc/hostname"], ChangeKind::Modified);
        assert_eq!(by_path["etc/motd"], ChangeKind::Added);
        assert_eq!(by_path["usr/bin/tool"], ChangeKind::Deleted);
        assert!(!by_path.contains_key("usr/bin/alias"));

        let paths: Vec<_> = changes.iter().map(|c| c.path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_type_change() {
        let tmp = fixture();
        let root = tmp.path();
        let snapshot = Snapshot::capture(root, &Keyword::defaults()).unwrap();

        std::fs::remove_file(root.join("etc/hostname")).unwrap();
        std::fs::create_dir(root.join("etc/hostname")).unwrap();

        let changes = snapshot.diff(root).unwrap();
        let change = changes
            .iter()
            .find(|c| c.path == Path::new("etc/hostname"))
            .unwrap();
        assert_eq!(change.kind, ChangeKind::TypeChanged);
        assert_eq!(change.before.as_ref().unwrap().node_type, NodeType::File);
        assert_eq!(change.after.as_ref().unwrap().node_type, NodeType::Directory);
    }

    #[test]
    fn test_recreated_file_is_modified() {
        let tmp = fixture();
        let root = tmp.path();
        let snapshot = Snapshot::capture(root, &Keyword::defaults()).unwrap();

        std::fs::remove_file(root.join("etc/hostname")).unwrap();
        std::fs::write(root.join("etc/hostname"), "a different box\n").unwrap();

        let changes = snapshot.diff(root).unwrap();
        let hostname: Vec<_> = changes
            .iter()
            .filter(|c| c.path == Path::new("etc/hostname"))
            .collect();
        assert_eq!(hostname.len(), 1);
        assert_eq!(hostname[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn test_symlink_retarget_is_modified() {
        let tmp = fixture();
        let root = tmp.path();
        let snapshot = Snapshot::capture(root, &[Keyword::Type, Keyword::Link]).unwrap();

        std::fs::remove_file(root.join("usr/bin/alias")).unwrap();
        symlink("../../etc/hostname", root.join("usr/bin/alias")).unwrap();

        let changes = snapshot.diff(root).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![("usr/bin/alias".to_string(), ChangeKind::Modified)]
        );
    }

    #[test]
    fn test_mode_change_respects_keywords() {
        let tmp = fixture();
        let root = tmp.path();
        let tracked = Snapshot::capture(root, &[Keyword::Type, Keyword::Mode]).unwrap();
        let untracked = Snapshot::capture(root, &[Keyword::Type, Keyword::Size]).unwrap();

        std::fs::set_permissions(
            root.join("usr/bin/tool"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let changes = tracked.diff(root).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![("usr/bin/tool".to_string(), ChangeKind::Modified)]
        );
        assert!(untracked.diff(root).unwrap().is_empty());
    }

    #[test]
    fn test_sha256_keyword_detects_same_size_edit() {
        let tmp = fixture();
        let root = tmp.path();
        let snapshot = Snapshot::capture(root, &[Keyword::Type, Keyword::Sha256]).unwrap();
        assert!(snapshot.entries[Path::new("etc/hostname")].sha256.is_some());

        std::fs::write(root.join("etc/hostname"), "xyz\n").unwrap();
        let changes = snapshot.diff(root).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![("etc/hostname".to_string(), ChangeKind::Modified)]
        );
    }

    #[test]
    fn test_root_mode_change_is_modified() {
        let tmp = fixture();
        let root = tmp.path();
        let snapshot = Snapshot::capture(root, &[Keyword::Type, Keyword::Mode]).unwrap();
        assert_eq!(
            snapshot.entries[Path::new(ROOT_ENTRY)].node_type,
            NodeType::Directory
        );
        assert_eq!(snapshot.entries.keys().next().unwrap(), Path::new(ROOT_ENTRY));

        std::fs::set_permissions(root, std::fs::Permissions::from_mode(0o751)).unwrap();
        let changes = snapshot.diff(root).unwrap();
        assert_eq!(
            kinds(&changes),
            vec![(".".to_string(), ChangeKind::Modified)]
        );
    }

    #[test]
    fn test_capture_mapped_records_container_ids() {
        let tmp = fixture();
        let root = tmp.path();
        let metadata = std::fs::metadata(root.join("etc/hostname")).unwrap();
        let map = MapOptions::new(
            false,
            vec![format!("7:{}", metadata.uid()).parse().unwrap()],
            vec![format!("9:{}", metadata.gid()).parse().unwrap()],
        );

        let snapshot = Snapshot::capture_mapped(root, &Keyword::defaults(), &map).unwrap();
        let hostname = &snapshot.entries[Path::new("etc/hostname")];
        assert_eq!((hostname.uid, hostname.gid), (7, 9));
        assert_eq!(snapshot.map, map);

        // The stored mapping is reused for the live side
        assert!(snapshot.diff(root).unwrap().is_empty());
    }

    #[test]
    fn test_capture_mapped_rejects_unmapped_owner() {
        let tmp = fixture();
        let metadata = std::fs::metadata(tmp.path()).unwrap();
        let map = MapOptions::new(
            false,
            vec![format!("0:{}", metadata.uid().wrapping_add(1)).parse().unwrap()],
            Vec::new(),
        );
        assert!(matches!(
            Snapshot::capture_mapped(tmp.path(), &Keyword::defaults(), &map),
            Err(CasketError::LayerError(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = fixture();
        let snapshot = Snapshot::capture(tmp.path(), &Keyword::defaults()).unwrap();

        let out = TempDir::new().unwrap();
        let digest = Digest::of_bytes(b"manifest");
        let path = out.path().join(Snapshot::file_name(&digest));
        snapshot.save(&path).unwrap();

        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("sha256_"));
        assert_eq!(Snapshot::load(&path).unwrap(), snapshot);
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let out = TempDir::new().unwrap();
        let err = Snapshot::load(&out.path().join("nope.json")).unwrap_err();
        assert!(err.is_not_found());
    }
}
