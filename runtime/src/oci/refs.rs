//! Named references (tags).
//!
//! Each reference is a file under `refs/` holding one descriptor as JSON.
//! References are replaced by writing a temporary file and renaming it
//! over the old one, so a reader sees either the old or the new target.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use casket_core::error::{CasketError, Result};

use super::image::Descriptor;

/// Reference storage rooted at an image's `refs/` directory.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    root: PathBuf,
}

impl ReferenceStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Check that a name can be stored as a single file.
    pub fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains('/')
            && !name.contains('\0');
        if valid {
            Ok(())
        } else {
            Err(CasketError::InvalidReference(name.to_string()))
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        Self::validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// Look up the descriptor a reference points at.
    pub fn get(&self, name: &str) -> Result<Descriptor> {
        let path = self.path(name)?;
        let data = std::fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CasketError::not_found("reference", name)
            } else {
                CasketError::io(format!("Failed to read reference {}", name), e)
            }
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            CasketError::SerializationError(format!("Failed to parse reference {}: {}", name, e))
        })
    }

    /// Create or replace a reference.
    pub fn put(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        let path = self.path(name)?;
        std::fs::create_dir_all(&self.root).map_err(|e| {
            CasketError::io(
                format!("Failed to create reference directory {}", self.root.display()),
                e,
            )
        })?;

        let data = serde_json::to_vec(descriptor)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".casket-")
            .tempfile_in(&self.root)
            .map_err(|e| CasketError::io(format!("Failed to stage reference {}", name), e))?;
        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| CasketError::io(format!("Failed to write reference {}", name), e))?;
        tmp.persist(&path)
            .map_err(|e| CasketError::io(format!("Failed to store reference {}", name), e.error))?;

        tracing::debug!(reference = %name, digest = %descriptor.digest, "Updated reference");
        Ok(())
    }

    /// Remove a reference. Removing an absent reference is not an error.
    pub fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!(reference = %name, "Deleted reference");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CasketError::io(format!("Failed to delete reference {}", name), e)),
        }
    }

    /// All reference names, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CasketError::io(
                    format!("Failed to read reference directory {}", self.root.display()),
                    e,
                ))
            }
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CasketError::io("Failed to read reference entry", e))?;
            if let Some(name) = entry.file_name().to_str() {
                if Self::validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
