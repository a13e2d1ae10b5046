//! Digest-keyed blob storage.
//!
//! Blobs live at `blobs/<algorithm>/<hex>`. Every write streams into a
//! hidden temporary file in the same directory while hashing, then is
//! renamed into place in a single step, so readers never observe a torn
//! blob. Writing content that is already stored is a no-op.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use casket_core::error::{CasketError, Result};
use tempfile::NamedTempFile;

use super::digest::{from_io, Digest, DigestWriter, VerifyingReader, SHA256};

/// Prefix of in-flight temporary files; never a valid hex digest.
const TEMP_PREFIX: &str = ".casket-";

/// Blob storage rooted at an image's `blobs/` directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Create a blob store over `root`. Directories are created lazily.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Location of a blob on disk.
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.root.join(digest.algorithm()).join(digest.hex())
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    /// Start a streaming write. Nothing becomes visible until
    /// [`BlobWriter::commit`]; dropping the writer discards the data.
    pub fn writer(&self) -> Result<BlobWriter> {
        let dir = self.root.join(SHA256);
        std::fs::create_dir_all(&dir).map_err(|e| {
            CasketError::io(format!("Failed to create blob directory {}", dir.display()), e)
        })?;

        let tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&dir)
            .map_err(|e| {
                CasketError::io(format!("Failed to create temp blob in {}", dir.display()), e)
            })?;

        Ok(BlobWriter {
            store: self.clone(),
            inner: DigestWriter::new(BufWriter::new(tmp)),
        })
    }

    /// Store everything `reader` yields. Returns the digest and size.
    pub fn put<R: Read + ?Sized>(&self, reader: &mut R) -> Result<(Digest, u64)> {
        let mut writer = self.writer()?;
        io::copy(reader, &mut writer)
            .map_err(|e| from_io("Failed to stream blob content", e))?;
        writer.commit()
    }

    /// Store an in-memory byte slice.
    pub fn put_bytes(&self, data: &[u8]) -> Result<(Digest, u64)> {
        let mut reader = data;
        self.put(&mut reader)
    }

    /// Open a blob for reading. The reader fails with a digest mismatch
    /// at end of stream if the stored bytes were altered.
    pub fn get(&self, digest: &Digest) -> Result<VerifyingReader<BufReader<File>>> {
        let path = self.path(digest);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                CasketError::not_found("blob", digest.to_string())
            } else {
                CasketError::io(format!("Failed to open blob {}", digest), e)
            }
        })?;
        Ok(VerifyingReader::new(BufReader::new(file), digest.clone()))
    }

    /// Read a whole blob into memory, verifying its digest.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut reader = self.get(digest)?;
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| from_io(format!("Failed to read blob {}", digest), e))?;
        Ok(data)
    }

    /// Size of a stored blob in bytes.
    pub fn size(&self, digest: &Digest) -> Result<u64> {
        std::fs::metadata(self.path(digest))
            .map(|m| m.len())
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    CasketError::not_found("blob", digest.to_string())
                } else {
                    CasketError::io(format!("Failed to stat blob {}", digest), e)
                }
            })
    }

    /// Remove a blob. Removing an absent blob is not an error.
    ///
    /// No reference counting is done; callers must ensure nothing still
    /// points at the blob.
    pub fn delete(&self, digest: &Digest) -> Result<()> {
        match std::fs::remove_file(self.path(digest)) {
            Ok(()) => {
                tracing::debug!(digest = %digest, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CasketError::io(format!("Failed to delete blob {}", digest), e)),
        }
    }

    /// List stored digests, skipping temporary and foreign files.
    pub fn list(&self) -> Result<Vec<Digest>> {
        let dir = self.root.join(SHA256);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CasketError::io(
                    format!("Failed to read blob directory {}", dir.display()),
                    e,
                ))
            }
        };

        let mut digests = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CasketError::io("Failed to read blob entry", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(digest) = Digest::sha256_from_hex(name) {
                digests.push(digest);
            }
        }
        digests.sort();
        Ok(digests)
    }
}

/// In-flight blob write. Hashes while writing; see [`BlobStore::writer`].
pub struct BlobWriter {
    store: BlobStore,
    inner: DigestWriter<BufWriter<NamedTempFile>>,
}

impl BlobWriter {
    /// Flush, then atomically move the content to its digest-keyed path.
    pub fn commit(self) -> Result<(Digest, u64)> {
        let (buffered, digest, size) = self.inner.finish();
        let tmp = buffered
            .into_inner()
            .map_err(|e| CasketError::io("Failed to flush blob", e.into_error()))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CasketError::io(format!("Failed to sync blob {}", digest), e))?;

        let dest = self.store.path(&digest);
        if dest.is_file() {
            // Same digest means same bytes; the temp file is dropped.
            tracing::debug!(digest = %digest, size, "Blob already stored");
            return Ok((digest, size));
        }

        tmp.persist(&dest)
            .map_err(|e| CasketError::io(format!("Failed to store blob {}", digest), e.error))?;

        let (stored, stored_size) = hash_file(&dest)?;
        if stored != digest || stored_size != size {
            return Err(CasketError::DigestMismatch {
                expected: digest.to_string(),
                actual: stored.to_string(),
            });
        }

        tracing::debug!(digest = %digest, size, "Stored blob");
        Ok((digest, size))
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash a file on disk.
fn hash_file(path: &Path) -> Result<(Digest, u64)> {
    let mut file = File::open(path)
        .map_err(|e| CasketError::io(format!("Failed to open {}", path.display()), e))?;
    let mut writer = DigestWriter::new(io::sink());
    io::copy(&mut file, &mut writer)
        .map_err(|e| CasketError::io(format!("Failed to hash {}", path.display()), e))?;
    let (_, digest, size) = writer.finish();
    Ok((digest, size))
}
