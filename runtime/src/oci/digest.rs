//! Content digests and streaming hash adapters.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use casket_core::error::{CasketError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

/// The only digest algorithm the store writes.
pub const SHA256: &str = "sha256";

/// A content digest in `algorithm:hex` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: String,
    hex: String,
}

impl Digest {
    /// Parse and validate an `algorithm:hex` string.
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| CasketError::InvalidDigest(format!("missing algorithm in {:?}", s)))?;

        if algorithm != SHA256 {
            return Err(CasketError::InvalidDigest(format!(
                "unsupported algorithm {:?} in {}",
                algorithm, s
            )));
        }
        Self::sha256_from_hex(hex)
    }

    /// Build a sha256 digest from its hex encoding.
    pub fn sha256_from_hex(hex: &str) -> Result<Self> {
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(CasketError::InvalidDigest(format!(
                "expected 64 lowercase hex characters, got {:?}",
                hex
            )));
        }
        Ok(Self {
            algorithm: SHA256.to_string(),
            hex: hex.to_string(),
        })
    }

    /// Digest of an in-memory byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_hasher(Sha256::new_with_prefix(data))
    }

    fn from_hasher(hasher: Sha256) -> Self {
        Self {
            algorithm: SHA256.to_string(),
            hex: hex::encode(hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = CasketError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Writer adapter that hashes and counts every byte passed through.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Return the inner writer, the digest and the byte count.
    pub fn finish(self) -> (W, Digest, u64) {
        (self.inner, Digest::from_hasher(self.hasher), self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader adapter that checks the content digest once the stream ends.
///
/// A mismatch surfaces as an `InvalidData` I/O error wrapping
/// [`CasketError::DigestMismatch`]; use [`from_io`] to recover it.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Sha256,
    expected: Digest,
    read: u64,
    verified: bool,
}

impl<R> fmt::Debug for VerifyingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifyingReader")
            .field("expected", &self.expected)
            .field("read", &self.read)
            .field("verified", &self.verified)
            .finish_non_exhaustive()
    }
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, expected: Digest) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected,
            read: 0,
            verified: false,
        }
    }

    pub fn expected(&self) -> &Digest {
        &self.expected
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Read the rest of the stream so the digest check runs.
    pub fn drain(&mut self) -> Result<()> {
        io::copy(self, &mut io::sink())
            .map(|_| ())
            .map_err(|e| from_io(format!("Failed to read blob {}", self.expected), e))
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.hasher.update(&buf[..n]);
            self.read += n as u64;
        } else if !buf.is_empty() && !self.verified {
            self.verified = true;
            let actual = Digest::from_hasher(self.hasher.clone());
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    CasketError::DigestMismatch {
                        expected: self.expected.to_string(),
                        actual: actual.to_string(),
                    },
                ));
            }
        }
        Ok(n)
    }
}

/// Convert an I/O error into a [`CasketError`], surfacing any digest
/// mismatch buried in it (possibly under archive or decoder wrappers).
pub fn from_io(context: impl Into<String>, err: io::Error) -> CasketError {
    if let Some((expected, actual)) = find_mismatch(&err) {
        return CasketError::DigestMismatch { expected, actual };
    }
    CasketError::io(context, err)
}

fn find_mismatch(err: &io::Error) -> Option<(String, String)> {
    let mut current = err
        .get_ref()
        .map(|e| e as &(dyn std::error::Error + 'static));
    while let Some(e) = current {
        if let Some(CasketError::DigestMismatch { expected, actual }) =
            e.downcast_ref::<CasketError>()
        {
            return Some((expected.clone(), actual.clone()));
        }
        current = match e.downcast_ref::<io::Error>() {
            Some(io_err) => io_err
                .get_ref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            None => e.source(),
        };
    }
    None
}
