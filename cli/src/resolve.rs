//! Parsing of `<image-path>[:<tag>]` arguments.
//!
//! The tag is everything after the last `:`; without one the tag is
//! `latest`.

use std::path::PathBuf;
use std::str::FromStr;

/// Tag used when an image argument names none.
pub const DEFAULT_TAG: &str = "latest";

/// An image layout directory plus the reference to operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub dir: PathBuf,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        let (dir, tag) = match s.rsplit_once(':') {
            Some((dir, tag)) => (dir, tag),
            None => (s, DEFAULT_TAG),
        };
        if dir.is_empty() {
            return Err(ResolveError::EmptyPath(s.to_string()));
        }
        if tag.is_empty() {
            return Err(ResolveError::EmptyTag(s.to_string()));
        }
        Ok(Self {
            dir: PathBuf::from(dir),
            tag: tag.to_string(),
        })
    }
}

impl FromStr for ImageRef {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dir.display(), self.tag)
    }
}

/// Resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Image path is empty in \"{0}\"")]
    EmptyPath(String),

    #[error("Tag is empty in \"{0}\"")]
    EmptyTag(String),
}
