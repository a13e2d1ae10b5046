//! Casket configuration.
//!
//! Loaded from YAML. Every field has a default so an absent or partial
//! file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CasketError, Result};

/// Compression applied to newly packaged layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerCompression {
    /// `application/vnd.oci.image.layer.v1.tar+gzip` (default).
    Gzip,
    /// `application/vnd.oci.image.layer.v1.tar`.
    None,
}

impl Default for LayerCompression {
    fn default() -> Self {
        Self::Gzip
    }
}

impl std::fmt::Display for LayerCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gzip => write!(f, "gzip"),
            Self::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for LayerCompression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Self::Gzip),
            "none" => Ok(Self::None),
            _ => Err(format!(
                "unknown layer compression: '{}' (supported: gzip, none)",
                s
            )),
        }
    }
}

/// A metadata field tracked by filesystem snapshots.
///
/// Two snapshot entries are considered equal when every tracked keyword
/// matches. Node type is always compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keyword {
    Type,
    Mode,
    Uid,
    Gid,
    Size,
    Mtime,
    Link,
    Sha256,
}

impl Keyword {
    /// Keywords tracked when nothing else is configured.
    pub fn defaults() -> Vec<Keyword> {
        vec![
            Keyword::Type,
            Keyword::Mode,
            Keyword::Uid,
            Keyword::Gid,
            Keyword::Size,
            Keyword::Mtime,
            Keyword::Link,
        ]
    }
}

impl std::fmt::Display for Keyword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Type => "type",
            Self::Mode => "mode",
            Self::Uid => "uid",
            Self::Gid => "gid",
            Self::Size => "size",
            Self::Mtime => "mtime",
            Self::Link => "link",
            Self::Sha256 => "sha256",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Keyword {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "type" => Ok(Self::Type),
            "mode" => Ok(Self::Mode),
            "uid" => Ok(Self::Uid),
            "gid" => Ok(Self::Gid),
            "size" => Ok(Self::Size),
            "mtime" => Ok(Self::Mtime),
            "link" => Ok(Self::Link),
            "sha256" => Ok(Self::Sha256),
            _ => Err(format!("unknown snapshot keyword: '{}'", s)),
        }
    }
}

/// Layer packaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Compression for new layer blobs
    pub compression: LayerCompression,

    /// Gzip level, 0-9
    pub gzip_level: u32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            compression: LayerCompression::Gzip,
            gzip_level: 6,
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Metadata fields compared when classifying changes
    pub keywords: Vec<Keyword>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            keywords: Keyword::defaults(),
        }
    }
}

/// Casket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CasketConfig {
    /// Layer packaging
    pub layer: LayerConfig,

    /// Snapshot keywords
    pub snapshot: SnapshotConfig,

    /// Name of the rootfs directory inside a bundle
    pub rootfs_name: String,

    /// Author recorded in history entries when none is given
    pub default_author: Option<String>,
}

impl Default for CasketConfig {
    fn default() -> Self {
        Self {
            layer: LayerConfig::default(),
            snapshot: SnapshotConfig::default(),
            rootfs_name: "rootfs".to_string(),
            default_author: None,
        }
    }
}

impl CasketConfig {
    /// Default config file location (~/.casket/config.yaml).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".casket"))
            .unwrap_or_else(|| PathBuf::from(".casket"))
            .join("config.yaml")
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            CasketError::io(format!("Failed to read config {}", path.display()), e)
        })?;
        let config: CasketConfig = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, else from the default location when it
    /// exists, else built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => {
                let default = Self::default_path();
                if default.exists() {
                    tracing::debug!(path = %default.display(), "Loading default config");
                    Self::from_file(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.layer.gzip_level > 9 {
            return Err(CasketError::ConfigError(format!(
                "gzip_level must be between 0 and 9, got {}",
                self.layer.gzip_level
            )));
        }
        if self.rootfs_name.is_empty()
            || self.rootfs_name.contains('/')
            || self.rootfs_name == "."
            || self.rootfs_name == ".."
        {
            return Err(CasketError::ConfigError(format!(
                "rootfs_name must be a single path component, got {:?}",
                self.rootfs_name
            )));
        }
        if !self.snapshot.keywords.contains(&Keyword::Type) {
            return Err(CasketError::ConfigError(
                "snapshot keywords must include 'type'".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = CasketConfig::default();
        assert_eq!(config.layer.compression, LayerCompression::Gzip);
        assert_eq!(config.rootfs_name, "rootfs");
        assert!(config.snapshot.keywords.contains(&Keyword::Mtime));
        assert!(!config.snapshot.keywords.contains(&Keyword::Sha256));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "layer:\n  compression: none\n").unwrap();

        let config = CasketConfig::from_file(&path).unwrap();
        assert_eq!(config.layer.compression, LayerCompression::None);
        assert_eq!(config.layer.gzip_level, 6);
        assert_eq!(config.snapshot.keywords, Keyword::defaults());
    }

    #[test]
    fn test_keywords_from_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "snapshot:\n  keywords: [type, size, sha256]\n").unwrap();

        let config = CasketConfig::from_file(&path).unwrap();
        assert_eq!(
            config.snapshot.keywords,
            vec![Keyword::Type, Keyword::Size, Keyword::Sha256]
        );
    }

    #[test]
    fn test_invalid_gzip_level_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.yaml");
        std::fs::write(&path, "layer:\n  gzip_level: 12\n").unwrap();

        let err = CasketConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, CasketError::ConfigError(_)));
    }

    #[test]
    fn test_keywords_without_type_rejected() {
        let mut config = CasketConfig::default();
        config.snapshot.keywords = vec![Keyword::Size];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CasketConfig::from_file(Path::new("/nonexistent/casket.yaml")).unwrap_err();
        assert!(matches!(err, CasketError::Io { .. }));
    }

    #[test]
    fn test_compression_from_str() {
        assert_eq!("gzip".parse::<LayerCompression>().unwrap(), LayerCompression::Gzip);
        assert_eq!("none".parse::<LayerCompression>().unwrap(), LayerCompression::None);
        assert!("zstd".parse::<LayerCompression>().is_err());
    }

    #[test]
    fn test_keyword_display_roundtrip() {
        for kw in Keyword::defaults() {
            assert_eq!(kw.to_string().parse::<Keyword>().unwrap(), kw);
        }
        assert!("xattr".parse::<Keyword>().is_err());
    }
}
