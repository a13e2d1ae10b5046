//! CLI command definitions and dispatch.

mod history;
mod image_config;
mod image_tag;
mod init;
mod insert;
mod repack;
mod tags;
mod unpack;
mod untag;

use std::path::{Path, PathBuf};

use casket_core::CasketConfig;
use casket_runtime::{CasEngine, DescriptorPath, History, IdMap, MapOptions};
use clap::{Args, Parser, Subcommand};

/// Casket - build and modify OCI images on disk.
#[derive(Parser)]
#[command(name = "casket", version, about)]
pub struct Cli {
    /// Configuration file (default: ~/.casket/config.yaml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "casket_runtime=debug" (overrides RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Create a new image layout
    Init(init::InitArgs),
    /// Extract an image into a runtime bundle
    Unpack(unpack::UnpackArgs),
    /// Record the changes made to a bundle as a new layer
    Repack(repack::RepackArgs),
    /// Add a host file or directory to an image as a new layer
    Insert(insert::InsertArgs),
    /// Modify the runtime configuration of an image
    Config(image_config::ConfigArgs),
    /// Point a new tag at the image an existing tag refers to
    Tag(image_tag::TagArgs),
    /// Remove a tag
    Untag(untag::UntagArgs),
    /// List the tags of an image layout
    Tags(tags::TagsArgs),
    /// Show the history of an image
    History(history::HistoryArgs),
}

/// History flags shared by every command that creates a new image.
#[derive(Args, Debug, Default, Clone)]
pub struct HistoryOpts {
    /// Author of the history entry
    #[arg(id = "history_author", long = "history.author", value_name = "AUTHOR")]
    pub author: Option<String>,

    /// Comment of the history entry
    #[arg(id = "history_comment", long = "history.comment", value_name = "COMMENT")]
    pub comment: Option<String>,

    /// Creation time of the history entry (RFC 3339)
    #[arg(id = "history_created", long = "history.created", value_name = "TIME")]
    pub created: Option<String>,

    /// Command recorded as having created the entry
    #[arg(id = "history_created_by", long = "history.created-by", value_name = "COMMAND")]
    pub created_by: Option<String>,
}

impl HistoryOpts {
    /// Build the history entry, falling back to `default_created_by` and
    /// the configured default author.
    pub fn to_history(
        &self,
        default_created_by: &str,
        config: &CasketConfig,
    ) -> Result<History, Box<dyn std::error::Error>> {
        let created_by = self.created_by.as_deref().unwrap_or(default_created_by);
        let mut history = History::new(created_by);
        if let Some(author) = self.author.as_ref().or(config.default_author.as_ref()) {
            history = history.with_author(author);
        }
        if let Some(comment) = &self.comment {
            history = history.with_comment(comment);
        }
        if let Some(created) = &self.created {
            history = history.with_created(created)?;
        }
        Ok(history)
    }
}

/// Id mapping flags shared by commands that read or write layers.
#[derive(Args, Debug, Default, Clone)]
pub struct IdMapOpts {
    /// Never change ownership on the host; without maps the caller is root in the image
    #[arg(long)]
    pub rootless: bool,

    /// Uid range as CONTAINER:HOST[:SIZE] (repeatable)
    #[arg(long = "uid-map", value_name = "MAP")]
    pub uid_map: Vec<IdMap>,

    /// Gid range as CONTAINER:HOST[:SIZE] (repeatable)
    #[arg(long = "gid-map", value_name = "MAP")]
    pub gid_map: Vec<IdMap>,
}

impl IdMapOpts {
    pub fn is_set(&self) -> bool {
        self.rootless || !self.uid_map.is_empty() || !self.gid_map.is_empty()
    }

    pub fn to_map(&self) -> MapOptions {
        MapOptions::new(self.rootless, self.uid_map.clone(), self.gid_map.clone())
    }
}

/// Open the image layout at `dir`.
pub(crate) fn open_engine(dir: &Path) -> Result<CasEngine, Box<dyn std::error::Error>> {
    Ok(CasEngine::open(dir)?)
}

/// Resolve a tag to exactly one manifest.
pub(crate) fn resolve_tag(
    engine: &CasEngine,
    tag: &str,
) -> Result<DescriptorPath, Box<dyn std::error::Error>> {
    Ok(engine.resolve_single(tag)?)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = CasketConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Init(args) => init::execute(args, &config).await,
        Command::Unpack(args) => unpack::execute(args, &config).await,
        Command::Repack(args) => repack::execute(args, &config).await,
        Command::Insert(args) => insert::execute(args, &config).await,
        Command::Config(args) => image_config::execute(args, &config).await,
        Command::Tag(args) => image_tag::execute(args, &config).await,
        Command::Untag(args) => untag::execute(args, &config).await,
        Command::Tags(args) => tags::execute(args, &config).await,
        Command::History(args) => history::execute(args, &config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_history_flags() {
        let cli = Cli::try_parse_from([
            "casket",
            "--log-level",
            "debug",
            "repack",
            "--image",
            "img:v1",
            "--history.author",
            "ops",
            "--history.created-by",
            "make rootfs",
            "bundle",
        ])
        .unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Repack(args) => {
                assert_eq!(args.image.tag, "v1");
                assert_eq!(args.history.author.as_deref(), Some("ops"));
                assert_eq!(args.history.created_by.as_deref(), Some("make rootfs"));
            }
            _ => panic!("expected repack"),
        }
    }

    #[test]
    fn test_history_opts_defaults() {
        let config = CasketConfig {
            default_author: Some("builder".to_string()),
            ..Default::default()
        };

        let history = HistoryOpts::default()
            .to_history("casket repack", &config)
            .unwrap();
        assert_eq!(history.created_by.as_deref(), Some("casket repack"));
        assert_eq!(history.author.as_deref(), Some("builder"));
        assert!(history.created.is_some());
    }

    #[test]
    fn test_idmap_opts_parse_ranges() {
        let cli = Cli::try_parse_from([
            "casket",
            "unpack",
            "--image",
            "img:latest",
            "--uid-map",
            "0:100000:65536",
            "--gid-map",
            "0:100000",
            "bundle",
        ])
        .unwrap();
        let Command::Unpack(args) = cli.command else {
            panic!("expected unpack");
        };
        assert!(args.idmap.is_set());
        let map = args.idmap.to_map();
        assert!(!map.rootless);
        assert_eq!(map.to_host_uid(1).unwrap(), 100001);
        assert_eq!(map.gid_map[0].size, 1);

        assert!(Cli::try_parse_from([
            "casket", "unpack", "--image", "img", "--uid-map", "nonsense", "bundle",
        ])
        .is_err());
    }

    #[test]
    fn test_history_opts_rejects_bad_timestamp() {
        let opts = HistoryOpts {
            created: Some("last tuesday".to_string()),
            ..Default::default()
        };
        assert!(opts
            .to_history("casket insert", &CasketConfig::default())
            .is_err());
    }
}
