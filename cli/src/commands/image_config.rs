//! `casket config` command — Modify the configuration of an image.
//!
//! Each invocation adds one empty-layer history entry.

use std::collections::BTreeMap;

use casket_core::CasketConfig;
use casket_runtime::{ConfigEdit, Mutator};
use clap::Args;

use super::HistoryOpts;
use crate::resolve::ImageRef;

#[derive(Args)]
pub struct ConfigArgs {
    /// Image to modify
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,

    /// Tag for the new image (default: the tag given in --image)
    #[arg(long, value_name = "TAG")]
    pub tag: Option<String>,

    /// User (and optionally group) processes run as
    #[arg(long = "config.user", value_name = "USER[:GROUP]")]
    pub user: Option<String>,

    /// Working directory of the entrypoint
    #[arg(long = "config.workingdir", value_name = "DIR")]
    pub working_dir: Option<String>,

    /// Set an environment variable (repeatable)
    #[arg(long = "config.env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Entrypoint, one argument per flag (repeatable)
    #[arg(long = "config.entrypoint", value_name = "ARG", allow_hyphen_values = true)]
    pub entrypoint: Vec<String>,

    /// Default command, one argument per flag (repeatable)
    #[arg(long = "config.cmd", value_name = "ARG", allow_hyphen_values = true)]
    pub cmd: Vec<String>,

    /// Set a label (repeatable)
    #[arg(long = "config.label", value_name = "KEY=VALUE")]
    pub label: Vec<String>,

    /// Remove a label (repeatable)
    #[arg(long = "config.remove-label", value_name = "KEY")]
    pub remove_label: Vec<String>,

    /// Expose a port, e.g. 8080/tcp (repeatable)
    #[arg(long = "config.exposedports", value_name = "PORT[/PROTO]")]
    pub exposed_ports: Vec<String>,

    /// Declare a volume (repeatable)
    #[arg(long = "config.volume", value_name = "PATH")]
    pub volume: Vec<String>,

    /// Signal sent to stop the container
    #[arg(long = "config.stopsignal", value_name = "SIGNAL")]
    pub stop_signal: Option<String>,

    /// Image author
    #[arg(long)]
    pub author: Option<String>,

    /// Image architecture
    #[arg(long)]
    pub architecture: Option<String>,

    /// Image operating system
    #[arg(long)]
    pub os: Option<String>,

    #[command(flatten)]
    pub history: HistoryOpts,
}

impl ConfigArgs {
    fn to_edit(&self) -> Result<ConfigEdit, Box<dyn std::error::Error>> {
        let mut labels = BTreeMap::new();
        for pair in &self.label {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("label {pair:?} must have the form KEY=VALUE"))?;
            labels.insert(key.to_string(), value.to_string());
        }

        Ok(ConfigEdit {
            user: self.user.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            entrypoint: (!self.entrypoint.is_empty()).then(|| self.entrypoint.clone()),
            cmd: (!self.cmd.is_empty()).then(|| self.cmd.clone()),
            labels,
            remove_labels: self.remove_label.clone(),
            exposed_ports: self.exposed_ports.clone(),
            volumes: self.volume.clone(),
            stop_signal: self.stop_signal.clone(),
            author: self.author.clone(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
        })
    }
}

pub async fn execute(args: ConfigArgs, config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let edit = args.to_edit()?;
    if edit.is_empty() {
        return Err("no configuration changes given".into());
    }

    let engine = super::open_engine(&args.image.dir)?;
    let source = super::resolve_tag(&engine, &args.image.tag)?;

    let history = args.history.to_history("casket config", config)?;
    let mut mutator = Mutator::new(&engine, source)?;
    mutator.add_config_edit(&edit, history)?;
    let path = mutator.commit()?;

    let tag = args.tag.as_deref().unwrap_or(&args.image.tag);
    engine.update_reference(tag, path.root())?;

    println!("{} {}", tag, path.descriptor().digest);
    engine.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;

    fn parse(args: &[&str]) -> ConfigArgs {
        let mut argv = vec!["casket", "config", "--image", "img"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Config(args) => args,
            _ => panic!("expected config"),
        }
    }

    #[test]
    fn test_to_edit() {
        let args = parse(&[
            "--config.user",
            "app",
            "--config.env",
            "A=1",
            "--config.entrypoint",
            "/bin/sh",
            "--config.entrypoint",
            "-c",
            "--config.label",
            "tier=web",
            "--os",
            "linux",
        ]);
        let edit = args.to_edit().unwrap();
        assert_eq!(edit.user.as_deref(), Some("app"));
        assert_eq!(edit.env, vec!["A=1".to_string()]);
        assert_eq!(
            edit.entrypoint,
            Some(vec!["/bin/sh".to_string(), "-c".to_string()])
        );
        assert_eq!(edit.labels["tier"], "web");
        assert!(edit.cmd.is_none());
    }

    #[test]
    fn test_bad_label_rejected() {
        let args = parse(&["--config.label", "novalue"]);
        assert!(args.to_edit().is_err());
    }

    #[test]
    fn test_no_flags_is_empty() {
        assert!(parse(&[]).to_edit().unwrap().is_empty());
    }
}
