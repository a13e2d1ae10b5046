//! `casket repack` command — Turn the changes made to a bundle into a new
//! layer on top of the image it was unpacked from.

use std::path::PathBuf;

use casket_core::CasketConfig;
use casket_runtime::{pack_changeset, snapshot_path, ChangeKind, Mutator, Snapshot};
use clap::Args;

use super::{HistoryOpts, IdMapOpts};
use crate::resolve::ImageRef;

#[derive(Args)]
pub struct RepackArgs {
    /// Image the bundle was unpacked from
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,

    /// Tag for the new image (default: the tag given in --image)
    #[arg(long, value_name = "TAG")]
    pub tag: Option<String>,

    #[command(flatten)]
    pub history: HistoryOpts,

    /// Overrides the mapping recorded at unpack time
    #[command(flatten)]
    pub idmap: IdMapOpts,

    /// Bundle directory created by `casket unpack`
    pub bundle: PathBuf,
}

pub async fn execute(args: RepackArgs, config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(&args.image.dir)?;
    let source = super::resolve_tag(&engine, &args.image.tag)?;

    let manifest_digest = &source.descriptor().digest;
    let mut snapshot = Snapshot::load(&snapshot_path(&args.bundle, manifest_digest)).map_err(|e| {
        format!(
            "{e} (was {} unpacked from {}?)",
            args.bundle.display(),
            args.image
        )
    })?;

    if args.idmap.is_set() {
        snapshot.map = args.idmap.to_map();
    }

    let rootfs = args.bundle.join(&config.rootfs_name);
    let changes = snapshot.diff(&rootfs)?;
    for change in &changes {
        tracing::debug!(path = %change.path.display(), kind = %change.kind, "Change");
    }
    let deleted = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Deleted)
        .count();

    let history = args.history.to_history("casket repack", config)?;
    let mut mutator = Mutator::new(&engine, source)?;
    let layer = pack_changeset(
        engine.blobs(),
        &rootfs,
        &changes,
        &config.layer,
        &snapshot.map,
    )?;
    mutator.add(&layer, history)?;
    let path = mutator.commit()?;

    let tag = args.tag.as_deref().unwrap_or(&args.image.tag);
    engine.update_reference(tag, path.root())?;

    // The bundle now corresponds to the new manifest
    let fresh = Snapshot::capture_mapped(&rootfs, &snapshot.keywords, &snapshot.map)?;
    fresh.save(&snapshot_path(&args.bundle, &path.descriptor().digest))?;

    println!(
        "{} changes ({} deleted) -> {} {}",
        changes.len(),
        deleted,
        tag,
        path.descriptor().digest
    );
    engine.close();
    Ok(())
}
