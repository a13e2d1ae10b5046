//! `casket insert` command — Add a host file or directory to an image
//! without unpacking it.

use std::path::PathBuf;

use casket_core::CasketConfig;
use casket_runtime::{pack_insert, Mutator};
use clap::Args;

use super::{HistoryOpts, IdMapOpts};
use crate::resolve::ImageRef;

#[derive(Args)]
pub struct InsertArgs {
    /// Image to insert into; the tag is updated in place
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,

    #[command(flatten)]
    pub history: HistoryOpts,

    #[command(flatten)]
    pub idmap: IdMapOpts,

    /// File or directory on the host (directories are inserted recursively)
    pub file: PathBuf,

    /// Absolute path inside the image
    pub path: String,
}

pub async fn execute(args: InsertArgs, config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    if args.path.is_empty() {
        return Err("<path> cannot be empty".into());
    }

    let engine = super::open_engine(&args.image.dir)?;
    let source = super::resolve_tag(&engine, &args.image.tag)?;

    let history = args.history.to_history("casket insert", config)?;
    let mut mutator = Mutator::new(&engine, source)?;
    let map = args.idmap.to_map();
    let layer = pack_insert(engine.blobs(), &args.file, &args.path, &config.layer, &map)?;
    mutator.add(&layer, history)?;
    let path = mutator.commit()?;

    engine.update_reference(&args.image.tag, path.root())?;
    tracing::info!(tag = %args.image.tag, "Updated tag");

    println!("{} {}", args.image, path.descriptor().digest);
    engine.close();
    Ok(())
}
