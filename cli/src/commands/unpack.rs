//! `casket unpack` command — Extract an image into a runtime bundle.

use std::path::PathBuf;

use casket_core::CasketConfig;
use clap::Args;

use super::IdMapOpts;
use crate::resolve::ImageRef;

#[derive(Args)]
pub struct UnpackArgs {
    /// Image to unpack
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,

    #[command(flatten)]
    pub idmap: IdMapOpts,

    /// Bundle directory; the rootfs is created inside it
    pub bundle: PathBuf,
}

pub async fn execute(args: UnpackArgs, config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(&args.image.dir)?;
    let path = super::resolve_tag(&engine, &args.image.tag)?;

    std::fs::create_dir_all(&args.bundle)
        .map_err(|e| format!("Failed to create bundle {}: {e}", args.bundle.display()))?;
    let map = args.idmap.to_map();
    let unpacked = casket_runtime::unpack(&engine, &path, &args.bundle, config, &map)?;

    println!(
        "Unpacked {} ({} entries) into {}",
        args.image,
        unpacked.snapshot.entries.len(),
        unpacked.rootfs.display()
    );
    engine.close();
    Ok(())
}
