//! `casket tag` command — Create a tag that refers to an existing image.

use casket_core::CasketConfig;
use clap::Args;

use crate::resolve::ImageRef;

#[derive(Args)]
pub struct TagArgs {
    /// Source image
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,

    /// New tag
    pub tag: String,
}

pub async fn execute(args: TagArgs, _config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(&args.image.dir)?;

    // Resolve first so an ambiguous or dangling source is rejected.
    super::resolve_tag(&engine, &args.image.tag)?;
    let target = engine.get_reference(&args.image.tag)?;

    // Same target: the reference itself, not the resolved manifest.
    // An existing tag is replaced atomically.
    engine.update_reference(&args.tag, &target)?;

    println!("{}", args.tag);
    engine.close();
    Ok(())
}
