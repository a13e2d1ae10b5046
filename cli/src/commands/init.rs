//! `casket init` command — Create a new image layout.

use std::path::PathBuf;

use casket_core::CasketConfig;
use casket_runtime::CasEngine;
use clap::Args;

#[derive(Args)]
pub struct InitArgs {
    /// Directory to create the image layout in
    #[arg(long, value_name = "DIR")]
    pub image: PathBuf,

    /// Also store an empty image (no layers) under this tag
    #[arg(long, value_name = "TAG")]
    pub tag: Option<String>,
}

pub async fn execute(args: InitArgs, _config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = CasEngine::create(&args.image)?;

    if let Some(tag) = &args.tag {
        let manifest = engine.put_empty_image()?;
        engine.update_reference(tag, &manifest)?;
        println!("{}:{} {}", args.image.display(), tag, manifest.digest);
    } else {
        println!("{}", args.image.display());
    }

    engine.close();
    Ok(())
}
