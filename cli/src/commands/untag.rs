//! `casket untag` command — Remove a tag. Blobs are left in place.

use casket_core::CasketConfig;
use clap::Args;

use crate::resolve::ImageRef;

#[derive(Args)]
pub struct UntagArgs {
    /// Tag to remove
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,
}

pub async fn execute(args: UntagArgs, _config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(&args.image.dir)?;

    // Whatever the tag points at, it can be removed
    match engine.get_reference(&args.image.tag) {
        Ok(_) => {}
        Err(e) if e.is_not_found() => {
            return Err(format!("tag not found: {}", args.image.tag).into())
        }
        Err(e) => return Err(e.into()),
    }
    engine.delete_reference(&args.image.tag)?;

    println!("{}", args.image.tag);
    engine.close();
    Ok(())
}
