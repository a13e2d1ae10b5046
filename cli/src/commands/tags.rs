//! `casket tags` command — List the tags of an image layout.

use std::path::PathBuf;

use casket_core::CasketConfig;
use clap::Args;

use crate::output;

#[derive(Args)]
pub struct TagsArgs {
    /// Image layout directory
    #[arg(long, value_name = "DIR")]
    pub image: PathBuf,

    /// Only print tag names
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: TagsArgs, _config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(&args.image)?;
    let names = engine.list_references()?;

    if args.quiet {
        for name in &names {
            println!("{name}");
        }
        engine.close();
        return Ok(());
    }

    let mut table = output::new_table(&["TAG", "MEDIA TYPE", "DIGEST", "SIZE"]);
    for name in &names {
        let target = engine.get_reference(name)?;
        table.add_row([
            name.clone(),
            target.media_type.to_string(),
            output::truncate_str(&target.digest.to_string(), 19),
            output::format_bytes(target.size),
        ]);
    }
    println!("{table}");

    engine.close();
    Ok(())
}
