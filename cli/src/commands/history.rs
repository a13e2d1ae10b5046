//! `casket history` command — Show image layer history.

use casket_core::CasketConfig;
use clap::Args;

use crate::output;
use crate::resolve::ImageRef;

#[derive(Args)]
pub struct HistoryArgs {
    /// Image to inspect
    #[arg(long, value_name = "DIR[:TAG]")]
    pub image: ImageRef,

    /// Only print layer diff IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Do not truncate output
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(args: HistoryArgs, _config: &CasketConfig) -> Result<(), Box<dyn std::error::Error>> {
    let engine = super::open_engine(&args.image.dir)?;
    let path = super::resolve_tag(&engine, &args.image.tag)?;
    let manifest = engine.get_manifest(path.descriptor())?;
    let config = engine.get_config(&manifest.config)?;

    if args.quiet {
        for id in &config.rootfs.diff_ids {
            println!("{id}");
        }
        engine.close();
        return Ok(());
    }

    let mut table = output::new_table(&["LAYER", "CREATED", "CREATED BY", "SIZE", "COMMENT"]);
    let mut layers = manifest.layers.iter();

    for entry in &config.history {
        let created = entry
            .created
            .as_deref()
            .map(output::format_timestamp)
            .unwrap_or_else(|| "<unknown>".to_string());

        let created_by = entry.created_by.clone().unwrap_or_default();
        let created_by = if args.no_trunc {
            created_by
        } else {
            output::truncate_str(&created_by, 60)
        };

        let (layer, size) = if entry.empty_layer {
            ("<none>".to_string(), "0 B".to_string())
        } else {
            match layers.next() {
                Some(layer) => {
                    let digest = layer.digest.to_string();
                    let digest = if args.no_trunc {
                        digest
                    } else {
                        output::truncate_str(&digest, 19)
                    };
                    (digest, output::format_bytes(layer.size))
                }
                None => ("<missing>".to_string(), String::new()),
            }
        };

        let comment = entry.comment.clone().unwrap_or_default();
        table.add_row([&layer, &created, &created_by, &size, &comment]);
    }

    println!("{table}");
    engine.close();
    Ok(())
}
