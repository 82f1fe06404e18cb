// read_weights - inspect a tessel parameter file
//
//   read_weights net.tswt                 layer names and blob shapes
//   read_weights net.tswt --layer ip1     plus the values of one layer
//   read_weights net.tswt --layer m --planes
//                                         4-D blobs of that layer, plane by plane

use anyhow::{bail, Context, Result};
use clap::Parser;
use tessel::weights;

#[derive(Debug, Parser)]
#[command(about = "Print the layers and parameter blobs stored in a weights file")]
struct Args {
    /// Parameter file to read.
    path: std::path::PathBuf,
    /// Print the values of this layer's blobs.
    #[arg(short, long)]
    layer: Option<String>,
    /// Maximum number of values printed per blob.
    #[arg(long, default_value_t = 16)]
    limit: usize,
    /// Print 4-D and legacy blobs in full, one height x width plane at a time.
    #[arg(long, requires = "layer")]
    planes: bool,
}

fn main() -> Result<()> {
    tessel::init_logging();
    let args = Args::parse();

    let records = weights::read_records(&args.path)
        .with_context(|| format!("reading {}", args.path.display()))?;

    for record in &records {
        println!("{} ({} blobs)", record.name, record.blobs.len());
        for (i, blob) in record.blobs.iter().enumerate() {
            let kind = if blob.legacy { " legacy" } else { "" };
            println!(
                "  [{i}] {}{kind} {} x {}",
                blob.shape,
                blob.count(),
                blob.storage.dtype()
            );
        }
    }

    if let Some(name) = &args.layer {
        let Some(record) = records.iter().find(|r| &r.name == name) else {
            bail!("no layer named '{name}' in {}", args.path.display());
        };
        for (i, blob) in record.blobs.iter().enumerate() {
            if args.planes {
                if let Some(planes) = blob.render_planes() {
                    println!("{name}[{i}] {}:", blob.shape);
                    print!("{planes}");
                    continue;
                }
            }
            let values = blob.storage.to_f64_vec();
            let shown: Vec<String> = values
                .iter()
                .take(args.limit)
                .map(|v| format!("{v:.6}"))
                .collect();
            let more = if values.len() > args.limit { ", ..." } else { "" };
            println!("{name}[{i}] = [{}{more}]", shown.join(", "));
        }
    }
    Ok(())
}
