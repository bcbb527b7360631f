use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use structopt::StructOpt;

use reichat::codec;
use reichat::Canvas;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "dump",
    about = "Flatten persisted layer snapshots into a single image",
    author
)]
struct Opt {
    /// Data directory holding the layer snapshots
    data_dir: PathBuf,

    /// Snapshot file prefix
    #[structopt(long, default_value = "")]
    prefix: String,

    /// Canvas width
    #[structopt(short, long, default_value = "1920")]
    width: u32,

    /// Canvas height
    #[structopt(short = "H", long, default_value = "1080")]
    height: u32,

    /// Number of layers
    #[structopt(short, long, default_value = "3")]
    layers: usize,

    /// Output file; stdout when omitted
    #[structopt(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    let mut canvas = Canvas::new(opt.width, opt.height, opt.layers);
    for n in 0..opt.layers {
        let path = opt
            .data_dir
            .join(format!("{}layer{}.{}", opt.prefix, n, codec::SNAPSHOT_EXT));
        let blob = match fs::read(&path) {
            Ok(blob) => blob,
            // Absent layers stay blank.
            Err(_) => continue,
        };
        let raster =
            codec::decode(&blob).with_context(|| format!("Couldn't decode {:?}", path))?;
        if (raster.width, raster.height) != (opt.width, opt.height) {
            bail!(
                "{:?} is {}x{}, expected {}x{}",
                path,
                raster.width,
                raster.height,
                opt.width,
                opt.height
            );
        }
        if let Some(layer) = canvas.layer_mut(n) {
            layer.load(raster.data, Some(blob));
        }
    }

    let flat = canvas.flatten()?;
    match opt.output {
        Some(path) => {
            fs::write(&path, flat).with_context(|| format!("Couldn't write {:?}", path))?
        }
        None => io::stdout().write_all(&flat)?,
    }
    Ok(())
}
