use anyhow::Context;
use clap::Parser;
use htr_dataset::{
    AugmentationPolicy, BatchLoader, BatchTensor, CollatedBatch, DatasetResult, PrefetchLoader,
    SampleSource,
};
use htr_tools::{init_tracing, open_source, StoreArgs};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "batch_preview",
    about = "Run a few batches through the loader and report shapes and label lengths"
)]
struct Args {
    #[command(flatten)]
    store: StoreArgs,
    /// Number of batches to pull.
    #[arg(long, default_value_t = 3)]
    batches: usize,
    #[arg(long)]
    batch_size: Option<usize>,
    /// Enable warp and scale augmentation regardless of the config.
    #[arg(long, default_value_t = false)]
    augment: bool,
    #[arg(long)]
    seed: Option<u64>,
    /// Write the first batch's images (denormalized) as PNGs into this directory.
    #[arg(long)]
    dump_dir: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let mut cfg = args.store.resolve()?;
    if let Some(bs) = args.batch_size {
        cfg.loader.batch_size = bs;
    }
    if args.seed.is_some() {
        cfg.loader.seed = args.seed;
        cfg.augment.seed = args.seed;
    }
    if args.augment {
        cfg.augment.augment = true;
        cfg.augment.scale = true;
    }
    let policy = AugmentationPolicy::from_config(&cfg.augment)?;
    let codec = cfg.codec();
    info!(policy = %policy.describe(), classes = codec.num_classes(), "batch preview");

    let batches: Box<dyn Iterator<Item = DatasetResult<CollatedBatch>>> = if cfg.workers > 0 {
        let path = cfg
            .store_path
            .clone()
            .context("no store given; pass --store or set store.path in the tools config")?;
        let source_cfg = cfg.source.clone();
        let factory = move || SampleSource::open(&path, source_cfg.clone());
        Box::new(PrefetchLoader::spawn(
            factory,
            policy,
            cfg.collate,
            cfg.loader.clone(),
            0,
            cfg.workers,
            cfg.prefetch,
        )?)
    } else {
        let source = Arc::new(open_source(&cfg)?);
        Box::new(BatchLoader::from_config(
            source,
            policy,
            cfg.collate,
            cfg.loader.clone(),
        )?)
    };

    for (i, batch) in batches.take(args.batches).enumerate() {
        let batch = batch?;
        let lengths: Vec<Option<usize>> = batch
            .labels
            .iter()
            .map(|label| match codec.encode_one(label) {
                Ok(encoded) => Some(encoded.codes.len()),
                Err(e) => {
                    warn!(label = %label, "unencodable label: {e}");
                    None
                }
            })
            .collect();
        println!(
            "batch {i}: shape={:?} ordinals={:?} label_lengths={:?}",
            batch.images.shape, batch.ordinals, lengths
        );
        if i == 0 {
            if let Some(dir) = &args.dump_dir {
                dump_batch(&batch.images, &batch.file_ids, dir)?;
                println!("wrote {} images to {}", batch.len(), dir.display());
            }
        }
    }
    Ok(())
}

fn to_u8(v: f32) -> u8 {
    ((v + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
}

fn dump_batch(images: &BatchTensor, file_ids: &[String], dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let (w, h) = (images.width() as u32, images.height() as u32);
    let plane = images.width() * images.height();
    for (i, file_id) in file_ids.iter().enumerate() {
        let item = images.item(i);
        let stem = Path::new(file_id)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("item{i}"));
        let out = dir.join(format!("{i:03}_{stem}.png"));
        let at = |c: usize, x: u32, y: u32| to_u8(item[c * plane + (y * w + x) as usize]);
        let saved = if images.channels() == 1 {
            GrayImage::from_fn(w, h, |x, y| Luma([at(0, x, y)])).save(&out)
        } else {
            RgbImage::from_fn(w, h, |x, y| Rgb([at(0, x, y), at(1, x, y), at(2, x, y)])).save(&out)
        };
        saved.with_context(|| format!("writing {}", out.display()))?;
    }
    Ok(())
}
