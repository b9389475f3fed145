//! gaitscope CLI for inspecting attribution bundles and embedding descriptors.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gaitscope_analysis::{
    EmbeddingBundle, EmbeddingConfig, EmbeddingRecord, PcaReducer, StreamingEmbedder,
};
use gaitscope_core::{LayerInfo, Seed, TensorLayout};
use gaitscope_explain::{comparison_frames, AttributionBundle, HookRegistry};
use ndarray::{ArrayD, Axis};
use ndarray_npy::NpzReader;

#[derive(Parser)]
#[command(name = "gaitscope")]
#[command(author, version)]
#[command(about = "Gait encoder diagnostics - inspect saliency bundles and embed descriptors")]
#[command(long_about = "gaitscope: diagnostics for silhouette-sequence gait encoders.

EXAMPLES:
  # Show what a saliency bundle holds
  gaitscope bundle-info ./visualization/GaitSet_075-nm-05-090.npz

  # Align frames and heatmaps to a common length and overlay them
  gaitscope compare ./visualization/GaitSet_075-nm-05-090.npz --opacity 0.6

  # Embed descriptors in buckets of 500
  gaitscope embed feats.npz --labels labels.json --bucket 500 --out embedding.npz

  # Render a layer table for picking layer ids
  gaitscope layers layers.json")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the sequence key, frames and per-layer heatmap counts of a bundle
    BundleInfo {
        /// Bundle archive (.npz) or manifest (.json)
        path: PathBuf,
    },
    /// Align a bundle's frames and layers to a common length and overlay them
    Compare {
        /// Bundle archive (.npz) or manifest (.json)
        path: PathBuf,

        /// Heatmap opacity in [0, 1]
        #[arg(long, default_value = "0.6", value_name = "ALPHA")]
        opacity: f32,

        /// Output archive (defaults to <bundle>_compare.npz)
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Embed the descriptors of an npz archive bucket by bucket
    Embed {
        /// Archive holding a `feats` array of shape (N, C, P) or (N, D)
        path: PathBuf,

        /// JSON list of N labels (defaults to row indices)
        #[arg(long, value_name = "PATH")]
        labels: Option<PathBuf>,

        /// JSON embedding configuration; flags given explicitly override it
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Records reduced together
        #[arg(long, value_name = "K")]
        bucket: Option<usize>,

        /// Embedding dimension
        #[arg(long, value_name = "D")]
        dim: Option<usize>,

        /// Random seed of the reducer
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,

        /// Refuse buckets holding more values than this
        #[arg(long, value_name = "N")]
        max_values: Option<usize>,

        /// Output archive
        #[arg(long, default_value = "embedding.npz", value_name = "PATH")]
        out: PathBuf,
    },
    /// Render a layer table from a JSON list of {name, kind} entries
    Layers {
        /// Layer list
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    match cli.command {
        Commands::BundleInfo { path } => handle_bundle_info(&path),
        Commands::Compare { path, opacity, out } => handle_compare(&path, opacity, out),
        Commands::Embed {
            path,
            labels,
            config,
            bucket,
            dim,
            seed,
            max_values,
            out,
        } => {
            let mut embed_config = match config {
                Some(config) => EmbeddingConfig::from_json_file(&config)
                    .with_context(|| format!("Failed to load config '{}'", config.display()))?,
                None => EmbeddingConfig::default(),
            };
            if let Some(bucket) = bucket {
                embed_config.bucket_capacity = bucket;
            }
            if let Some(dim) = dim {
                embed_config.embed_dim = dim;
            }
            if let Some(seed) = seed {
                embed_config.seed = Seed::new(seed);
            }
            handle_embed(&path, labels.as_deref(), &embed_config, max_values, &out)
        }
        Commands::Layers { path } => handle_layers(&path),
    }
}

fn handle_bundle_info(path: &Path) -> Result<()> {
    let (bundle, manifest) = AttributionBundle::load(path)
        .with_context(|| format!("Failed to load bundle '{}'", path.display()))?;
    let (t, h, w, _) = bundle.frames().dim();

    println!("Bundle: {}", path.display());
    println!("─────────────────────────────────────────");
    println!("  Model:     {}", manifest.model);
    println!("  Subject:   {}", bundle.key().subject);
    println!("  Condition: {}", bundle.key().condition);
    println!("  View:      {}", bundle.key().view);
    println!("  Frames:    {} ({}x{})", t, h, w);
    println!("\nHeatmaps:");
    for layer in bundle.layers() {
        println!("  {:<32} {:>4} frame(s)", layer.tag, layer.len());
    }
    Ok(())
}

fn handle_compare(path: &Path, opacity: f32, out: Option<PathBuf>) -> Result<()> {
    let (bundle, _) = AttributionBundle::load(path)
        .with_context(|| format!("Failed to load bundle '{}'", path.display()))?;
    let stack = comparison_frames(&bundle, opacity).context("Failed to build comparison")?;

    let out = out.unwrap_or_else(|| {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bundle".to_string());
        path.with_file_name(format!("{stem}_compare.npz"))
    });
    stack
        .save(&out)
        .with_context(|| format!("Failed to write '{}'", out.display()))?;

    println!("Aligned to {} frame(s):", stack.length);
    for tag in &stack.tags {
        println!("  {}", tag);
    }
    println!("\nSaved comparison to {}", out.display());
    Ok(())
}

/// Read `feats` as f32, converting from f64 if needed.
fn read_feats(path: &Path) -> Result<ArrayD<f32>> {
    let open = || -> Result<NpzReader<File>> {
        let file = File::open(path).with_context(|| format!("Failed to open '{}'", path.display()))?;
        NpzReader::new(file).with_context(|| format!("Failed to read npz file '{}'", path.display()))
    };

    let feats: std::result::Result<ArrayD<f32>, _> = open()?.by_name("feats");
    match feats {
        Ok(feats) => Ok(feats),
        Err(e) => {
            let feats: ArrayD<f64> = open()?
                .by_name("feats")
                .with_context(|| format!("Failed to read 'feats' from npz: {e}"))?;
            Ok(feats.mapv(|x| x as f32))
        }
    }
}

fn read_labels(path: Option<&Path>, n: usize) -> Result<Vec<String>> {
    let Some(path) = path else {
        return Ok((0..n).map(|i| i.to_string()).collect());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read labels '{}'", path.display()))?;
    let labels: Vec<String> =
        serde_json::from_str(&text).context("Labels must be a JSON list of strings")?;
    if labels.len() != n {
        bail!("{} labels for {} descriptors", labels.len(), n);
    }
    Ok(labels)
}

fn handle_embed(
    path: &Path,
    labels: Option<&Path>,
    config: &EmbeddingConfig,
    max_values: Option<usize>,
    out: &Path,
) -> Result<()> {
    config.validate().context("Invalid embedding configuration")?;

    let feats = read_feats(path)?;
    if feats.ndim() < 2 {
        bail!("'feats' must have shape (N, C, P) or (N, D), got {:?}", feats.shape());
    }
    let n = feats.len_of(Axis(0));
    let labels = read_labels(labels, n)?;
    println!("Embedding {} descriptor(s) of shape {:?}", n, &feats.shape()[1..]);

    let records = feats
        .axis_iter(Axis(0))
        .zip(labels)
        .map(|(row, label)| EmbeddingRecord::new(row.iter().copied().collect(), label));

    let mut reducer = PcaReducer::new(config.embed_dim, config.seed);
    if let Some(max) = max_values {
        reducer = reducer.with_max_elements(max);
    }

    let embedder = StreamingEmbedder::from_config(config)?;
    let embedding = embedder
        .run(records, reducer)
        .context("Embedding failed")?;

    println!(
        "Reduced {} record(s) in {} bucket(s) to {} dimension(s)",
        embedding.len(),
        embedding.buckets,
        embedding.coords.ncols()
    );

    let bundle = EmbeddingBundle::try_from(embedding)?;
    bundle
        .save(out)
        .with_context(|| format!("Failed to write '{}'", out.display()))?;
    println!("Saved embedding to {}", out.display());
    Ok(())
}

fn handle_layers(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read '{}'", path.display()))?;
    let layers: Vec<LayerInfo> =
        serde_json::from_str(&text).context("Layers must be a JSON list of {name, kind} entries")?;
    if layers.is_empty() {
        bail!("No layers listed in '{}'", path.display());
    }

    let model = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let registry = HookRegistry::from_layers(model, TensorLayout::TimeFirst, layers);
    print!("{}", registry.to_table());
    Ok(())
}
