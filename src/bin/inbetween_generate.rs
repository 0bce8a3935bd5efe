//! # Motion In-betweening Generation Binary
//!
//! Generates every test window from its first and last frame and reports
//! L2Q/L2P against ground truth.
//!
//! ## Usage
//!
//! ```bash
//! # Generate with trained weights
//! cargo run --release --bin inbetween_generate -- -c config.json
//!
//! # Smoke run with random weights, exporting the third sequence of each batch
//! cargo run --release --bin inbetween_generate -- -c config.json --random --batch-index 2
//! ```

use std::path::PathBuf;

use clap::Parser;
use motion_inbetween::{
    checkpoint::load_weights,
    export::{FrameSink, JsonlFrameWriter},
    metrics::{evaluate, EvaluationSummary},
    ClipLibrary, InbetweenConfig, InbetweenModel, ModelSpec, Skeleton, Split, WindowDataset,
    WindowLoader,
};

/// Motion In-betweening Generator
#[derive(Parser, Debug)]
#[command(name = "inbetween_generate")]
#[command(about = "Generate in-between frames for the test split")]
struct Args {
    /// Path to JSON config (defaults are used when omitted)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the weight directory from the config
    #[arg(long, short = 'w')]
    weights: Option<PathBuf>,

    /// Use randomly initialised weights
    #[arg(long)]
    random: bool,

    /// Override the export directory from the config
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Batch element to export
    #[arg(long)]
    batch_index: Option<usize>,

    /// Skip frame export
    #[arg(long)]
    no_export: bool,

    /// GPU device ID
    #[arg(long)]
    gpu: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => InbetweenConfig::from_file(path)?,
        None => InbetweenConfig::default(),
    };
    if let Some(dir) = args.weights {
        config.model.weight_dir = dir;
    }
    if let Some(dir) = args.output {
        config.export.output_dir = dir;
    }
    if let Some(index) = args.batch_index {
        config.export.batch_index = index;
    }
    if args.gpu.is_some() {
        config.device.gpu_id = args.gpu;
    }
    config.validate()?;

    let device = config.device.device();
    log::info!("Device: {:?}", device);

    let skeleton = Skeleton::from_file(&config.data.skeleton_path)?;
    let library = ClipLibrary::from_directory(&config.data.clip_dir)?;

    // L2P is normalised with training statistics
    let train = WindowDataset::from_library(&library, &skeleton, &config.data, Split::Train)?;
    let test = WindowDataset::from_library(&library, &skeleton, &config.data, Split::Test)?;

    let spec = ModelSpec::from_config(
        &config.model,
        test.num_joints(),
        test.contact_dim(),
        test.condition_dim(),
        test.window_length(),
    );
    let mut model = if args.random {
        log::warn!("Using random weights");
        InbetweenModel::new_random(spec, &device)?.0
    } else {
        load_weights(spec, &config.model.weight_dir, &device)?.0
    };

    let loader = WindowLoader::new(&test, config.model.batch_size, false, device.clone());
    let num_batches = loader.num_batches();
    let mut summary = EvaluationSummary::default();

    for (i, batch) in loader.enumerate() {
        let batch = batch?;
        let export = !args.no_export && config.generation.compute_global_positions;
        let mut writer = if !export || config.export.batch_index >= batch.batch_size() {
            None
        } else {
            let sequence = batch.sequence_ids[config.export.batch_index];
            let path = config
                .export
                .output_dir
                .join(format!("sequence_{:05}.jsonl", sequence));
            Some(JsonlFrameWriter::create(path, config.export.batch_index)?)
        };

        let generated = model.generate(
            &batch,
            &config.generation,
            Some(&skeleton),
            writer.as_mut().map(|w| w as &mut dyn FrameSink),
        )?;
        let report = evaluate(&generated, &batch, train.stats())?;
        summary.add(&report);

        log::info!(
            "Batch {}/{}: {} sequences, L2Q {:.4}{}",
            i + 1,
            num_batches,
            report.sequences,
            report.l2q,
            report.l2p.map(|v| format!(", L2P {:.4}", v)).unwrap_or_default()
        );
    }

    log::info!("Test split: {}", summary);
    Ok(())
}
