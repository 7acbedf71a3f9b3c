//! Decode-loop smoke test against a randomly initialized model.
//!
//! Builds a small model with fresh random weights on the chosen device, runs
//! a timed generation, and validates the output grid. No weight files are
//! needed, so this doubles as a device bring-up check.
//!
//! Usage:
//!     cargo run --features cli --bin lm-smoke -- --steps 64 --seed 42
//!     cargo run --features cli --bin lm-smoke -- --depth --delays 0,1,1,1 --device cuda

use anyhow::Result;
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use std::time::Instant;

use multistream_lm::{
    compute_dtype_for_device, device_info, parse_device, sync_device, DepthDecoderConfig,
    GenerateParams, LmConfig, LmModel, Modality, SamplingPolicy, Token, TransformerConfig,
};

/// Smoke-test the decode loop with random weights
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Logical steps to generate per stream
    #[arg(short, long, default_value_t = 64)]
    steps: usize,

    /// Number of parallel samples
    #[arg(short, long, default_value_t = 1)]
    batch: usize,

    /// Random seed for reproducible sampling
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.8)]
    temperature: f64,

    /// Top-k sampling parameter
    #[arg(long, default_value_t = 100)]
    top_k: usize,

    /// Top-p (nucleus) sampling parameter (overrides top-k when set)
    #[arg(long)]
    top_p: Option<f64>,

    /// Use greedy decoding instead of sampling
    #[arg(long)]
    greedy: bool,

    /// Number of audio codebooks
    #[arg(long, default_value_t = 8)]
    codebooks: usize,

    /// Audio vocabulary size per codebook
    #[arg(long, default_value_t = 512)]
    cardinality: usize,

    /// Model a text stream with this vocabulary size and generate both
    /// modalities
    #[arg(long)]
    text_cardinality: Option<usize>,

    /// Per-stream delays, comma separated (short lists repeat the last value)
    #[arg(long, value_delimiter = ',')]
    delays: Vec<usize>,

    /// Route audio through a depth decoder instead of per-codebook heads
    #[arg(long)]
    depth: bool,

    /// Backbone width
    #[arg(long, default_value_t = 256)]
    dim: usize,

    /// Backbone layers
    #[arg(long, default_value_t = 4)]
    layers: usize,

    /// Backbone attention heads
    #[arg(long, default_value_t = 4)]
    heads: usize,

    /// Validate every token fed back into the model (slow)
    #[arg(long)]
    check: bool,

    /// Device for inference (auto, cpu, cuda, cuda:N, metal)
    #[arg(long, default_value = "auto")]
    device: String,
}

fn build_config(args: &Args) -> LmConfig {
    let max_delay = args.delays.iter().copied().max().unwrap_or(0);
    LmConfig {
        num_audio_codebooks: args.codebooks,
        audio_cardinality: args.cardinality,
        text_cardinality: args.text_cardinality,
        delays: args.delays.clone(),
        depth_decoder: args.depth.then(|| DepthDecoderConfig {
            dim: args.dim / 2,
            num_heads: 2,
            intermediate_size: args.dim,
            num_layers: 2,
            ..Default::default()
        }),
        backbone: TransformerConfig {
            dim: args.dim,
            num_heads: args.heads,
            intermediate_size: args.dim * 4,
            num_layers: args.layers,
            max_seq_len: args.steps + max_delay + 8,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn main() -> Result<()> {
    // Use chrome tracing when `profiling` feature is active, otherwise plain fmt.
    let _profiling_guard = multistream_lm::profiling::init();
    if _profiling_guard.is_none() {
        tracing_subscriber::fmt::init();
    }

    let args = Args::parse();

    let device = parse_device(&args.device)?;
    let dtype = compute_dtype_for_device(&device);
    println!("=== Decode Smoke Test ===");
    println!("Device: {}", device_info(&device));
    println!("Dtype: {:?}", dtype);
    println!("Steps: {}", args.steps);
    println!("Batch: {}", args.batch);
    println!("Seed: {}", args.seed);

    let config = build_config(&args);
    config.validate()?;
    let modality = if config.has_text() {
        Modality::Both
    } else {
        Modality::Audio
    };
    println!(
        "Model: {} streams (audio {}x{}, text {:?}), {} layers of dim {}, {}",
        config.num_codebooks(),
        config.num_audio_codebooks,
        config.audio_cardinality,
        config.text_cardinality,
        config.backbone.num_layers,
        config.backbone.dim,
        if args.depth {
            "depth readout"
        } else {
            "direct readout"
        },
    );

    println!("\nInitializing random weights...");
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, dtype, &device);
    let model = LmModel::new(config, vb)?;

    let policy = if args.greedy {
        SamplingPolicy::Greedy
    } else {
        SamplingPolicy::from_flags(Some(args.top_k), args.top_p, args.temperature)
    };
    let params = GenerateParams {
        max_gen_len: args.steps,
        policy,
        modality,
        check: args.check,
        seed: Some(args.seed),
        ..Default::default()
    };

    println!("Generating...");
    sync_device(&device)?;
    let t_gen = Instant::now();

    let mut physical = (0usize, 0usize);
    let mut progress = |done: usize, total: usize| {
        physical = (done, total);
        if done % 32 == 0 || done == total {
            println!("  step {}/{}", done, total);
        }
    };
    let grid = model.generate(None, &[], Some(args.batch), &params, Some(&mut progress))?;

    sync_device(&device)?;
    let elapsed = t_gen.elapsed().as_secs_f64();
    let (steps_done, _) = physical;

    println!(
        "\nGenerated [{} x {} x {}] in {:.2}s ({:.1} steps/sec)",
        grid.batch(),
        grid.codebooks(),
        grid.steps(),
        elapsed,
        steps_done as f64 / elapsed.max(1e-9),
    );

    // Every cell must be decided and encodable.
    anyhow::ensure!(
        grid.batch() == args.batch && grid.steps() == args.steps,
        "output grid is [{} x {} x {}], expected [{} x _ x {}]",
        grid.batch(),
        grid.codebooks(),
        grid.steps(),
        args.batch,
        args.steps,
    );
    let mut values = 0usize;
    let mut markers = 0usize;
    for b in 0..grid.batch() {
        for k in 0..grid.codebooks() {
            for t in 0..grid.steps() {
                match grid.get(b, k, t) {
                    Token::Value(_) => values += 1,
                    Token::Ungenerated => {
                        anyhow::bail!("undecided token at ({b}, {k}, {t})")
                    }
                    _ => markers += 1,
                }
            }
        }
    }
    let _ = grid.to_tensor(&model.config().stream_cardinalities(), &device)?;
    println!("Validated: {} sampled values, {} marker tokens", values, markers);

    let first_audio = model.config().audio_offset();
    let preview: Vec<Token> = (0..grid.steps().min(8))
        .map(|t| grid.get(0, first_audio, t))
        .collect();
    println!("First audio stream starts: {:?}", preview);

    println!("\nSmoke test complete!");
    Ok(())
}
