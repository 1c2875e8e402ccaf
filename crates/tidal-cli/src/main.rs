use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tidal_core::{Device, Tensor, TidalError};
use tidal_runtime::{
    weights_from_f32, AsyncHandle, BalancedPartitioner, Layer, LayerStack, PipelineModel, Runtime,
    RuntimeConfig, SplitHints, SubmitOptions, Value,
};

const BANNER: &str = r#"
 _   _     _       _
| |_(_) __| | __ _| |
| __| |/ _` |/ _` | |
| |_| | (_| | (_| | |
 \__|_|\__,_|\__,_|_|"#;

#[derive(Parser)]
#[command(
    name = "tidal",
    about = "Layer-streaming runtime for models larger than device memory",
    long_about = "Streams one stage's weights at a time from pinned host memory to the\naccelerator, overlapping copies with compute, while many requests share\nthe device in shortest-remaining-work order.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print the effective runtime configuration
    Info {
        /// JSON config file; defaults are used for missing fields
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Stream a synthetic model through many concurrent requests
    Demo {
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Number of requests to submit
        #[arg(long, default_value = "32")]
        requests: usize,
        /// Layers in the synthetic model
        #[arg(long, default_value = "12")]
        layers: usize,
        /// Stages to partition the layers into
        #[arg(long, default_value = "4")]
        stages: usize,
        /// Parameter size of each layer, in KiB
        #[arg(long, default_value = "256")]
        layer_kib: usize,
        /// Rows per request
        #[arg(long, default_value = "8")]
        batch: usize,
        /// Microbatches per request
        #[arg(long, default_value = "2")]
        microbatches: usize,
        /// Fraction of requests that consume an earlier request's output
        #[arg(long, default_value = "0.25")]
        chain: f64,
        /// Compute device, e.g. cuda:0
        #[arg(long)]
        device: Option<Device>,
        /// Simulated copy bandwidth in MiB/s (unthrottled if omitted)
        #[arg(long)]
        bandwidth_mib: Option<u64>,
        #[arg(long, default_value = "7")]
        seed: u64,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { config } => cmd_info(config),
        Commands::Demo {
            config,
            requests,
            layers,
            stages,
            layer_kib,
            batch,
            microbatches,
            chain,
            device,
            bandwidth_mib,
            seed,
        } => {
            let mut config = load_config(config)?;
            if let Some(device) = device {
                config.compute_device = device;
            }
            if let Some(mib) = bandwidth_mib {
                config.simulated_bandwidth = Some(mib * 1024 * 1024);
            }
            let demo = DemoArgs { requests, layers, stages, layer_kib, batch, microbatches, chain, seed };
            cmd_demo(config, &demo)
        }
    }
}

fn init_tracing() {
    let ansi = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .init();
}

fn load_config(path: Option<PathBuf>) -> Result<RuntimeConfig> {
    match path {
        Some(path) => RuntimeConfig::from_json_file(&path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn cmd_info(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    config.validate()?;

    println!("{}", BANNER);
    println!("  v{}  -  layer-streaming runtime\n", env!("CARGO_PKG_VERSION"));
    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    println!("\nMemory");
    match config.pinned_budget() {
        Some(bytes) => println!("  Pinned budget: {:.1} MB", bytes as f64 / (1024.0 * 1024.0)),
        None => println!("  Pinned budget: unbounded"),
    }
    match config.slot_capacity() {
        Some(bytes) => println!(
            "  Device slots:  {} x {:.1} MB",
            config.device_buffers,
            bytes as f64 / (1024.0 * 1024.0)
        ),
        None => println!("  Device slots:  {} (unbounded)", config.device_buffers),
    }

    println!("\nEffective config");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

struct DemoArgs {
    requests: usize,
    layers: usize,
    stages: usize,
    layer_kib: usize,
    batch: usize,
    microbatches: usize,
    chain: f64,
    seed: u64,
}

/// `layers` layers of `y = tanh(x * scale + bias)`, each carrying `layer_kib`
/// KiB of parameters so the transfers have something to move.
fn synthetic_model(args: &DemoArgs) -> Result<Arc<PipelineModel>> {
    let floats = (args.layer_kib * 1024 / 4).max(2);
    let stack = (0..args.layers).fold(LayerStack::new(), |stack, i| {
        let mut params = vec![0.0f32; floats];
        params[0] = 1.0 - 0.01 * i as f32;
        params[1] = 0.001 * i as f32;
        stack.with_layer(Layer::from_fn(
            format!("layer{i}"),
            weights_from_f32([("affine", params)]),
            |ctx, params, inputs| {
                let affine = params
                    .f32("affine")
                    .filter(|p| p.len() >= 2)
                    .ok_or_else(|| TidalError::compute(ctx.stage, "missing affine parameters"))?;
                let (scale, bias) = (affine[0], affine[1]);
                Ok(inputs.iter().map(|t| t.map(|v| (v * scale + bias).tanh())).collect())
            },
        ))
    });
    let model = PipelineModel::partitioned(
        "synthetic",
        stack,
        &BalancedPartitioner::new(args.stages),
        &SplitHints::new(),
    )?;
    Ok(model)
}

fn cmd_demo(config: RuntimeConfig, args: &DemoArgs) -> Result<()> {
    let model = synthetic_model(args)?;
    println!(
        "Model '{}': {} stages, {:.1} MB of parameters",
        model.name(),
        model.num_stages(),
        model.total_footprint() as f64 / (1024.0 * 1024.0)
    );

    let mut runtime = Runtime::new(config)?;
    let mut rng = StdRng::seed_from_u64(args.seed);
    let width = 16;

    let start = Instant::now();
    let mut handles: Vec<AsyncHandle> = Vec::with_capacity(args.requests);
    let mut chained = 0usize;
    for _ in 0..args.requests {
        let input: Value = if !handles.is_empty() && rng.gen_bool(args.chain.clamp(0.0, 1.0)) {
            chained += 1;
            handles[rng.gen_range(0..handles.len())].clone().into()
        } else {
            let data: Vec<f32> = (0..args.batch * width).map(|_| rng.gen_range(-1.0..1.0)).collect();
            Tensor::from_vec(data, &[args.batch, width]).into()
        };
        let options = SubmitOptions::default().microbatches(args.microbatches);
        handles.push(runtime.submit_async(&model, input, options)?);
    }

    let mut failed = 0usize;
    for handle in &handles {
        if let Err(e) = handle.get_result() {
            tracing::warn!("{} failed: {e}", handle.id());
            failed += 1;
        }
    }
    let elapsed = start.elapsed();

    let stats = runtime.stats();
    println!();
    println!("Requests:   {} ({} chained, {} failed)", args.requests, chained, failed);
    println!("Elapsed:    {:.1} ms", elapsed.as_secs_f64() * 1e3);
    println!(
        "Throughput: {:.1} req/s",
        args.requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("{stats}");
    println!("{}", stats.transfer);

    runtime.shutdown();
    Ok(())
}
