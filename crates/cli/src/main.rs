use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use clap::{Parser, Subcommand};

use pretrain_common::{
    write_pretokenized, BatchLoader, DistributedSampler, HfTokenizer, MmapDataset, ModelConfig,
    Precision, PretrainDataset, SampleSource,
};
use pretrain_core::{parameter_count, TinyLm};
use pretrain_train::{
    checkpoint_path, load_checkpoint, DistEnv, GradSync, LocalSync, LrDecay, MetricsSink,
    Reporter, TcpSync, TrainConfig, Trainer,
};

#[derive(Parser, Debug)]
#[command(name = "pretrain", about = "Transformer language-model pre-training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pre-train a causal LM on a text corpus or a pre-tokenised .ptk file.
    Train(TrainArgs),
    /// Pre-tokenise a corpus into a padded .ptk mmap file.
    Tokenize(TokenizeArgs),
}

// ── Train ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "out")]
    out_dir: PathBuf,
    #[arg(long, default_value = "1")]
    epochs: usize,
    #[arg(long, default_value = "32")]
    batch_size: usize,
    #[arg(long, default_value = "5e-4")]
    learning_rate: f64,
    /// `cpu`, `cuda`, `cuda:N` or `metal`. Defaults to cuda:0 when available.
    #[arg(long)]
    device: Option<String>,
    #[arg(long, default_value = "bfloat16", value_parser = ["float32", "float16", "bfloat16"])]
    dtype: String,
    /// Append logged steps to `{out_dir}/{run_name}.csv`.
    #[arg(long)]
    metrics: bool,
    #[arg(long)]
    run_name: Option<String>,
    /// Batches prepared ahead by the loader thread (0 = load inline).
    #[arg(long, default_value = "1")]
    num_workers: usize,
    /// Require a launcher-provided process group (RANK, WORLD_SIZE, ...).
    #[arg(long)]
    ddp: bool,
    /// Effective batch = batch_size * accumulation_steps * world_size.
    #[arg(long, default_value = "8")]
    accumulation_steps: usize,
    #[arg(long, default_value = "1.0")]
    grad_clip: f64,
    #[arg(long, default_value = "0")]
    warmup_iters: usize,
    #[arg(long, default_value = "0.01")]
    weight_decay: f64,
    #[arg(long, default_value = "100")]
    log_interval: usize,
    #[arg(long, default_value = "100")]
    save_interval: usize,
    #[arg(long, default_value = "512")]
    dim: usize,
    #[arg(long, default_value = "8")]
    n_layers: usize,
    #[arg(long, default_value = "512")]
    max_seq_len: usize,
    #[arg(long)]
    use_moe: bool,
    /// JSON model config; overrides --dim, --n-layers, --max-seq-len, --use-moe.
    #[arg(long)]
    model_config: Option<PathBuf>,
    #[arg(long, default_value = "./dataset/pretrain_hq.jsonl")]
    data_path: PathBuf,
    #[arg(long, default_value = "./model/tokenizer")]
    tokenizer: PathBuf,
    #[arg(long, default_value = "1337")]
    seed: u64,
    /// `floor` (default): cosine from base down to base/10, never above base.
    /// `offset`: the reference formula base/10 + ½·base(1 + cos), which
    /// starts at 1.1×base. Pick `offset` to reproduce reference runs.
    #[arg(long, default_value = "floor", value_parser = ["floor", "offset"])]
    lr_schedule: String,
    /// Continue from the checkpoint in --out-dir if one exists.
    #[arg(long)]
    resume: bool,
}

// ── Tokenize ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TokenizeArgs {
    #[arg(long, default_value = "./dataset/pretrain_hq.jsonl")]
    data_path: PathBuf,
    #[arg(long, default_value = "./model/tokenizer")]
    tokenizer: PathBuf,
    #[arg(long, default_value = "512")]
    max_seq_len: usize,
    #[arg(long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Non-reporting ranks stay quiet unless RUST_LOG says otherwise.
    let is_main = DistEnv::from_env()
        .ok()
        .flatten()
        .map_or(true, |env| env.is_main());
    let default_level = if is_main { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Tokenize(args) => cmd_tokenize(args),
    }
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_train(args: TrainArgs) -> Result<()> {
    let dist = DistEnv::from_env()?;
    if args.ddp && dist.is_none() {
        anyhow::bail!("--ddp needs RANK, LOCAL_RANK and WORLD_SIZE from a launcher");
    }
    let is_main = dist.as_ref().map_or(true, DistEnv::is_main);

    let device = match &dist {
        Some(env) => parse_device(&env.device_spec())?,
        None => match &args.device {
            Some(spec) => parse_device(spec)?,
            None => Device::cuda_if_available(0)?,
        },
    };
    // Same seed on every rank; rank 0's weights are broadcast regardless.
    if let Err(e) = device.set_seed(args.seed) {
        tracing::debug!(error = %e, "device rng not seeded");
    }

    let precision: Precision = args.dtype.parse()?;
    let lr_decay: LrDecay = args.lr_schedule.parse()?;

    let model_config = match &args.model_config {
        Some(path) => ModelConfig::load(path)?,
        None => ModelConfig {
            dim: args.dim,
            n_layers: args.n_layers,
            max_seq_len: args.max_seq_len,
            use_moe: args.use_moe,
            ..Default::default()
        },
    };
    model_config.validate()?;

    let train_config = TrainConfig {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        lr_decay,
        warmup_iters: args.warmup_iters,
        weight_decay: args.weight_decay,
        accumulation_steps: args.accumulation_steps,
        grad_clip: args.grad_clip,
        log_interval: args.log_interval,
        save_interval: args.save_interval,
        precision,
        save_dir: args.out_dir.clone(),
    };
    train_config.validate()?;

    // Model
    let compute_dtype = precision.autocast_dtype(&device);
    let mut varmap = VarMap::new();
    let model = TinyLm::init(&model_config, &varmap, &device, compute_dtype)?;
    if is_main {
        tracing::info!(
            params_m = format!("{:.3}", parameter_count(&varmap) as f64 / 1e6),
            ?device,
            %precision,
            "LLM total parameters (millions)"
        );
    }
    if args.resume {
        let path = checkpoint_path(&args.out_dir, &model_config);
        if path.exists() {
            load_checkpoint(&mut varmap, &path)?;
            tracing::info!(path = %path.display(), "resumed weights");
        } else {
            tracing::warn!(path = %path.display(), "no checkpoint to resume from");
        }
    }

    // Data
    let source = open_source(&args, &model_config)?;
    let sampler = match &dist {
        Some(env) => DistributedSampler::new(env.world_size, env.rank, true, args.seed)?,
        None => DistributedSampler::sequential(),
    };
    let mut loader = BatchLoader::new(source, sampler, args.batch_size, args.num_workers)?;

    // Process group
    let sync = connect_sync(dist.as_ref(), &device)?;

    let mut reporter = Reporter::new(is_main);
    if args.metrics && is_main {
        let run_name = args.run_name.clone().unwrap_or_else(|| {
            format!(
                "Pretrain-Epoch-{}-BatchSize-{}-LearningRate-{}",
                args.epochs, args.batch_size, args.learning_rate
            )
        });
        reporter = reporter.with_sink(MetricsSink::create(&args.out_dir, &run_name)?);
    }

    let mut trainer = Trainer::new(model, varmap, train_config, device)?
        .with_sync(sync)?
        .with_reporter(reporter)
        .main_process(is_main);
    trainer.fit(&mut loader)?;

    if is_main {
        tracing::info!(
            path = %checkpoint_path(&args.out_dir, &model_config).display(),
            optimizer_steps = trainer.optimizer_steps(),
            "done"
        );
    }
    Ok(())
}

/// NCCL on CUDA when built with `nccl`, TCP otherwise.
fn connect_sync(dist: Option<&DistEnv>, device: &Device) -> Result<Box<dyn GradSync>> {
    let Some(env) = dist else {
        return Ok(Box::new(LocalSync));
    };
    #[cfg(feature = "nccl")]
    {
        if device.is_cuda() {
            return Ok(Box::new(pretrain_train::NcclSync::connect(env, device)?));
        }
    }
    if device.is_cuda() {
        tracing::warn!("gradients go over TCP; build with --features nccl for device all-reduce");
    }
    Ok(Box::new(TcpSync::connect(env)?))
}

/// `.ptk` files are memory-mapped; anything else is read as text and
/// encoded on the fly.
fn open_source(args: &TrainArgs, config: &ModelConfig) -> Result<Arc<dyn SampleSource>> {
    if args.data_path.extension().is_some_and(|e| e == "ptk") {
        let ds = MmapDataset::open(&args.data_path)?;
        if ds.max_seq_len() > config.max_seq_len {
            anyhow::bail!(
                "{} holds rows of {} tokens but max_seq_len is {}",
                args.data_path.display(),
                ds.max_seq_len(),
                config.max_seq_len
            );
        }
        tracing::info!(rows = ds.len(), path = %args.data_path.display(), "mmap dataset");
        return Ok(Arc::new(ds));
    }

    let tokenizer = load_tokenizer(&args.tokenizer, config)?;
    let ds = PretrainDataset::load(&args.data_path, Arc::new(tokenizer), config.max_seq_len)?;
    tracing::info!(rows = ds.len(), path = %args.data_path.display(), "text dataset");
    Ok(Arc::new(ds))
}

fn load_tokenizer(path: &Path, config: &ModelConfig) -> Result<HfTokenizer> {
    let tokenizer = HfTokenizer::from_path(path)?;
    if tokenizer.vocab_size() > config.vocab_size {
        anyhow::bail!(
            "tokenizer vocabulary ({}) exceeds model vocab_size ({})",
            tokenizer.vocab_size(),
            config.vocab_size
        );
    }
    Ok(tokenizer)
}

fn cmd_tokenize(args: TokenizeArgs) -> Result<()> {
    let tokenizer = HfTokenizer::from_path(&args.tokenizer)?;
    let dataset = PretrainDataset::load(&args.data_path, Arc::new(tokenizer), args.max_seq_len)?;
    let rows = write_pretokenized(&dataset, &args.output)?;
    tracing::info!(
        rows,
        seq_len = args.max_seq_len,
        output = %args.output.display(),
        "pre-tokenised; train with --data-path {}",
        args.output.display()
    );
    Ok(())
}

fn parse_device(spec: &str) -> Result<Device> {
    let device = match spec {
        "cpu" => Device::Cpu,
        "cuda" => Device::new_cuda(0)?,
        "metal" => Device::new_metal(0)?,
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .with_context(|| format!("unknown device {other:?}"))?
                .parse::<usize>()
                .with_context(|| format!("bad cuda ordinal in {other:?}"))?;
            Device::new_cuda(ordinal)?
        }
    };
    Ok(device)
}
