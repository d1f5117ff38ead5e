//! nesy-rs CLI: latent encoding, decoding and conditioned prediction

use std::path::PathBuf;

use anyhow::Result;
use candle_core::Tensor;
use clap::{Parser, Subcommand};
use nesy_rs::{NesyBackend, NesyConfig, PaddingSide, WrappedLlm};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_MODEL: &str = "meta-llama/Llama-2-7b-hf";

#[derive(Parser)]
#[command(name = "nesy-rs")]
#[command(about = "Neuro-symbolic latent conditioning of a frozen language model")]
#[command(version)]
struct Cli {
    /// JSON run configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model ID from `HuggingFace` or a local checkpoint directory
    #[arg(short, long)]
    model: Option<String>,

    /// Checkpoint directory with encoder_lora/, decoder_lora/ and params_info.json
    #[arg(long)]
    ckpt: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the sampled parameter layout
    Allocate {
        /// Write the layout as params_info JSON
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Encode a text and print latent statistics
    Encode {
        #[arg(long)]
        text: String,
    },
    /// Encode a text and decode the latent back to text
    Sample {
        #[arg(long)]
        text: String,
    },
    /// Generate a task response, optionally conditioned on another text's latent
    Predict {
        #[arg(long)]
        text: String,
        /// Text whose latent conditions the task model
        #[arg(long)]
        condition: Option<String>,
    },
    /// Write adapters and layout to a checkpoint directory
    Save {
        #[arg(long)]
        out: PathBuf,
    },
}

fn encode_text(wrapped: &WrappedLlm, text: &str) -> Result<Tensor> {
    let device = match wrapped.encoder() {
        Some(encoder) => encoder.model().device().clone(),
        None => wrapped.task_model().device().clone(),
    };
    let ids = wrapped
        .tokenizer()
        .encode_batch(&[text], PaddingSide::Right, &device)?;
    wrapped.encode(&ids)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => NesyConfig::from_file(path)?,
        None => NesyConfig::new(DEFAULT_MODEL),
    };
    if let Some(model) = cli.model {
        config.model_name_or_path = model;
    }
    if cli.ckpt.is_some() {
        config.load_nesy_ckpt.clone_from(&cli.ckpt);
    }

    println!("=== nesy-rs ===");
    println!("Model:  {}", config.model_name_or_path);
    println!("Method: {:?} / {:?}", config.method, config.fuse_method);

    let wrapped = WrappedLlm::new(config)?;
    info!(
        "Task model: {} hidden, layout of {} scalars over {} tensors",
        wrapped.hidden_size(),
        wrapped.param_info().total(),
        wrapped.param_info().len()
    );

    match cli.command {
        Command::Allocate { out } => {
            for entry in wrapped.param_info().entries() {
                println!("{:60} {:>8}", entry.name(), entry.count());
            }
            println!("Total: {}", wrapped.param_info().total());
            if let Some(path) = out {
                wrapped.param_info().save(&path)?;
                info!("Layout saved to {}", path.display());
            }
        }
        Command::Encode { text } => {
            let latent = encode_text(&wrapped, &text)?;
            let values: Vec<f32> = latent
                .to_dtype(candle_core::DType::F32)?
                .flatten_all()?
                .to_vec1()?;
            let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
            println!("Latent: shape {:?}, L2 norm {norm:.4}", latent.dims());
        }
        Command::Sample { text } => {
            let latent = encode_text(&wrapped, &text)?;
            for line in wrapped.sample_text(&latent)? {
                println!("{line}");
            }
        }
        Command::Predict { text, condition } => {
            let latent = condition
                .as_deref()
                .map(|c| encode_text(&wrapped, c))
                .transpose()?;
            let ids = wrapped.tokenizer().encode_batch(
                &[text.as_str()],
                PaddingSide::Left,
                wrapped.task_model().device(),
            )?;
            for answer in wrapped.predict_task(&ids, latent.as_ref())? {
                println!("{answer}");
            }
        }
        Command::Save { out } => {
            wrapped.save(&out)?;
        }
    }

    Ok(())
}
