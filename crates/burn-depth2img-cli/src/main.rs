//! depth2img CLI
//!
//! Inspection tools for the depth2img helpers:
//! - depth mask preparation
//! - scheduler timesteps for a given strength
//! - prompt tokenization

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use burn::prelude::*;
use burn::tensor::Distribution;
use burn_depth2img::backends::{DefaultBackend, default_device, enabled_backends};
use burn_depth2img::clip::{ClipTokenizer, ClipTokenizerConfig, PromptTokenizer};
use burn_depth2img::{
    Depth2ImgConfig, SchedulerKind, init_timestep, prepare_depth_mask, prepare_noise_scheduler,
    tensor_stats,
};
use clap::{Parser, Subcommand};
use image::{GrayImage, Luma};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "depth2img")]
#[command(about = "Depth-conditioned image-to-image helpers on Burn")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Turn a depth map into the latent-sized conditioning mask
    DepthMask {
        /// Depth map image (any format the image crate reads)
        #[arg(short, long)]
        input: PathBuf,

        /// Pixel-to-latent downscale
        #[arg(short, long)]
        divisor: Option<u32>,

        /// Write the mask as an 8-bit grayscale preview
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the timesteps left after applying a strength
    Timesteps {
        /// Scheduler algorithm (deis, ddim)
        #[arg(short = 'S', long)]
        scheduler: Option<SchedulerKind>,

        /// Number of inference steps
        #[arg(short, long)]
        steps: Option<usize>,

        /// Noise strength in [0, 1]
        #[arg(long)]
        strength: Option<f64>,

        /// JSON file with a Depth2ImgConfig, overridden by the flags above
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Step through the schedule with exact noise and report the error
        #[arg(long)]
        verify: bool,
    },

    /// Tokenize a prompt pair the way the text encoder receives it
    Tokenize {
        /// CLIP BPE merges file
        #[arg(short, long)]
        merges: PathBuf,

        /// Text prompt
        #[arg(short, long)]
        prompt: String,

        /// Negative prompt
        #[arg(short, long, default_value = "")]
        negative: String,

        /// Row length (defaults to the CLIP context length)
        #[arg(long)]
        max_length: Option<usize>,

        /// Pad with the end token (SD 1.x) instead of id 0 (SD 2.x)
        #[arg(long)]
        pad_with_eos: bool,
    },

    /// Show build info and defaults
    Info,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DepthMask {
            input,
            divisor,
            output,
        } => run_depth_mask(&input, divisor, output.as_deref()),

        Commands::Timesteps {
            scheduler,
            steps,
            strength,
            config,
            verify,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(scheduler) = scheduler {
                config.scheduler = scheduler;
            }
            if let Some(steps) = steps {
                config.steps = steps;
            }
            if let Some(strength) = strength {
                config.strength = strength;
            }
            run_timesteps(&config, verify)
        }

        Commands::Tokenize {
            merges,
            prompt,
            negative,
            max_length,
            pad_with_eos,
        } => run_tokenize(&merges, &prompt, &negative, max_length, pad_with_eos),

        Commands::Info => {
            println!("depth2img: depth-conditioned image-to-image on Burn\n");
            println!("Enabled backends: {}", enabled_backends().join(", "));
            println!(
                "Schedulers: {}",
                SchedulerKind::ALL
                    .iter()
                    .map(|kind| kind.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!("\nDefault configuration:");
            println!("{}", serde_json::to_string_pretty(&Depth2ImgConfig::default())?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Depth2ImgConfig> {
    let Some(path) = path else {
        return Ok(Depth2ImgConfig::default());
    };
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn run_depth_mask(input: &Path, divisor: Option<u32>, output: Option<&Path>) -> Result<()> {
    let divisor = divisor.unwrap_or(Depth2ImgConfig::default().depth_divisor);
    let device = default_device();

    let depth_map =
        image::open(input).with_context(|| format!("Failed to open {}", input.display()))?;
    tracing::info!(
        width = depth_map.width(),
        height = depth_map.height(),
        "loaded depth map"
    );

    let mask = prepare_depth_mask::<DefaultBackend>(&depth_map, divisor, &device)?;
    println!("Mask shape: {:?}", mask.dims());
    println!("Mask stats: {}", tensor_stats(&mask));

    if let Some(output) = output {
        let preview = mask_to_gray(mask)?;
        preview
            .save(output)
            .with_context(|| format!("Failed to save {}", output.display()))?;
        println!("Saved preview to {}", output.display());
    }
    Ok(())
}

/// Map a `[1, 1, h, w]` mask in [-1, 1] to 8-bit luma
fn mask_to_gray(mask: Tensor<DefaultBackend, 4>) -> Result<GrayImage> {
    let [_, _, h, w] = mask.dims();
    let values = ((mask + 1.0) / 2.0 * 255.0)
        .clamp(0.0, 255.0)
        .into_data()
        .to_vec::<f32>()
        .map_err(|e| anyhow::anyhow!("Failed to read mask data: {:?}", e))?;

    Ok(GrayImage::from_fn(w as u32, h as u32, |x, y| {
        Luma([values[y as usize * w + x as usize].round() as u8])
    }))
}

fn run_timesteps(config: &Depth2ImgConfig, verify: bool) -> Result<()> {
    let mut scheduler = config.scheduler.build::<DefaultBackend>()?;
    prepare_noise_scheduler(scheduler.as_mut(), config.steps, config.strength)?;

    let timesteps = scheduler.timesteps().to_vec();
    println!(
        "{} scheduler, {} steps at strength {}: skipped {}, {} remaining",
        config.scheduler,
        config.steps,
        config.strength,
        init_timestep(config.steps, config.strength),
        timesteps.len()
    );
    println!("{:?}", timesteps);

    if !verify {
        return Ok(());
    }
    if timesteps.is_empty() {
        bail!("No timesteps left to verify");
    }

    let device = default_device();
    let shape = [1, 4, 8, 8];
    let x0 = Tensor::<DefaultBackend, 4>::random(shape, Distribution::Normal(0.0, 1.0), &device);
    let eps = Tensor::<DefaultBackend, 4>::random(shape, Distribution::Normal(0.0, 1.0), &device);
    let mut sample = scheduler.add_noise(x0.clone(), eps.clone(), timesteps[0])?;

    let pb = ProgressBar::new(timesteps.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    for &t in &timesteps {
        pb.set_message(format!("t={}", t));
        sample = scheduler.step(eps.clone(), t, sample)?;
        pb.inc(1);
    }
    pb.finish_with_message("done");

    let expected = scheduler.add_noise(x0, eps, 0)?;
    let max_err: f32 = (sample - expected).abs().max().into_scalar().elem();
    println!("Max deviation from the t=0 trajectory: {:.6}", max_err);
    Ok(())
}

fn run_tokenize(
    merges: &Path,
    prompt: &str,
    negative: &str,
    max_length: Option<usize>,
    pad_with_eos: bool,
) -> Result<()> {
    let config = if pad_with_eos {
        ClipTokenizerConfig::sd1x()
    } else {
        ClipTokenizerConfig::sd2x()
    };
    let tokenizer = ClipTokenizer::from_file(merges, config)
        .with_context(|| format!("Failed to load merges from {}", merges.display()))?;
    tracing::info!(vocab_size = tokenizer.vocab_size(), "loaded tokenizer");

    let max_length = max_length.unwrap_or_else(|| tokenizer.model_max_length());
    let rows = tokenizer.encode_batch_padded(&[negative, prompt], max_length)?;

    for (label, row) in ["negative", "prompt"].iter().zip(&rows) {
        println!("{:>8}: {:?}", label, row);
        println!("{:>8}  {:?}", "", tokenizer.decode(row));
    }
    Ok(())
}
