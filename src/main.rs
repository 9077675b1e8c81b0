//! gradcam-rs CLI: explain a classifier prediction with Grad-CAM

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use clap::{Parser, ValueEnum};
use gradcam_rs::{
    top_k_classes, upscale, Classifier, GradCam, Heatmap, SmallCnn, SmallCnnConfig,
    TappedClassifier, Vgg, VggConfig,
};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde::Serialize;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Arch {
    /// Two-stage CNN, 1×28×28 input
    Small,
    Vgg11,
    Vgg16,
    Vgg19,
}

#[derive(Parser)]
#[command(name = "gradcam-rs")]
#[command(about = "Grad-CAM heatmaps for convolutional classifiers")]
#[command(version)]
struct Cli {
    /// Network architecture
    #[arg(short, long, value_enum, default_value = "small")]
    arch: Arch,

    /// JSON architecture config (missing fields use the --arch preset)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors weight file(s); random weights if none given
    #[arg(short, long)]
    weights: Vec<PathBuf>,

    /// Download weights from this `HuggingFace` model repo
    #[arg(long)]
    hf_repo: Option<String>,

    /// Weight file inside the `HuggingFace` repo
    #[arg(long, default_value = "model.safetensors")]
    hf_file: String,

    /// Safetensors file holding the pre-normalized input (tensor `input`)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Force the explained class instead of the predicted one
    #[arg(short, long)]
    class: Option<usize>,

    /// Feature-layer boundary to tap (default: before the last pool)
    #[arg(long)]
    tap: Option<usize>,

    /// Overlay size as HxW (default: the model's input size)
    #[arg(long, value_parser = parse_size)]
    target_size: Option<(usize, usize)>,

    /// Output JSON report
    #[arg(short, long, default_value = "outputs/gradcam.json")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    model: &'a str,
    tap_index: usize,
    class_index: usize,
    probability: f32,
    top_classes: Vec<(usize, f32)>,
    heatmap: &'a Heatmap,
    overlay: &'a Heatmap,
}

fn parse_size(s: &str) -> std::result::Result<(usize, usize), String> {
    let (h, w) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected HxW, got '{s}'"))?;
    let h = h.trim().parse().map_err(|e| format!("height: {e}"))?;
    let w = w.trim().parse().map_err(|e| format!("width: {e}"))?;
    Ok((h, w))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
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

    let device = if cli.cpu {
        info!("Forcing CPU mode");
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    info!("Device: {:?}", device);

    let model = build_model(&cli, &device)?;
    let (c, h, w) = model.input_dims();
    let tap_index = match cli.tap {
        Some(index) => index,
        None => model.default_tap()?.index(),
    };
    let mut tapped = TappedClassifier::shared(Arc::clone(&model), tap_index)?;

    let input = match &cli.input {
        Some(path) => load_input(path, &device)?,
        None => {
            warn!("No --input given, explaining an all-zero image");
            Tensor::zeros((1, c, h, w), DType::F32, &device)?
        }
    };

    println!("=== gradcam-rs ===");
    println!("Model: {} (tap at feature layer {})", model.name(), tap_index);
    println!("Input: {:?}", input.dims());

    let engine = GradCam::default();
    let explanation = engine.explain(&mut tapped, &input, cli.class)?;
    let logits = Tensor::new(explanation.logits.as_slice(), &Device::Cpu)?;
    let top_classes = top_k_classes(&logits, 5)?;

    let (target_h, target_w) = cli.target_size.unwrap_or((input.dim(2)?, input.dim(3)?));
    let overlay = upscale(&explanation.heatmap, target_h, target_w)?;

    println!("\n=== Prediction ===");
    for (rank, (class, prob)) in top_classes.iter().enumerate() {
        println!("  {}. class {:4} ({:.2}%)", rank + 1, class, prob * 100.0);
    }
    println!(
        "\nExplaining class {} (p = {:.4})",
        explanation.class_index, explanation.probability
    );

    let heatmap = &explanation.heatmap;
    if heatmap.is_degenerate() {
        println!("Heatmap is all zero: no positive evidence for this class at the tap");
    } else {
        println!(
            "Heatmap {}x{}, peak at {:?}",
            heatmap.height(),
            heatmap.width(),
            heatmap.peak()
        );
        if heatmap.width() <= 16 {
            for row in heatmap.rows() {
                let cells: Vec<String> = row.iter().map(|v| format!("{v:.2}")).collect();
                println!("  {}", cells.join(" "));
            }
        }
    }

    let report = Report {
        model: model.name(),
        tap_index,
        class_index: explanation.class_index,
        probability: explanation.probability,
        top_classes,
        heatmap,
        overlay: &overlay,
    };
    if let Some(parent) = cli.output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&cli.output, serde_json::to_string_pretty(&report)?)?;
    info!("Report saved to {}", cli.output.display());

    Ok(())
}

fn resolve_weights(cli: &Cli) -> Result<Vec<PathBuf>> {
    let mut weights = cli.weights.clone();
    if let Some(repo_id) = &cli.hf_repo {
        info!("Downloading {} from {}", cli.hf_file, repo_id);
        let api = Api::new()?;
        let repo = api.repo(Repo::new(repo_id.clone(), RepoType::Model));
        let path = repo
            .get(&cli.hf_file)
            .with_context(|| format!("Failed to download {}", cli.hf_file))?;
        weights.push(path);
    }
    Ok(weights)
}

fn build_model(cli: &Cli, device: &Device) -> Result<Arc<dyn Classifier>> {
    let weights = resolve_weights(cli)?;
    let varmap = VarMap::new();
    if weights.is_empty() {
        warn!("No weights given, using random initialisation");
    }

    let model: Arc<dyn Classifier> = match cli.arch {
        Arch::Small => {
            let config = match &cli.config {
                Some(path) => SmallCnnConfig::from_json_file(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => SmallCnnConfig::default(),
            };
            if weights.is_empty() {
                Arc::new(SmallCnn::init(config, &varmap, device)?)
            } else {
                Arc::new(SmallCnn::from_safetensors(&weights, config, device)?)
            }
        }
        Arch::Vgg11 | Arch::Vgg16 | Arch::Vgg19 => {
            let preset = match cli.arch {
                Arch::Vgg11 => VggConfig::vgg11(),
                Arch::Vgg19 => VggConfig::vgg19(),
                _ => VggConfig::vgg16(),
            };
            let config = match &cli.config {
                Some(path) => VggConfig::from_json_file_over(path, preset)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
                None => preset,
            };
            if weights.is_empty() {
                Arc::new(Vgg::init(config, &varmap, device)?)
            } else {
                Arc::new(Vgg::from_safetensors(&weights, config, device)?)
            }
        }
    };
    info!(
        "Model: {} ({} feature layers, {} classes)",
        model.name(),
        model.features().len(),
        model.num_classes()
    );
    Ok(model)
}

fn load_input(path: &Path, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    let tensor = match tensors.remove("input") {
        Some(t) => t,
        None if tensors.len() == 1 => tensors.into_values().next().context("empty file")?,
        None => anyhow::bail!(
            "{} has {} tensors and none is named 'input'",
            path.display(),
            tensors.len()
        ),
    };
    let tensor = if tensor.rank() == 3 {
        tensor.unsqueeze(0)?
    } else {
        tensor
    };
    Ok(tensor.to_dtype(DType::F32)?)
}
