//! Example: Grad-CAM on the small CNN
//!
//! Builds a randomly initialised small CNN (or loads weights if a path is
//! given), explains a synthetic "plus" digit, and prints the heatmap next to
//! its 28×28 overlay.
//!
//! Run with: cargo run --example explain_small [-- weights.safetensors]

use anyhow::Result;
use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use gradcam_rs::{GradCam, SmallCnn, SmallCnnConfig, TappedClassifier};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let device = Device::Cpu;
    let config = SmallCnnConfig::default();
    let varmap = VarMap::new();
    let model = match std::env::args().nth(1) {
        Some(path) => SmallCnn::from_safetensors(&[path], config, &device)?,
        None => SmallCnn::init(config, &varmap, &device)?,
    };
    let mut tapped = TappedClassifier::with_default_tap(model)?;

    // A bright plus sign centred in the image
    let mut pixels = vec![0f32; 28 * 28];
    for i in 6..22 {
        pixels[14 * 28 + i] = 1.0;
        pixels[i * 28 + 14] = 1.0;
    }
    let image = Tensor::from_vec(pixels, (1, 28, 28), &device)?;

    let engine = GradCam::default();
    let explanation = engine.explain(&mut tapped, &image, None)?;

    println!("\n=== Explanation ===");
    println!(
        "Class {} (p = {:.3})",
        explanation.class_index, explanation.probability
    );
    let heatmap = &explanation.heatmap;
    println!("\nHeatmap at tap ({}x{}):", heatmap.height(), heatmap.width());
    for row in heatmap.rows() {
        let cells: Vec<String> = row.iter().map(|v| format!("{v:.2}")).collect();
        println!("  {}", cells.join(" "));
    }

    let overlay = engine.upscale(heatmap, 28, 28)?;
    println!("\nOverlay (28x28, '#' >= 0.5):");
    for row in overlay.rows() {
        let line: String = row
            .iter()
            .map(|&v| if v >= 0.5 { '#' } else if v > 0.0 { '.' } else { ' ' })
            .collect();
        println!("  |{line}|");
    }

    Ok(())
}
