//! List tensor names and shapes in a classifier checkpoint
//!
//! Useful for checking that a converted PyTorch state dict uses the
//! `features.{i}` / `classifier.{i}` names the loaders expect.
//!
//! Run with: cargo run --example list_tensors -- path/to/model.safetensors

use anyhow::{Context, Result};
use safetensors::tensor::SafeTensors;

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .context("usage: list_tensors <model.safetensors>")?;

    let data = std::fs::read(&path).with_context(|| format!("Failed to read {path}"))?;
    let tensors = SafeTensors::deserialize(&data)?;

    let mut names: Vec<&String> = tensors.names();
    names.sort_by_key(|name| sort_key(name));

    println!("=== Tensors in {path} ===\n");
    let mut stray = 0;
    for name in &names {
        let info = tensors.tensor(name)?;
        let marker = if name.starts_with("features.") || name.starts_with("classifier.") {
            ""
        } else {
            stray += 1;
            "  (not used by the loaders)"
        };
        println!("{}: {:?} {:?}{}", name, info.dtype(), info.shape(), marker);
    }

    println!("\n{} tensors, {} with unexpected names", names.len(), stray);

    Ok(())
}

/// Order `features.10` after `features.9`.
fn sort_key(name: &str) -> (String, usize, String) {
    let mut parts = name.splitn(3, '.');
    let stage = parts.next().unwrap_or_default().to_string();
    let index = parts.next().and_then(|i| i.parse().ok()).unwrap_or(usize::MAX);
    let rest = parts.next().unwrap_or_default().to_string();
    (stage, index, rest)
}
