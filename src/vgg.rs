//! VGG-style classifier (torchvision layout)
//!
//! Feature stack is a sequence of blocks, each `(conv3x3 + relu) * n`
//! closed by a 2x2 max pool. With a 224×224 input, VGG16's last block runs
//! at 14×14 and the default tap (index 30, before the final pool) is
//! 512 × 14 × 14. The head adaptively pools to 7×7 and runs three linear
//! layers named `classifier.{0,3,6}`.

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{conv2d, linear, Conv2dConfig, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::Classifier;
use crate::error::{GradCamError, Result};
use crate::layers::{Layer, Sequential};

/// Model configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VggConfig {
    /// Output channels of each conv, grouped per pooling block
    #[serde(default = "default_blocks")]
    pub blocks: Vec<Vec<usize>>,
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    /// Side of the adaptive pool in front of the classifier
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

fn default_blocks() -> Vec<Vec<usize>> {
    vec![
        vec![64, 64],
        vec![128, 128],
        vec![256, 256, 256],
        vec![512, 512, 512],
        vec![512, 512, 512],
    ]
}

fn default_in_channels() -> usize {
    3
}

fn default_image_size() -> usize {
    224
}

fn default_pool_size() -> usize {
    7
}

fn default_hidden_size() -> usize {
    4096
}

fn default_num_classes() -> usize {
    1000
}

impl Default for VggConfig {
    fn default() -> Self {
        Self::vgg16()
    }
}

impl VggConfig {
    pub fn vgg16() -> Self {
        Self {
            blocks: default_blocks(),
            in_channels: default_in_channels(),
            image_size: default_image_size(),
            pool_size: default_pool_size(),
            hidden_size: default_hidden_size(),
            num_classes: default_num_classes(),
        }
    }

    pub fn vgg11() -> Self {
        Self {
            blocks: vec![
                vec![64],
                vec![128],
                vec![256, 256],
                vec![512, 512],
                vec![512, 512],
            ],
            ..Self::vgg16()
        }
    }

    pub fn vgg19() -> Self {
        Self {
            blocks: vec![
                vec![64, 64],
                vec![128, 128],
                vec![256, 256, 256, 256],
                vec![512, 512, 512, 512],
                vec![512, 512, 512, 512],
            ],
            ..Self::vgg16()
        }
    }

    /// Load from a JSON file; missing fields take the VGG16 defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_file_over(path, Self::vgg16())
    }

    /// Load from a JSON file; missing fields are taken from `preset`.
    pub fn from_json_file_over(path: impl AsRef<Path>, preset: Self) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_over(&content, preset)
    }

    /// Apply the fields of a JSON object on top of `preset`.
    pub fn from_json_over(json: &str, preset: Self) -> Result<Self> {
        let mut merged = serde_json::to_value(preset)?;
        let overrides: serde_json::Value = serde_json::from_str(json)?;
        match (merged.as_object_mut(), overrides) {
            (Some(base), serde_json::Value::Object(fields)) => base.extend(fields),
            _ => {
                return Err(GradCamError::Config(serde::de::Error::custom(
                    "VGG config must be a JSON object",
                )))
            }
        }
        Ok(serde_json::from_value(merged)?)
    }

    /// Channels of the last conv, i.e. of the tapped activation.
    pub fn tap_channels(&self) -> usize {
        self.blocks
            .iter()
            .flatten()
            .last()
            .copied()
            .unwrap_or(self.in_channels)
    }

    /// Smallest input side that survives every pooling block.
    pub fn min_input_size(&self) -> usize {
        1 << self.blocks.len()
    }
}

/// VGG classifier with fixed weights.
#[derive(Debug, Clone)]
pub struct Vgg {
    config: VggConfig,
    features: Sequential,
    head: Sequential,
}

impl Vgg {
    /// Build from any weight source using torchvision names.
    pub fn load(vb: VarBuilder, config: VggConfig) -> Result<Self> {
        if config.blocks.is_empty() || config.blocks.iter().any(Vec::is_empty) {
            return Err(GradCamError::shape("VGG config needs non-empty conv blocks"));
        }
        let vb_f = vb.pp("features");
        let vb_c = vb.pp("classifier");
        let conv_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let mut features = Sequential::default();
        let mut in_channels = config.in_channels;
        for block in &config.blocks {
            for &out_channels in block {
                let vb_conv = vb_f.pp(features.len());
                let conv = conv2d(in_channels, out_channels, 3, conv_cfg, vb_conv)?;
                features.push(Layer::Conv2d(conv));
                features.push(Layer::Relu);
                in_channels = out_channels;
            }
            features.push(Layer::MaxPool2d {
                kernel: 2,
                stride: 2,
            });
        }

        let flat = in_channels * config.pool_size * config.pool_size;
        let head = Sequential::new(vec![
            Layer::AdaptiveAvgPool2d {
                height: config.pool_size,
                width: config.pool_size,
            },
            Layer::Flatten,
            Layer::Linear(linear(flat, config.hidden_size, vb_c.pp(0))?),
            Layer::Relu,
            Layer::Dropout,
            Layer::Linear(linear(config.hidden_size, config.hidden_size, vb_c.pp(3))?),
            Layer::Relu,
            Layer::Dropout,
            Layer::Linear(linear(config.hidden_size, config.num_classes, vb_c.pp(6))?),
        ]);

        info!(
            "VGG: {} feature layers, {} classes",
            features.len(),
            config.num_classes
        );

        Ok(Self {
            config,
            features,
            head,
        })
    }

    /// Load trained weights from safetensors checkpoint(s).
    pub fn from_safetensors<P: AsRef<Path>>(
        paths: &[P],
        config: VggConfig,
        device: &Device,
    ) -> Result<Self> {
        info!("Loading VGG weights from {} file(s)", paths.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, DType::F32, device)? };
        Self::load(vb, config)
    }

    /// Randomly initialise weights into `varmap`.
    pub fn init(config: VggConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::load(vb, config)
    }

    pub fn config(&self) -> &VggConfig {
        &self.config
    }
}

impl Classifier for Vgg {
    fn name(&self) -> &str {
        "vgg"
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn input_dims(&self) -> (usize, usize, usize) {
        (
            self.config.in_channels,
            self.config.image_size,
            self.config.image_size,
        )
    }

    fn features(&self) -> &Sequential {
        &self.features
    }

    fn head(&self) -> &Sequential {
        &self.head
    }

    /// The adaptive pool accepts any spatial size that survives the blocks.
    fn check_input(&self, dims: &[usize]) -> Result<()> {
        let min = self.config.min_input_size();
        match dims {
            [1, c, h, w] if *c == self.config.in_channels && *h >= min && *w >= min => Ok(()),
            _ => Err(GradCamError::shape(format!(
                "vgg expects input [1, {}, >={min}, >={min}], got {dims:?}",
                self.config.in_channels
            ))),
        }
    }
}
