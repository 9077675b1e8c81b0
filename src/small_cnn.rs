//! Small two-stage convolutional classifier (28×28 grayscale digits)
//!
//! Layout, with the indices used for weight names and tap points:
//!
//! ```text
//! features.0  conv  1 -> 6, 5x5      28 -> 24
//! features.1  relu
//! features.2  maxpool 3              24 -> 8
//! features.3  conv  6 -> 16, 5x5      8 -> 4
//! features.4  relu                   <- default tap (16 x 4 x 4)
//! features.5  maxpool 2               4 -> 2
//! flatten                            16 * 2 * 2 = 64
//! classifier.0  linear 64 -> 120
//! classifier.1  relu
//! classifier.2  linear 120 -> 10
//! ```

use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::{conv2d, linear, Conv2dConfig, VarBuilder, VarMap};
use serde::Deserialize;
use tracing::info;

use crate::classifier::Classifier;
use crate::error::{GradCamError, Result};
use crate::layers::{Layer, Sequential};

/// Network configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SmallCnnConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_conv1_channels")]
    pub conv1_channels: usize,
    #[serde(default = "default_conv2_channels")]
    pub conv2_channels: usize,
    #[serde(default = "default_kernel_size")]
    pub kernel_size: usize,
    /// Window of the pool closing the first stage
    #[serde(default = "default_first_pool")]
    pub first_pool: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

fn default_in_channels() -> usize {
    1
}

fn default_image_size() -> usize {
    28
}

fn default_conv1_channels() -> usize {
    6
}

fn default_conv2_channels() -> usize {
    16
}

fn default_kernel_size() -> usize {
    5
}

fn default_first_pool() -> usize {
    3
}

fn default_hidden_size() -> usize {
    120
}

fn default_num_classes() -> usize {
    10
}

impl Default for SmallCnnConfig {
    fn default() -> Self {
        Self {
            in_channels: default_in_channels(),
            image_size: default_image_size(),
            conv1_channels: default_conv1_channels(),
            conv2_channels: default_conv2_channels(),
            kernel_size: default_kernel_size(),
            first_pool: default_first_pool(),
            hidden_size: default_hidden_size(),
            num_classes: default_num_classes(),
        }
    }
}

impl SmallCnnConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Spatial side of the tapped activation (before the final 2x2 pool).
    pub fn tap_size(&self) -> Result<usize> {
        let conv1 = self
            .image_size
            .checked_sub(self.kernel_size.saturating_sub(1))
            .filter(|&s| s > 0)
            .ok_or_else(|| GradCamError::shape("image smaller than first kernel"))?;
        let pooled = conv1 / self.first_pool.max(1);
        let conv2 = pooled
            .checked_sub(self.kernel_size.saturating_sub(1))
            .filter(|&s| s >= 2)
            .ok_or_else(|| GradCamError::shape("feature map too small for second stage"))?;
        Ok(conv2)
    }

    fn flat_features(&self) -> Result<usize> {
        let pooled = self.tap_size()? / 2;
        Ok(self.conv2_channels * pooled * pooled)
    }
}

/// Small CNN classifier with fixed weights.
#[derive(Debug, Clone)]
pub struct SmallCnn {
    config: SmallCnnConfig,
    features: Sequential,
    head: Sequential,
}

impl SmallCnn {
    /// Build from any weight source using torchvision-style names.
    pub fn load(vb: VarBuilder, config: SmallCnnConfig) -> Result<Self> {
        let vb_f = vb.pp("features");
        let vb_c = vb.pp("classifier");
        let conv_cfg = Conv2dConfig::default();

        let features = Sequential::new(vec![
            Layer::Conv2d(conv2d(
                config.in_channels,
                config.conv1_channels,
                config.kernel_size,
                conv_cfg,
                vb_f.pp(0),
            )?),
            Layer::Relu,
            Layer::MaxPool2d {
                kernel: config.first_pool,
                stride: config.first_pool,
            },
            Layer::Conv2d(conv2d(
                config.conv1_channels,
                config.conv2_channels,
                config.kernel_size,
                conv_cfg,
                vb_f.pp(3),
            )?),
            Layer::Relu,
            Layer::MaxPool2d {
                kernel: 2,
                stride: 2,
            },
        ]);

        let head = Sequential::new(vec![
            Layer::Flatten,
            Layer::Linear(linear(
                config.flat_features()?,
                config.hidden_size,
                vb_c.pp(0),
            )?),
            Layer::Relu,
            Layer::Linear(linear(config.hidden_size, config.num_classes, vb_c.pp(2))?),
        ]);

        Ok(Self {
            config,
            features,
            head,
        })
    }

    /// Load trained weights from safetensors checkpoint(s).
    pub fn from_safetensors<P: AsRef<Path>>(
        paths: &[P],
        config: SmallCnnConfig,
        device: &Device,
    ) -> Result<Self> {
        info!("Loading SmallCnn weights from {} file(s)", paths.len());
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, DType::F32, device)? };
        Self::load(vb, config)
    }

    /// Randomly initialise weights into `varmap` (kept trainable as `Var`s).
    pub fn init(config: SmallCnnConfig, varmap: &VarMap, device: &Device) -> Result<Self> {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
        Self::load(vb, config)
    }

    pub fn config(&self) -> &SmallCnnConfig {
        &self.config
    }
}

impl Classifier for SmallCnn {
    fn name(&self) -> &str {
        "small-cnn"
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
}
