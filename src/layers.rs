//! Sublayers and ordered layer stacks for convolutional classifiers
//!
//! Layers are stored in the same order (and indexed the same way) as the
//! torchvision `nn.Sequential` blocks the checkpoints come from, so a tap
//! index means the same thing here as it does in a PyTorch state dict.

use candle_core::{Module, Tensor};
use candle_nn::{Conv2d, Linear};

/// A single feature-extraction or head sublayer.
#[derive(Debug, Clone)]
pub enum Layer {
    /// 2-D convolution (weights + optional bias)
    Conv2d(Conv2d),
    /// Rectified linear unit
    Relu,
    /// Max pooling over non-overlapping or strided windows
    MaxPool2d { kernel: usize, stride: usize },
    /// Average pooling to a fixed output grid, whatever the input size
    AdaptiveAvgPool2d { height: usize, width: usize },
    /// Collapse everything after the batch dimension
    Flatten,
    /// Fully-connected layer
    Linear(Linear),
    /// Identity at inference; kept so indices line up with checkpoints
    Dropout,
}

impl Layer {
    /// Whether this layer reduces spatial resolution by pooling.
    pub fn is_pool(&self) -> bool {
        matches!(
            self,
            Layer::MaxPool2d { .. } | Layer::AdaptiveAvgPool2d { .. }
        )
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => "conv2d",
            Layer::Relu => "relu",
            Layer::MaxPool2d { .. } => "maxpool2d",
            Layer::AdaptiveAvgPool2d { .. } => "adaptive_avgpool2d",
            Layer::Flatten => "flatten",
            Layer::Linear(_) => "linear",
            Layer::Dropout => "dropout",
        }
    }
}

impl Module for Layer {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Layer::Conv2d(conv) => conv.forward(xs),
            Layer::Relu => xs.relu(),
            Layer::MaxPool2d { kernel, stride } => xs.max_pool2d_with_stride(*kernel, *stride),
            Layer::AdaptiveAvgPool2d { height, width } => {
                adaptive_avg_pool2d(xs, *height, *width)
            }
            Layer::Flatten => xs.flatten_from(1),
            Layer::Linear(linear) => linear.forward(xs),
            Layer::Dropout => Ok(xs.clone()),
        }
    }
}

/// Ordered, indexable stack of layers.
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    layers: Vec<Layer>,
}

impl Sequential {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    /// Append a layer
    pub fn push(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Layer> {
        self.layers.get(index)
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Split into `layers[..index]` and `layers[index..]`.
    ///
    /// Layers are cloned; the underlying weight tensors are shared, not copied.
    pub fn split_at(&self, index: usize) -> (Sequential, Sequential) {
        let index = index.min(self.layers.len());
        let (front, rear) = self.layers.split_at(index);
        (Sequential::new(front.to_vec()), Sequential::new(rear.to_vec()))
    }

    /// Index of the last pooling layer, if any.
    pub fn last_pool_index(&self) -> Option<usize> {
        self.layers.iter().rposition(Layer::is_pool)
    }
}

impl Module for Sequential {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let mut hidden = xs.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }
        Ok(hidden)
    }
}

/// Adaptive average pooling over the last two dimensions of a 4-D tensor.
///
/// Output bin `i` averages input rows `[floor(i*H/oh), ceil((i+1)*H/oh))`,
/// the same binning PyTorch uses, so exact-multiple sizes reduce to a plain
/// average pool and equal sizes are an identity.
pub fn adaptive_avg_pool2d(
    xs: &Tensor,
    out_height: usize,
    out_width: usize,
) -> candle_core::Result<Tensor> {
    let (_b, _c, h, w) = xs.dims4()?;
    if out_height == 0 || out_width == 0 {
        candle_core::bail!("adaptive_avg_pool2d: output size must be non-zero");
    }
    if h == out_height && w == out_width {
        return Ok(xs.clone());
    }
    if h % out_height == 0 && w % out_width == 0 {
        return xs.avg_pool2d((h / out_height, w / out_width));
    }

    let mut rows = Vec::with_capacity(out_height);
    for i in 0..out_height {
        let (h0, h1) = bin_bounds(i, h, out_height);
        let band = xs.narrow(2, h0, h1 - h0)?;
        let mut cells = Vec::with_capacity(out_width);
        for j in 0..out_width {
            let (w0, w1) = bin_bounds(j, w, out_width);
            let cell = band
                .narrow(3, w0, w1 - w0)?
                .mean_keepdim(3)?
                .mean_keepdim(2)?;
            cells.push(cell);
        }
        rows.push(Tensor::cat(&cells, 3)?);
    }
    Tensor::cat(&rows, 2)
}

fn bin_bounds(index: usize, input: usize, output: usize) -> (usize, usize) {
    let start = (index * input) / output;
    let end = ((index + 1) * input).div_ceil(output);
    (start, end)
}
