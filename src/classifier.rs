//! Classifier capability and the feature/head splitter
//!
//! Any network that can be described as an ordered feature-extraction stack
//! followed by a head implements [`Classifier`]. The splitter cuts the feature
//! stack at a [`TapPoint`] once, so the tapped wrapper never needs to know
//! which architecture it is wrapping.

use candle_core::{Module, Tensor};

use crate::error::{GradCamError, Result};
use crate::layers::Sequential;

/// Unified capability trait for all wrapped classifiers.
///
/// Implementing this trait is the only requirement for explaining a new
/// architecture. Weights are read-only from this crate's point of view.
pub trait Classifier: Send + Sync {
    // --- Metadata ---
    fn name(&self) -> &str;
    fn num_classes(&self) -> usize;
    /// Expected single-image input as (channels, height, width)
    fn input_dims(&self) -> (usize, usize, usize);

    // --- Stages ---
    fn features(&self) -> &Sequential;
    fn head(&self) -> &Sequential;

    /// Validate a batched `(1, C, H, W)` input shape.
    fn check_input(&self, dims: &[usize]) -> Result<()> {
        let (c, h, w) = self.input_dims();
        if dims != [1, c, h, w] {
            return Err(GradCamError::shape(format!(
                "{} expects input [1, {c}, {h}, {w}], got {dims:?}",
                self.name()
            )));
        }
        Ok(())
    }

    /// Boundary just before the final pooling layer of the feature stage.
    fn default_tap(&self) -> Result<TapPoint> {
        TapPoint::before_last_pool(self.features())
    }

    /// Plain forward pass without any instrumentation.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let features = self.features().forward(xs)?;
        Ok(self.head().forward(&features)?)
    }
}

/// Boundary inside the feature stage whose output is captured.
///
/// `index` counts feature layers: the tap sees the output of
/// `features[..index]`, and `features[index..]` runs afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapPoint {
    index: usize,
}

impl TapPoint {
    /// Create a tap at a layer boundary, validated against a feature stack.
    pub fn new(index: usize, features: &Sequential) -> Result<Self> {
        if index == 0 || index >= features.len() {
            return Err(GradCamError::InvalidTap {
                index,
                len: features.len(),
            });
        }
        Ok(Self { index })
    }

    /// Tap immediately before the last pooling layer.
    pub fn before_last_pool(features: &Sequential) -> Result<Self> {
        let index = features.last_pool_index().unwrap_or(0);
        Self::new(index, features)
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

/// Cut a classifier's feature stage into (up-to-tap, remaining) pieces.
pub fn split_features(model: &dyn Classifier, tap: TapPoint) -> Result<(Sequential, Sequential)> {
    let features = model.features();
    // Re-validate: the tap may have been built against another stack.
    TapPoint::new(tap.index(), features)?;
    Ok(features.split_at(tap.index()))
}

/// Classifier assembled from arbitrary feature and head stacks.
#[derive(Debug, Clone)]
pub struct SequentialClassifier {
    name: String,
    features: Sequential,
    head: Sequential,
    input_dims: (usize, usize, usize),
    num_classes: usize,
}

impl SequentialClassifier {
    pub fn new(
        name: impl Into<String>,
        features: Sequential,
        head: Sequential,
        input_dims: (usize, usize, usize),
        num_classes: usize,
    ) -> Self {
        Self {
            name: name.into(),
            features,
            head,
            input_dims,
            num_classes,
        }
    }
}

impl Classifier for SequentialClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_dims(&self) -> (usize, usize, usize) {
        self.input_dims
    }

    fn features(&self) -> &Sequential {
        &self.features
    }

    fn head(&self) -> &Sequential {
        &self.head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Layer;

    fn pool_stack() -> Sequential {
        Sequential::new(vec![
            Layer::Relu,
            Layer::MaxPool2d {
                kernel: 2,
                stride: 2,
            },
            Layer::Relu,
            Layer::MaxPool2d {
                kernel: 2,
                stride: 2,
            },
        ])
    }

    #[test]
    fn test_tap_before_last_pool() {
        let tap = TapPoint::before_last_pool(&pool_stack()).unwrap();
        assert_eq!(tap.index(), 3);
    }

    #[test]
    fn test_tap_bounds() {
        let features = pool_stack();
        assert!(TapPoint::new(0, &features).is_err());
        assert!(TapPoint::new(4, &features).is_err());
        assert!(TapPoint::new(1, &features).is_ok());
    }

    #[test]
    fn test_no_pool_has_no_default_tap() {
        let features = Sequential::new(vec![Layer::Relu, Layer::Relu]);
        assert!(matches!(
            TapPoint::before_last_pool(&features),
            Err(GradCamError::InvalidTap { index: 0, len: 2 })
        ));
    }

    #[test]
    fn test_split_features() {
        let model = SequentialClassifier::new(
            "toy",
            pool_stack(),
            Sequential::new(vec![Layer::Flatten]),
            (1, 8, 8),
            4,
        );
        let tap = model.default_tap().unwrap();
        let (front, rear) = split_features(&model, tap).unwrap();
        assert_eq!(front.len(), 3);
        assert_eq!(rear.len(), 1);
        assert!(rear.get(0).unwrap().is_pool());
    }

    #[test]
    fn test_check_input_rejects_wrong_shape() {
        let model = SequentialClassifier::new(
            "toy",
            pool_stack(),
            Sequential::new(vec![Layer::Flatten]),
            (1, 8, 8),
            4,
        );
        assert!(model.check_input(&[1, 1, 8, 8]).is_ok());
        assert!(matches!(
            model.check_input(&[1, 3, 8, 8]),
            Err(GradCamError::Shape(_))
        ));
        assert!(model.check_input(&[2, 1, 8, 8]).is_err());
    }
}
