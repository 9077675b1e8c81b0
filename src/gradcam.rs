//! Grad-CAM: gradient-weighted class activation maps
//!
//! Given the activation `A` (C × H × W) captured at a tap and the gradient
//! `dY_c/dA` of a class score, the heatmap is
//!
//! ```text
//! w_k   = mean_{i,j} dY_c/dA_k[i, j]          (global-average-pooled gradient)
//! L[i,j] = relu( mean_k  w_k * A_k[i, j] )
//! L     = L / max(L)                         (all-zero if max(L) is negligible)
//! ```
//!
//! The score is the raw logit of the class, not its softmax probability.
//!
//! ## Example
//!
//! ```ignore
//! use gradcam_rs::{GradCam, SmallCnn, SmallCnnConfig, TappedClassifier};
//!
//! let model = SmallCnn::from_safetensors(&["mnist.safetensors"], SmallCnnConfig::default(), &device)?;
//! let mut tapped = TappedClassifier::with_default_tap(model)?;
//! let explanation = GradCam::default().explain(&mut tapped, &image, None)?;
//! let overlay = gradcam_rs::upscale(&explanation.heatmap, 28, 28)?;
//! ```

use candle_core::{DType, IndexOp, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GradCamError, Result};
use crate::heatmap::{self, Heatmap};
use crate::tapped::{Phase, TappedClassifier};

/// Engine configuration
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct GradCamConfig {
    /// Positive maxima at or below `epsilon` times the largest raw magnitude
    /// are treated as "no positive evidence"
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

fn default_epsilon() -> f32 {
    1e-6
}

impl Default for GradCamConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
        }
    }
}

/// Result of one full explanation run.
#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    /// Class the heatmap explains
    pub class_index: usize,
    /// Softmax probability of that class
    pub probability: f32,
    /// Raw logits from the forward pass
    pub logits: Vec<f32>,
    /// Normalized heatmap at the tap's resolution
    pub heatmap: Heatmap,
}

/// Grad-CAM engine. Stateless apart from its config; all capture state
/// lives in the [`TappedClassifier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GradCam {
    config: GradCamConfig,
}

impl GradCam {
    pub fn new(config: GradCamConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GradCamConfig {
        &self.config
    }

    /// Forced class if given (validated), else the most probable class.
    ///
    /// Ties resolve to the lowest index.
    pub fn select_target_class(logits: &Tensor, forced_class: Option<usize>) -> Result<usize> {
        let probs = softmax_probabilities(logits)?;
        match forced_class {
            Some(index) if index < probs.len() => Ok(index),
            Some(index) => Err(GradCamError::InvalidClassIndex {
                index,
                num_classes: probs.len(),
            }),
            None => Ok(stable_argmax(&probs)),
        }
    }

    /// Backpropagate from `logits[class_index]` through the tapped classifier.
    ///
    /// Parameter gradients produced on the way are kept by the classifier
    /// until its next `forward`; nothing is zeroed here.
    pub fn backward_from(
        &self,
        tapped: &mut TappedClassifier,
        logits: &Tensor,
        class_index: usize,
    ) -> Result<()> {
        let num_classes = logits.elem_count();
        if class_index >= num_classes {
            return Err(GradCamError::InvalidClassIndex {
                index: class_index,
                num_classes,
            });
        }
        let score = logits.flatten_all()?.i(class_index)?;
        debug!("Backpropagating from logit {}", class_index);
        tapped.backward(&score)
    }

    /// Heatmap from the tapped classifier's current capture.
    ///
    /// Only valid once `backward_from` has run for the latest `forward`.
    pub fn heatmap(&self, tapped: &TappedClassifier) -> Result<Heatmap> {
        match tapped.phase() {
            Phase::Backpropagated => {
                let (activation, gradient) = tapped.captured()?;
                self.compute_heatmap(activation, gradient)
            }
            actual => Err(GradCamError::State {
                operation: "compute_heatmap",
                expected: "Backpropagated",
                actual,
            }),
        }
    }

    /// Reduce an (activation, gradient) pair into a normalized heatmap.
    ///
    /// Both tensors are `(C, H, W)` or `(1, C, H, W)` with identical shapes.
    /// Inputs are never modified; weighting happens on a fresh tensor.
    pub fn compute_heatmap(&self, activation: &Tensor, gradient: &Tensor) -> Result<Heatmap> {
        let activation = single_sample(activation, "activation")?.to_dtype(DType::F32)?;
        let gradient = single_sample(gradient, "gradient")?.to_dtype(DType::F32)?;
        if activation.dims() != gradient.dims() {
            return Err(GradCamError::shape(format!(
                "activation {:?} and gradient {:?} differ",
                activation.dims(),
                gradient.dims()
            )));
        }

        // (C, 1, 1) channel weights
        let weights = gradient.mean_keepdim(2)?.mean_keepdim(1)?;
        let weighted = activation.broadcast_mul(&weights)?;
        let cam = weighted.mean(0)?;

        let raw = Heatmap::from_tensor(&cam)?;
        if let Some(bad) = raw.data().iter().find(|v| !v.is_finite()) {
            return Err(GradCamError::NonFinite(format!(
                "weighted activation map contains {bad}"
            )));
        }
        let heatmap = raw.rectify_and_normalize(self.config.epsilon);
        if heatmap.is_degenerate() {
            debug!("No positive evidence at this layer, heatmap is all zero");
        }
        Ok(heatmap)
    }

    /// Resample a heatmap for overlay (see [`heatmap::upscale`]).
    pub fn upscale(
        &self,
        heatmap: &Heatmap,
        target_height: usize,
        target_width: usize,
    ) -> Result<Heatmap> {
        heatmap::upscale(heatmap, target_height, target_width)
    }

    /// Full pipeline: forward, pick class, backward, heatmap.
    pub fn explain(
        &self,
        tapped: &mut TappedClassifier,
        input: &Tensor,
        forced_class: Option<usize>,
    ) -> Result<Explanation> {
        let logits = tapped.forward(input)?;
        let probs = softmax_probabilities(&logits)?;
        let class_index = Self::select_target_class(&logits, forced_class)?;
        debug!(
            "Target class {} (p = {:.4}, forced = {})",
            class_index,
            probs[class_index],
            forced_class.is_some()
        );

        self.backward_from(tapped, &logits, class_index)?;
        let heatmap = self.heatmap(tapped)?;
        debug!(
            "Heatmap {}x{}, peak at {:?}",
            heatmap.height(),
            heatmap.width(),
            heatmap.peak()
        );

        Ok(Explanation {
            class_index,
            probability: probs[class_index],
            logits: logits.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?,
            heatmap,
        })
    }
}

/// Top-k classes by probability, ties in index order.
pub fn top_k_classes(logits: &Tensor, k: usize) -> Result<Vec<(usize, f32)>> {
    let probs = softmax_probabilities(logits)?;
    let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    Ok(ranked)
}

fn softmax_probabilities(logits: &Tensor) -> Result<Vec<f32>> {
    let flat = logits.flatten_all()?.to_dtype(DType::F32)?;
    if flat.elem_count() == 0 {
        return Err(GradCamError::shape("logits are empty"));
    }
    let probs = candle_nn::ops::softmax_last_dim(&flat.detach())?;
    Ok(probs.to_vec1()?)
}

fn stable_argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn single_sample(tensor: &Tensor, what: &str) -> Result<Tensor> {
    match tensor.dims() {
        [1, _, _, _] => Ok(tensor.squeeze(0)?),
        [_, _, _] => Ok(tensor.clone()),
        dims => Err(GradCamError::shape(format!(
            "{what} must be (C, H, W) or (1, C, H, W), got {dims:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
    }

    #[test]
    fn test_select_is_stable_argmax() {
        let l = logits(&[0.1, 0.9, 0.9, 0.05]);
        assert_eq!(GradCam::select_target_class(&l, None).unwrap(), 1);
    }

    #[test]
    fn test_select_forced_class() {
        let l = logits(&[5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(GradCam::select_target_class(&l, Some(2)).unwrap(), 2);
        assert!(matches!(
            GradCam::select_target_class(&l, Some(10)),
            Err(GradCamError::InvalidClassIndex {
                index: 10,
                num_classes: 10
            })
        ));
    }

    #[test]
    fn test_top_k() {
        let l = logits(&[0.0, 2.0, 1.0, 2.0]);
        let top = top_k_classes(&l, 3).unwrap();
        let order: Vec<usize> = top.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 3, 2]);
        assert!(top[0].1 > top[2].1);
    }

    #[test]
    fn test_compute_heatmap_known_values() {
        let device = Device::Cpu;
        let activation = Tensor::new(
            &[[[1f32, 1.], [1., 1.]], [[0.5, 1.], [1.5, 2.]]],
            &device,
        )
        .unwrap();
        let gradient = Tensor::new(
            &[[[1f32, 1.], [1., 1.]], [[0.0, 0.], [0., 0.4]]],
            &device,
        )
        .unwrap();

        let heatmap = GradCam::default()
            .compute_heatmap(&activation, &gradient)
            .unwrap();
        // weights (1.0, 0.1); channel mean (0.525, 0.55, 0.575, 0.6)
        let expected = [0.525 / 0.6, 0.55 / 0.6, 0.575 / 0.6, 1.0];
        for (value, expected) in heatmap.data().iter().zip(expected) {
            assert!((value - expected).abs() < 1e-6, "{value} vs {expected}");
        }
        assert_eq!(heatmap.max(), 1.0);
        assert_eq!(heatmap.peak(), (1, 1));
    }

    #[test]
    fn test_negative_evidence_is_degenerate() {
        let device = Device::Cpu;
        let activation = Tensor::ones((3, 2, 2), DType::F32, &device).unwrap();
        let gradient = (Tensor::ones((3, 2, 2), DType::F32, &device).unwrap() * -1.0).unwrap();
        let heatmap = GradCam::default()
            .compute_heatmap(&activation, &gradient)
            .unwrap();
        assert!(heatmap.is_degenerate());
        assert_eq!((heatmap.height(), heatmap.width()), (2, 2));
    }

    #[test]
    fn test_batched_inputs_and_shape_mismatch() {
        let device = Device::Cpu;
        let activation = Tensor::ones((1, 2, 3, 3), DType::F32, &device).unwrap();
        let gradient = Tensor::ones((1, 2, 3, 3), DType::F32, &device).unwrap();
        let heatmap = GradCam::default()
            .compute_heatmap(&activation, &gradient)
            .unwrap();
        assert!(heatmap.data().iter().all(|&v| v == 1.0));

        let other = Tensor::ones((2, 3, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            GradCam::default().compute_heatmap(&activation, &other),
            Err(GradCamError::Shape(_))
        ));
        let batch2 = Tensor::ones((2, 2, 3, 3), DType::F32, &device).unwrap();
        assert!(GradCam::default()
            .compute_heatmap(&batch2, &batch2)
            .is_err());
    }

    #[test]
    fn test_compute_leaves_activation_untouched() {
        let device = Device::Cpu;
        let activation = Tensor::new(&[[[2f32, -1.], [0.5, 3.]]], &device).unwrap();
        let before = activation.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let gradient = Tensor::new(&[[[0.5f32, 0.5], [0.5, 0.5]]], &device).unwrap();
        GradCam::default()
            .compute_heatmap(&activation, &gradient)
            .unwrap();
        let after = activation.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_non_finite_values_are_reported() {
        let device = Device::Cpu;
        let clean = Tensor::new(&[[[1f32, 1.], [2., 3.]]], &device).unwrap();
        let ones = Tensor::ones((1, 2, 2), DType::F32, &device).unwrap();
        let nan = Tensor::new(&[[[f32::NAN, 1.], [2., 3.]]], &device).unwrap();
        let inf = Tensor::new(&[[[f32::INFINITY, 1.], [2., 3.]]], &device).unwrap();
        let engine = GradCam::default();

        assert!(matches!(
            engine.compute_heatmap(&nan, &ones),
            Err(GradCamError::NonFinite(_))
        ));
        assert!(matches!(
            engine.compute_heatmap(&clean, &nan),
            Err(GradCamError::NonFinite(_))
        ));
        assert!(matches!(
            engine.compute_heatmap(&inf, &ones),
            Err(GradCamError::NonFinite(_))
        ));
    }

    #[test]
    fn test_tiny_gradients_still_normalize() {
        let device = Device::Cpu;
        let activation = Tensor::new(&[[[1f32, 2.], [3., 4.]]], &device).unwrap();
        let gradient = Tensor::new(&[[[2e-7f32, 2e-7], [2e-7, 2e-7]]], &device).unwrap();
        let heatmap = GradCam::default()
            .compute_heatmap(&activation, &gradient)
            .unwrap();
        assert!(!heatmap.is_degenerate());
        assert_eq!(heatmap.max(), 1.0);
        for (value, expected) in heatmap.data().iter().zip([0.25, 0.5, 0.75, 1.0]) {
            assert!((value - expected).abs() < 1e-5, "{value} vs {expected}");
        }
    }

    #[test]
    fn test_backward_from_rejects_out_of_range_class() {
        use crate::classifier::SequentialClassifier;
        use crate::layers::{Layer, Sequential};

        let model = SequentialClassifier::new(
            "toy",
            Sequential::new(vec![
                Layer::Relu,
                Layer::MaxPool2d {
                    kernel: 2,
                    stride: 2,
                },
            ]),
            Sequential::new(vec![Layer::Flatten]),
            (1, 4, 4),
            4,
        );
        let mut tapped = TappedClassifier::new(model, 1).unwrap();
        let input = Tensor::ones((1, 1, 4, 4), DType::F32, &Device::Cpu).unwrap();
        let logits = tapped.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[1, 4]);

        let err = GradCam::default()
            .backward_from(&mut tapped, &logits, 4)
            .unwrap_err();
        assert!(matches!(
            err,
            GradCamError::InvalidClassIndex {
                index: 4,
                num_classes: 4
            }
        ));
        assert_eq!(tapped.phase(), Phase::Forwarded);
    }
}
