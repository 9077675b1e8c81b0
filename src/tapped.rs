//! Tapped classifier: forward pass with activation and gradient capture
//!
//! The wrapped network's feature stage is split once at construction into
//! `front` (up to the tap) and `rear` (the remaining pooling). On `forward`,
//! the front's output is routed through a zero-valued leaf variable (the
//! probe) before `rear` and the head run. The output is numerically
//! unchanged, but because the probe is a leaf, `Tensor::backward` keeps its
//! gradient in the returned `GradStore`, and that gradient equals the
//! gradient at the tapped activation. Retrieval is an explicit lookup keyed
//! by the probe, done once `backward` returns.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --forward--> Forwarded --backward--> Backpropagated
//!   ^                  ^  |                        |
//!   |                  +--+----------forward-------+
//!   +---------------------------reset--------------+
//! ```
//!
//! Illegal transitions are reported as [`GradCamError::State`].

use std::fmt;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{Module, Tensor, Var};
use tracing::debug;

use crate::classifier::{split_features, Classifier, TapPoint};
use crate::error::{GradCamError, Result};
use crate::layers::Sequential;

/// Observable capture phase of a [`TappedClassifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing captured
    Idle,
    /// Activation captured, gradient not yet available
    Forwarded,
    /// Activation and gradient both captured
    Backpropagated,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "Idle",
            Phase::Forwarded => "Forwarded",
            Phase::Backpropagated => "Backpropagated",
        };
        f.write_str(name)
    }
}

/// Capture slot owned by one tapped classifier.
#[derive(Default)]
enum CaptureState {
    #[default]
    Idle,
    Forwarded {
        activation: Tensor,
        probe: Var,
    },
    Backpropagated {
        activation: Tensor,
        gradient: Tensor,
        grads: GradStore,
    },
}

impl CaptureState {
    fn phase(&self) -> Phase {
        match self {
            CaptureState::Idle => Phase::Idle,
            CaptureState::Forwarded { .. } => Phase::Forwarded,
            CaptureState::Backpropagated { .. } => Phase::Backpropagated,
        }
    }
}

/// Classifier wrapper that records one intermediate activation and its gradient.
///
/// Weights are shared (`Arc`) and never mutated; the capture slot is per
/// instance. Give each concurrent request its own `TappedClassifier` built
/// with [`TappedClassifier::shared`].
pub struct TappedClassifier {
    model: Arc<dyn Classifier>,
    tap: TapPoint,
    front: Sequential,
    rear: Sequential,
    state: CaptureState,
}

impl TappedClassifier {
    /// Wrap a classifier, tapping the output of `features[..tap_index]`.
    pub fn new<C: Classifier + 'static>(model: C, tap_index: usize) -> Result<Self> {
        Self::shared(Arc::new(model), tap_index)
    }

    /// Wrap a classifier at its default tap (before the final feature pool).
    pub fn with_default_tap<C: Classifier + 'static>(model: C) -> Result<Self> {
        let tap = model.default_tap()?;
        Self::shared(Arc::new(model), tap.index())
    }

    /// Wrap a classifier whose weights are shared with other instances.
    pub fn shared(model: Arc<dyn Classifier>, tap_index: usize) -> Result<Self> {
        let tap = TapPoint::new(tap_index, model.features())?;
        let (front, rear) = split_features(model.as_ref(), tap)?;
        debug!(
            "Tapping {} at feature boundary {} ({} + {} layers)",
            model.name(),
            tap.index(),
            front.len(),
            rear.len()
        );
        Ok(Self {
            model,
            tap,
            front,
            rear,
            state: CaptureState::Idle,
        })
    }

    pub fn classifier(&self) -> &dyn Classifier {
        self.model.as_ref()
    }

    pub fn tap(&self) -> TapPoint {
        self.tap
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Drop everything captured and return to `Idle`.
    pub fn reset(&mut self) {
        self.state = CaptureState::Idle;
    }

    /// Run the wrapped classifier and capture the tapped activation.
    ///
    /// Accepts `(C, H, W)` or `(1, C, H, W)`; returns logits `(1, num_classes)`.
    /// Any previous capture (including a gradient) is discarded.
    pub fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.state = CaptureState::Idle;
        let input = self.prepare_input(input)?;

        let activation = self.front.forward(&input)?;
        if activation.rank() != 4 {
            return Err(GradCamError::shape(format!(
                "tapped activation must be (1, C, H, W), got {:?}",
                activation.dims()
            )));
        }
        let probe = Var::zeros(activation.dims(), activation.dtype(), activation.device())?;
        let tapped = (&activation + probe.as_tensor())?;

        let features = self.rear.forward(&tapped)?;
        let logits = self.model.head().forward(&features)?;
        let expected = [1, self.model.num_classes()];
        if logits.dims() != expected {
            return Err(GradCamError::shape(format!(
                "{} head produced {:?}, expected {expected:?}",
                self.model.name(),
                logits.dims()
            )));
        }

        debug!("Captured activation {:?}", activation.dims());
        self.state = CaptureState::Forwarded {
            activation: activation.detach(),
            probe,
        };
        Ok(logits)
    }

    /// Recompute the tapped activation without touching the capture slot.
    pub fn get_activations(&self, input: &Tensor) -> Result<Tensor> {
        let input = self.prepare_input(input)?;
        Ok(self.front.forward(&input)?.detach())
    }

    /// Backpropagate from a scalar derived from the most recent `forward`.
    ///
    /// Legal only in `Forwarded`. A second call without a new `forward` is
    /// rejected rather than re-running the pass. If `score` does not depend on
    /// the current capture, the classifier stays `Forwarded`.
    pub fn backward(&mut self, score: &Tensor) -> Result<()> {
        if score.elem_count() != 1 {
            return Err(GradCamError::shape(format!(
                "backward needs a scalar score, got {:?}",
                score.dims()
            )));
        }

        match std::mem::take(&mut self.state) {
            CaptureState::Forwarded { activation, probe } => {
                let grads = match score.backward() {
                    Ok(grads) => grads,
                    Err(err) => {
                        self.state = CaptureState::Forwarded { activation, probe };
                        return Err(err.into());
                    }
                };
                match grads.get(probe.as_tensor()).map(Tensor::detach) {
                    Some(gradient) => {
                        debug!("Captured gradient {:?}", gradient.dims());
                        self.state = CaptureState::Backpropagated {
                            activation,
                            gradient,
                            grads,
                        };
                        Ok(())
                    }
                    None => {
                        self.state = CaptureState::Forwarded { activation, probe };
                        Err(GradCamError::State {
                            operation: "backward (score unrelated to last forward)",
                            expected: "Forwarded",
                            actual: Phase::Forwarded,
                        })
                    }
                }
            }
            other => {
                let actual = other.phase();
                self.state = other;
                Err(GradCamError::State {
                    operation: "backward",
                    expected: "Forwarded",
                    actual,
                })
            }
        }
    }

    /// Activation captured by the last `forward` (detached).
    pub fn activation(&self) -> Result<Tensor> {
        match &self.state {
            CaptureState::Forwarded { activation, .. }
            | CaptureState::Backpropagated { activation, .. } => Ok(activation.clone()),
            CaptureState::Idle => Err(GradCamError::State {
                operation: "activation",
                expected: "Forwarded or Backpropagated",
                actual: Phase::Idle,
            }),
        }
    }

    /// Gradient of the last backward's score at the tapped activation.
    pub fn get_activations_gradient(&self) -> Result<Tensor> {
        self.captured().map(|(_, gradient)| gradient.clone())
    }

    /// (activation, gradient) pair; only available in `Backpropagated`.
    pub fn captured(&self) -> Result<(&Tensor, &Tensor)> {
        match &self.state {
            CaptureState::Backpropagated {
                activation,
                gradient,
                ..
            } => Ok((activation, gradient)),
            other => Err(GradCamError::State {
                operation: "captured gradient",
                expected: "Backpropagated",
                actual: other.phase(),
            }),
        }
    }

    /// Every gradient produced by the last backward pass, parameters included.
    ///
    /// Nothing accumulates across runs: each backward yields a fresh store.
    pub fn parameter_gradients(&self) -> Option<&GradStore> {
        match &self.state {
            CaptureState::Backpropagated { grads, .. } => Some(grads),
            _ => None,
        }
    }

    fn prepare_input(&self, input: &Tensor) -> Result<Tensor> {
        let input = match input.rank() {
            3 => input.unsqueeze(0)?,
            4 => input.clone(),
            _ => {
                return Err(GradCamError::shape(format!(
                    "expected (C, H, W) or (1, C, H, W) input, got {:?}",
                    input.dims()
                )))
            }
        };
        self.model.check_input(input.dims())?;
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SequentialClassifier;
    use crate::layers::Layer;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::Linear;

    /// relu -> [tap] -> avgpool to 2x2 -> flatten -> linear(4 -> 2, no bias)
    fn toy_classifier(device: &Device) -> SequentialClassifier {
        let weight = Tensor::new(&[[1f32, 2., 3., 4.], [5., 6., 7., 8.]], device).unwrap();
        SequentialClassifier::new(
            "toy",
            Sequential::new(vec![
                Layer::Relu,
                Layer::AdaptiveAvgPool2d {
                    height: 2,
                    width: 2,
                },
            ]),
            Sequential::new(vec![Layer::Flatten, Layer::Linear(Linear::new(weight, None))]),
            (1, 4, 4),
            2,
        )
    }

    fn ramp(device: &Device) -> Tensor {
        Tensor::arange(0f32, 16., device)
            .unwrap()
            .reshape((1, 4, 4))
            .unwrap()
    }

    #[test]
    fn test_gradient_before_backward_is_state_error() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        assert_eq!(tapped.phase(), Phase::Idle);
        assert!(tapped.get_activations_gradient().unwrap_err().is_state_error());

        tapped.forward(&ramp(&device)).unwrap();
        assert_eq!(tapped.phase(), Phase::Forwarded);
        assert!(tapped.get_activations_gradient().unwrap_err().is_state_error());
    }

    #[test]
    fn test_backward_requires_forward() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let score = Tensor::new(1f32, &device).unwrap();
        let err = tapped.backward(&score).unwrap_err();
        assert!(matches!(
            err,
            GradCamError::State {
                actual: Phase::Idle,
                ..
            }
        ));
    }

    #[test]
    fn test_gradient_matches_avgpool_routing() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let logits = tapped.forward(&ramp(&device)).unwrap();

        // Window means of the ramp: 2.5, 4.5, 10.5, 12.5
        let values: Vec<f32> = logits.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![93., 213.]);

        tapped.backward(&logits.i((0, 1)).unwrap()).unwrap();
        assert_eq!(tapped.phase(), Phase::Backpropagated);

        let grad: Vec<f32> = tapped
            .get_activations_gradient()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        // Each 2x2 window receives its class weight spread over 4 cells.
        let expected = vec![
            1.25, 1.25, 1.5, 1.5, //
            1.25, 1.25, 1.5, 1.5, //
            1.75, 1.75, 2.0, 2.0, //
            1.75, 1.75, 2.0, 2.0,
        ];
        assert_eq!(grad, expected);
    }

    #[test]
    fn test_second_backward_rejected() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let logits = tapped.forward(&ramp(&device)).unwrap();
        tapped.backward(&logits.i((0, 0)).unwrap()).unwrap();
        let err = tapped.backward(&logits.i((0, 0)).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            GradCamError::State {
                actual: Phase::Backpropagated,
                ..
            }
        ));
        // The earlier capture survives the rejected call.
        assert!(tapped.get_activations_gradient().is_ok());
    }

    #[test]
    fn test_stale_score_rejected() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let stale = tapped.forward(&ramp(&device)).unwrap();
        tapped.forward(&ramp(&device)).unwrap();

        let err = tapped.backward(&stale.i((0, 0)).unwrap()).unwrap_err();
        assert!(err.is_state_error());
        assert_eq!(tapped.phase(), Phase::Forwarded);
    }

    #[test]
    fn test_forward_discards_previous_gradient() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let logits = tapped.forward(&ramp(&device)).unwrap();
        tapped.backward(&logits.i((0, 0)).unwrap()).unwrap();
        assert!(tapped.parameter_gradients().is_some());

        tapped.forward(&ramp(&device)).unwrap();
        assert_eq!(tapped.phase(), Phase::Forwarded);
        assert!(tapped.parameter_gradients().is_none());

        tapped.reset();
        assert_eq!(tapped.phase(), Phase::Idle);
        assert!(tapped.activation().is_err());
    }

    #[test]
    fn test_non_scalar_score_is_shape_error() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let logits = tapped.forward(&ramp(&device)).unwrap();
        assert!(matches!(
            tapped.backward(&logits),
            Err(GradCamError::Shape(_))
        ));
        assert_eq!(tapped.phase(), Phase::Forwarded);
    }

    #[test]
    fn test_get_activations_matches_forward() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let input = (ramp(&device) - 8.).unwrap();

        let first: Vec<f32> = tapped
            .get_activations(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let second: Vec<f32> = tapped
            .get_activations(&input)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(tapped.phase(), Phase::Idle);

        tapped.forward(&input).unwrap();
        let captured: Vec<f32> = tapped
            .activation()
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(first, captured);
    }

    #[test]
    fn test_bad_input_shape() {
        let device = Device::Cpu;
        let mut tapped = TappedClassifier::with_default_tap(toy_classifier(&device)).unwrap();
        let wrong = Tensor::zeros((1, 5, 5), DType::F32, &device).unwrap();
        assert!(matches!(tapped.forward(&wrong), Err(GradCamError::Shape(_))));
        let flat = Tensor::zeros(16, DType::F32, &device).unwrap();
        assert!(matches!(tapped.forward(&flat), Err(GradCamError::Shape(_))));
        assert_eq!(tapped.phase(), Phase::Idle);
    }

    #[test]
    fn test_invalid_tap_index() {
        let device = Device::Cpu;
        assert!(matches!(
            TappedClassifier::new(toy_classifier(&device), 2),
            Err(GradCamError::InvalidTap { index: 2, len: 2 })
        ));
    }
}
