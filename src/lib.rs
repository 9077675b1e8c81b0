// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→usize/f32 in resampling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `row`/`rows`
#![allow(clippy::module_name_repetitions)] // GradCamError in error.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::needless_pass_by_value)] // configs passed by value into loaders

//! gradcam-rs: Grad-CAM for convolutional classifiers
//!
//! Explains an image classifier's prediction by highlighting the spatial
//! regions that most increased the target class score.
//!
//! ## Architecture
//!
//! - `layers`: Sublayer enum and ordered `Sequential` stacks (torchvision indexing)
//! - `classifier`: `Classifier` capability trait, `TapPoint`, feature splitter
//! - `small_cnn`: Two-stage CNN for 28×28 grayscale inputs
//! - `vgg`: VGG-style network (VGG11/16/19 presets) for 224×224 RGB inputs
//! - `tapped`: `TappedClassifier` capturing the tapped activation and its gradient
//! - `gradcam`: Grad-CAM engine (target selection, backward, heatmap reduction)
//! - `heatmap`: `Heatmap` grid and bilinear upscaling for overlays
//! - `error`: Typed errors (`Shape`, `State`, `InvalidClassIndex`, ...)

pub mod classifier;
pub mod error;
pub mod gradcam;
pub mod heatmap;
pub mod layers;
pub mod small_cnn;
pub mod tapped;
pub mod vgg;

pub use classifier::{split_features, Classifier, SequentialClassifier, TapPoint};
pub use error::{GradCamError, Result};
pub use gradcam::{top_k_classes, Explanation, GradCam, GradCamConfig};
pub use heatmap::{upscale, Heatmap};
pub use layers::{adaptive_avg_pool2d, Layer, Sequential};
pub use small_cnn::{SmallCnn, SmallCnnConfig};
pub use tapped::{Phase, TappedClassifier};
pub use vgg::{Vgg, VggConfig};
