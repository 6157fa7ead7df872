//! Inference engines. Each maps one `[1, N]` window to one raw score per class.

use crate::audio::NormalizedBuffer;
use crate::error::Result;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Trait abstraction for the classifier engine.
pub trait ScoreBackend {
    /// Raw, unnormalized class scores for one window.
    fn infer(&self, window: &NormalizedBuffer) -> Result<Vec<f32>>;
    fn model_name(&self) -> &str;
}

impl ScoreBackend for Box<dyn ScoreBackend> {
    fn infer(&self, window: &NormalizedBuffer) -> Result<Vec<f32>> {
        (**self).infer(window)
    }
    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Dummy backend: fixed per-class bias plus a term driven by signal energy.
#[derive(Debug, Clone)]
pub struct DummyBackend {
    bias: Vec<f32>,
    gain: Vec<f32>,
    name: String,
}

impl DummyBackend {
    pub fn new(classes: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(42);
        let bias = (0..classes).map(|_| rng.gen_range(-4.0..0.0)).collect();
        let gain = (0..classes).map(|_| rng.gen_range(-8.0..8.0)).collect();
        Self {
            bias,
            gain,
            name: "dummy-birdnet".into(),
        }
    }
}

impl ScoreBackend for DummyBackend {
    fn infer(&self, window: &NormalizedBuffer) -> Result<Vec<f32>> {
        let batch = window.batch_view();
        let rms = batch
            .map_axis(Axis(1), |row| {
                if row.is_empty() {
                    0.0
                } else {
                    (row.dot(&row) / row.len() as f32).sqrt()
                }
            })
            .sum();
        Ok(self
            .bias
            .iter()
            .zip(&self.gain)
            .map(|(b, g)| b + g * rms)
            .collect())
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

#[cfg(feature = "tract")]
mod tract_backend {
    use super::ScoreBackend;
    use crate::audio::NormalizedBuffer;
    use crate::error::{BirdclipError, Result};
    use std::path::Path;
    use tract_onnx::prelude::*;
    use tracing::debug;

    fn engine_err(e: impl std::fmt::Display) -> BirdclipError {
        BirdclipError::Inference(e.to_string())
    }

    pub struct TractBackend {
        pub model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
        pub output_slot: usize,
        pub window_len: usize,
        pub name: String,
    }

    impl TractBackend {
        pub fn from_path(path: &Path, window_len: usize, output_name: &str) -> Result<Self> {
            let model = tract_onnx::onnx()
                .model_for_path(path)
                .map_err(engine_err)?
                .with_input_fact(0, f32::fact([1, window_len]).into())
                .map_err(engine_err)?
                .into_optimized()
                .map_err(engine_err)?
                .into_runnable()
                .map_err(engine_err)?;

            let graph = model.model();
            let outlets = graph.output_outlets().map_err(engine_err)?;
            let output_slot = outlets
                .iter()
                .position(|o| graph.outlet_label(*o) == Some(output_name))
                .or_else(|| {
                    outlets
                        .iter()
                        .position(|o| graph.node(o.node).name == output_name)
                })
                .or(if outlets.len() == 1 { Some(0) } else { None })
                .ok_or_else(|| {
                    BirdclipError::Inference(format!("model has no output named {output_name:?}"))
                })?;
            debug!(path = %path.display(), output_slot, "loaded tract model");

            Ok(Self {
                model,
                output_slot,
                window_len,
                name: "birdnet-tract".into(),
            })
        }
    }

    impl ScoreBackend for TractBackend {
        fn infer(&self, window: &NormalizedBuffer) -> Result<Vec<f32>> {
            if window.len() != self.window_len {
                return Err(BirdclipError::Inference(format!(
                    "model was pinned to {} samples, got {}",
                    self.window_len,
                    window.len()
                )));
            }
            let input =
                tract_ndarray::Array2::from_shape_vec((1, window.len()), window.as_slice().to_vec())
                    .map_err(engine_err)?;
            let outputs = self
                .model
                .run(tvec!(Tensor::from(input).into()))
                .map_err(engine_err)?;
            let scores = outputs
                .get(self.output_slot)
                .ok_or_else(|| BirdclipError::Inference("missing output tensor".into()))?
                .to_array_view::<f32>()
                .map_err(engine_err)?;
            Ok(scores.iter().copied().collect())
        }

        fn model_name(&self) -> &str {
            &self.name
        }
    }

    pub use TractBackend as Backend;
}

#[cfg(feature = "tract")]
pub use tract_backend::Backend as TractBackend;

#[cfg(feature = "onnx")]
mod onnx_backend {
    use super::ScoreBackend;
    use crate::audio::NormalizedBuffer;
    use crate::error::{BirdclipError, Result};
    use lazy_static::lazy_static;
    use onnxruntime::environment::Environment;
    use onnxruntime::ndarray::Array2;
    use onnxruntime::session::Session;
    use onnxruntime::tensor::OrtOwnedTensor;
    use onnxruntime::{GraphOptimizationLevel, LoggingLevel, OrtError};
    use std::path::Path;
    use std::sync::Mutex;
    use tracing::debug;

    lazy_static! {
        static ref ENV: std::result::Result<Environment, OrtError> = Environment::builder()
            .with_name("birdclip")
            .with_log_level(LoggingLevel::Warning)
            .build();
    }

    fn engine_err(e: impl std::fmt::Display) -> BirdclipError {
        BirdclipError::Inference(e.to_string())
    }

    pub struct OnnxBackend {
        session: Mutex<Session<'static>>,
        output_slot: usize,
        name: String,
    }

    impl OnnxBackend {
        pub fn from_path(path: &Path, input_name: &str, output_name: &str) -> Result<Self> {
            let env = ENV.as_ref().map_err(engine_err)?;
            let session = env
                .new_session_builder()
                .map_err(engine_err)?
                .with_optimization_level(GraphOptimizationLevel::Basic)
                .map_err(engine_err)?
                .with_model_from_file(path)
                .map_err(engine_err)?;

            if session.inputs.len() != 1 || session.inputs[0].name != input_name {
                return Err(BirdclipError::Inference(format!(
                    "expected a single input named {input_name:?}, model has {:?}",
                    session.inputs.iter().map(|i| &i.name).collect::<Vec<_>>()
                )));
            }
            let output_slot = session
                .outputs
                .iter()
                .position(|o| o.name == output_name)
                .ok_or_else(|| {
                    BirdclipError::Inference(format!("model has no output named {output_name:?}"))
                })?;
            debug!(path = %path.display(), output_slot, "loaded onnx session");

            Ok(Self {
                session: Mutex::new(session),
                output_slot,
                name: "birdnet-onnx".into(),
            })
        }
    }

    impl ScoreBackend for OnnxBackend {
        fn infer(&self, window: &NormalizedBuffer) -> Result<Vec<f32>> {
            let input = Array2::from_shape_vec((1, window.len()), window.as_slice().to_vec())
                .map_err(engine_err)?;
            let mut session = self
                .session
                .lock()
                .map_err(|_| BirdclipError::Inference("session lock poisoned".into()))?;
            let outputs: Vec<OrtOwnedTensor<f32, _>> =
                session.run(vec![input]).map_err(engine_err)?;
            let scores = outputs
                .get(self.output_slot)
                .ok_or_else(|| BirdclipError::Inference("missing output tensor".into()))?;
            Ok(scores.iter().copied().collect())
        }

        fn model_name(&self) -> &str {
            &self.name
        }
    }

    pub use OnnxBackend as Backend;
}

#[cfg(feature = "onnx")]
pub use onnx_backend::Backend as OnnxBackend;
