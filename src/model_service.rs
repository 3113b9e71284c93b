use crate::detection::{ModelInfo, RawDetection};
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("session mutex poisoned")]
    PoisonedSession,
    #[error("forward pass failed: {0}")]
    ForwardPass(#[from] ort::Error),
    #[error("unexpected output tensor shape: {0}")]
    OutputShape(String),
}

/// Narrow interface over the detection capability, so the concrete engine
/// stays swappable and request handlers can be tested against a double.
pub trait ModelService: Send + Sync + 'static {
    /// Runs one forward pass over an RGB image. Candidate boxes below
    /// `conf_threshold` are dropped and overlapping boxes are de-duplicated
    /// per the model family's non-max-suppression policy, parameterized by
    /// `iou_threshold`. Thresholds are passed through unvalidated.
    fn infer(
        &self,
        image: &RgbImage,
        conf_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<RawDetection>, InferenceError>;

    fn info(&self) -> &ModelInfo;
}
