#[cfg(feature = "tch-backend")]
mod loader;
#[cfg(feature = "tch-backend")]
mod network;
mod predictor;
pub mod topology;
mod types;

use ndarray::Array4;

use crate::error::ServiceError;

#[cfg(feature = "tch-backend")]
pub use loader::FaceModel;
pub use predictor::Predictor;
pub use types::{FaceAttributes, ModelMetadata, PredictionOutput};

/// A loaded network that can run a single forward pass.
///
/// Implementations are shared across request handlers and must tolerate
/// concurrent calls; any execution context the backend needs is entered
/// inside `forward` itself.
pub trait AttributeModel: Send + Sync + 'static {
    fn forward(&self, input: &Array4<f32>) -> Result<PredictionOutput, ServiceError>;

    fn metadata(&self) -> ModelMetadata;
}
