pub mod config;
pub mod error;
pub mod labels;
pub mod model;
mod pages;
pub mod preprocess;
pub mod server;

pub use config::AppConfig;
#[cfg(feature = "tch-backend")]
pub use model::FaceModel;
pub use model::{AttributeModel, FaceAttributes, Predictor};
pub use server::{build_router, shutdown_signal};
