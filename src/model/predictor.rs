use std::{sync::Arc, time::Instant};

use axum::body::Bytes;
use tokio::task;

use crate::{
    error::ServiceError,
    model::{AttributeModel, FaceAttributes, ModelMetadata},
    preprocess::preprocess_image,
};

pub struct Predictor {
    model: Arc<dyn AttributeModel>,
}

impl Predictor {
    pub fn new(model: Arc<dyn AttributeModel>) -> Self {
        Self { model }
    }

    pub fn metadata(&self) -> ModelMetadata {
        self.model.metadata()
    }

    /// Decodes, runs and labels one upload on the blocking pool.
    pub async fn predict(&self, image: Bytes) -> Result<FaceAttributes, ServiceError> {
        let model = self.model.clone();

        task::spawn_blocking(move || {
            let start = Instant::now();
            let input = preprocess_image(&image)?;
            let output = model.forward(&input)?;
            let attributes = FaceAttributes::from_prediction(&output)?;

            tracing::debug!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                age = attributes.age,
                race = attributes.race,
                gender = attributes.gender,
                "prediction complete"
            );
            Ok(attributes)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::model::PredictionOutput;
    use image::{DynamicImage, ImageFormat, RgbImage};
    use ndarray::{Array4, arr2};

    struct FixedModel;

    impl AttributeModel for FixedModel {
        fn forward(&self, input: &Array4<f32>) -> Result<PredictionOutput, ServiceError> {
            assert_eq!(input.shape(), &[1, 198, 198, 3]);
            Ok(PredictionOutput {
                age: arr2(&[[0.27]]).into_dyn(),
                race: arr2(&[[0.1, 0.7, 0.1, 0.05, 0.05]]).into_dyn(),
                gender: arr2(&[[0.2, 0.8]]).into_dyn(),
            })
        }

        fn metadata(&self) -> ModelMetadata {
            ModelMetadata {
                name: "fixed".into(),
                device: "Cpu".into(),
                parameters: 0,
                size_bytes: 0,
                topology_path: String::new(),
                weights_path: String::new(),
            }
        }
    }

    struct PanickingModel;

    impl AttributeModel for PanickingModel {
        fn forward(&self, _input: &Array4<f32>) -> Result<PredictionOutput, ServiceError> {
            panic!("backend blew up");
        }

        fn metadata(&self) -> ModelMetadata {
            FixedModel.metadata()
        }
    }

    fn png_bytes() -> Bytes {
        let img = RgbImage::from_pixel(40, 60, image::Rgb([200, 150, 100]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        Bytes::from(buffer.into_inner())
    }

    #[tokio::test]
    async fn predict_formats_model_output() {
        let predictor = Predictor::new(Arc::new(FixedModel));

        let attributes = predictor.predict(png_bytes()).await.unwrap();

        assert_eq!(
            attributes,
            FaceAttributes {
                age: 27,
                race: "black",
                gender: "female"
            }
        );
    }

    #[tokio::test]
    async fn undecodable_upload_never_reaches_the_model() {
        let predictor = Predictor::new(Arc::new(PanickingModel));

        let err = predictor
            .predict(Bytes::from_static(b"plain text"))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[tokio::test]
    async fn panicking_backend_becomes_inference_error() {
        let predictor = Predictor::new(Arc::new(PanickingModel));

        let err = predictor.predict(png_bytes()).await.unwrap_err();

        assert!(matches!(err, ServiceError::Inference(_)));
    }
}
