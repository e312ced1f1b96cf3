use ndarray::{ArrayD, ArrayView1, Axis};
use serde::Serialize;

use crate::{
    error::ServiceError,
    labels::{gender_label, race_label},
};

/// Raw outputs of one forward pass, shapes as produced by the network.
#[derive(Debug, Clone)]
pub struct PredictionOutput {
    pub age: ArrayD<f32>,
    pub race: ArrayD<f32>,
    pub gender: ArrayD<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaceAttributes {
    pub age: i32,
    pub race: &'static str,
    pub gender: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub device: String,
    pub parameters: usize,
    pub size_bytes: u64,
    pub topology_path: String,
    pub weights_path: String,
}

impl FaceAttributes {
    pub fn from_prediction(output: &PredictionOutput) -> Result<Self, ServiceError> {
        let raw_age = output
            .age
            .iter()
            .next()
            .copied()
            .ok_or_else(|| ServiceError::Inference("age output is empty".into()))?;
        let scaled = raw_age * 100.0;
        if !scaled.is_finite() {
            return Err(ServiceError::Inference(format!(
                "age output {raw_age} is not finite"
            )));
        }

        let race_idx = first_row_argmax(&output.race)
            .ok_or_else(|| ServiceError::Inference("race output is empty".into()))?;
        let gender_idx = first_row_argmax(&output.gender)
            .ok_or_else(|| ServiceError::Inference("gender output is empty".into()))?;

        let race = race_label(race_idx).ok_or_else(|| {
            ServiceError::Inference(format!("race class index {race_idx} has no label"))
        })?;
        let gender = gender_label(gender_idx).ok_or_else(|| {
            ServiceError::Inference(format!("gender class index {gender_idx} has no label"))
        })?;

        Ok(Self {
            age: scaled.trunc() as i32,
            race,
            gender,
        })
    }
}

/// Index of the largest score along the class axis for the first batch row.
/// Ties resolve to the lowest index.
fn first_row_argmax(scores: &ArrayD<f32>) -> Option<usize> {
    if scores.ndim() == 0 {
        return scores.first().map(|_| 0);
    }
    let class_axis = Axis(scores.ndim() - 1);
    let row = scores.lanes(class_axis).into_iter().next()?;
    argmax(row)
}

fn argmax(row: ArrayView1<'_, f32>) -> Option<usize> {
    row.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (idx, &value)| match best {
            Some((_, top)) if !(value > top) => best,
            _ => Some((idx, value)),
        })
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn, arr2};

    fn output(age: f32, race: [f32; 5], gender: [f32; 2]) -> PredictionOutput {
        PredictionOutput {
            age: arr2(&[[age]]).into_dyn(),
            race: arr2(&[race]).into_dyn(),
            gender: arr2(&[gender]).into_dyn(),
        }
    }

    #[test]
    fn age_is_scaled_and_truncated() {
        let attrs =
            FaceAttributes::from_prediction(&output(0.349, [0.1, 0.1, 0.6, 0.1, 0.1], [0.7, 0.3]))
                .unwrap();
        assert_eq!(
            attrs,
            FaceAttributes {
                age: 34,
                race: "asian",
                gender: "male"
            }
        );
    }

    #[test]
    fn labels_follow_argmax() {
        let attrs =
            FaceAttributes::from_prediction(&output(0.2, [0.0, 0.0, 0.0, 0.1, 0.9], [0.4, 0.6]))
                .unwrap();
        assert_eq!(attrs.age, 20);
        assert_eq!(attrs.race, "others");
        assert_eq!(attrs.gender, "female");
    }

    #[test]
    fn ties_pick_the_first_class() {
        let attrs =
            FaceAttributes::from_prediction(&output(0.0, [0.2, 0.2, 0.2, 0.2, 0.2], [0.5, 0.5]))
                .unwrap();
        assert_eq!(attrs.race, "white");
        assert_eq!(attrs.gender, "male");
    }

    #[test]
    fn age_takes_first_element_of_any_shape() {
        let mut out = output(0.0, [1.0, 0.0, 0.0, 0.0, 0.0], [1.0, 0.0]);
        out.age = Array::from_shape_vec(IxDyn(&[1, 2, 1]), vec![0.55, 0.99]).unwrap();
        let attrs = FaceAttributes::from_prediction(&out).unwrap();
        assert_eq!(attrs.age, 55);
    }

    #[test]
    fn only_the_first_batch_row_is_used() {
        let mut out = output(0.1, [1.0, 0.0, 0.0, 0.0, 0.0], [1.0, 0.0]);
        out.race = arr2(&[[0.0, 1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0, 0.0]]).into_dyn();
        let attrs = FaceAttributes::from_prediction(&out).unwrap();
        assert_eq!(attrs.race, "black");
    }

    #[test]
    fn non_finite_age_is_an_inference_error() {
        let err =
            FaceAttributes::from_prediction(&output(f32::NAN, [1.0, 0.0, 0.0, 0.0, 0.0], [1.0, 0.0]))
                .unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }

    #[test]
    fn empty_output_is_an_inference_error() {
        let mut out = output(0.5, [1.0, 0.0, 0.0, 0.0, 0.0], [1.0, 0.0]);
        out.gender = Array::from_shape_vec(IxDyn(&[1, 0]), vec![]).unwrap();
        let err = FaceAttributes::from_prediction(&out).unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }

    #[test]
    fn class_index_beyond_table_is_an_inference_error() {
        let mut out = output(0.5, [1.0, 0.0, 0.0, 0.0, 0.0], [1.0, 0.0]);
        out.gender = arr2(&[[0.0, 0.1, 0.9]]).into_dyn();
        let err = FaceAttributes::from_prediction(&out).unwrap_err();
        assert!(matches!(err, ServiceError::Inference(_)));
    }

    #[test]
    fn serializes_to_flat_json() {
        let attrs = FaceAttributes {
            age: 34,
            race: "asian",
            gender: "male",
        };
        let json = serde_json::to_value(&attrs).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "age": 34, "race": "asian", "gender": "male" })
        );
    }
}
