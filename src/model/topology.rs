//! Network topology description.
//!
//! A topology is a JSON document listing a shared trunk and three output
//! heads (age, race, gender). Layer widths that depend on the previous layer
//! are not written down; they are inferred here so that the weights file can
//! be checked against the expected parameter shapes before it is loaded.

use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::ServiceError,
    labels::{GENDER_LABELS, RACE_LABELS},
    preprocess::{CHANNELS, IMAGE_SIZE},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    /// `[height, width, channels]` of the expected input.
    #[serde(default = "default_input_shape")]
    pub input_shape: [usize; 3],
    #[serde(default)]
    pub trunk: Vec<LayerSpec>,
    pub heads: Heads,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heads {
    pub age: Vec<LayerSpec>,
    pub race: Vec<LayerSpec>,
    pub gender: Vec<LayerSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv2d {
        name: Option<String>,
        filters: usize,
        kernel_size: usize,
        #[serde(default = "default_stride")]
        strides: usize,
        #[serde(default)]
        padding: Padding,
        #[serde(default)]
        activation: Activation,
    },
    BatchNorm {
        name: Option<String>,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
    },
    MaxPool2d {
        name: Option<String>,
        pool_size: usize,
        strides: Option<usize>,
    },
    GlobalAvgPool {
        name: Option<String>,
    },
    GlobalMaxPool {
        name: Option<String>,
    },
    Flatten {
        name: Option<String>,
    },
    Dense {
        name: Option<String>,
        units: usize,
        #[serde(default)]
        activation: Activation,
    },
    Dropout {
        name: Option<String>,
        rate: f64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

fn default_input_shape() -> [usize; 3] {
    [IMAGE_SIZE as usize, IMAGE_SIZE as usize, CHANNELS]
}

fn default_stride() -> usize {
    1
}

fn default_epsilon() -> f64 {
    1e-3
}

/// Activation shape between layers, batch dimension omitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Spatial {
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat(usize),
}

/// Zero padding around a feature map, in rows and columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pad2d {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Pad2d {
    pub fn is_symmetric(&self) -> bool {
        self.top == self.bottom && self.left == self.right && self.top == self.left
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    Conv2d {
        in_channels: usize,
        filters: usize,
        kernel_size: usize,
        strides: usize,
        padding: Pad2d,
        activation: Activation,
    },
    BatchNorm {
        features: usize,
        spatial: bool,
        epsilon: f64,
    },
    MaxPool2d {
        pool_size: usize,
        strides: usize,
    },
    GlobalAvgPool,
    GlobalMaxPool,
    Flatten,
    Dense {
        in_features: usize,
        units: usize,
        activation: Activation,
    },
    Dropout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LayerPlan {
    pub name: String,
    pub op: PlannedOp,
    pub output: Shape,
}

/// A topology with every layer resolved against its input shape.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub trunk: Vec<LayerPlan>,
    pub age: Vec<LayerPlan>,
    pub race: Vec<LayerPlan>,
    pub gender: Vec<LayerPlan>,
}

impl NetworkPlan {
    pub fn output_shapes(&self) -> [Option<Shape>; 3] {
        [&self.age, &self.race, &self.gender].map(|layers| layers.last().map(|l| l.output))
    }
}

impl Topology {
    pub fn from_path(path: &Path) -> Result<Self, ServiceError> {
        let raw = fs::read_to_string(path).map_err(|e| {
            ServiceError::ModelLoad(format!("cannot read topology {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ServiceError::ModelLoad(format!("invalid topology {}: {e}", path.display()))
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ServiceError> {
        serde_json::from_str(raw)
            .map_err(|e| ServiceError::ModelLoad(format!("invalid topology description: {e}")))
    }

    pub fn plan(&self) -> Result<NetworkPlan, ServiceError> {
        let expected = default_input_shape();
        if self.input_shape != expected {
            return Err(ServiceError::ModelLoad(format!(
                "topology expects input {:?}, preprocessing produces {:?}",
                self.input_shape, expected
            )));
        }

        let input = Shape::Spatial {
            channels: CHANNELS,
            height: IMAGE_SIZE as usize,
            width: IMAGE_SIZE as usize,
        };

        let trunk = plan_sequence("trunk", &self.trunk, input)?;
        let features = trunk.last().map(|l| l.output).unwrap_or(input);

        let age = plan_sequence("age", &self.heads.age, features)?;
        let race = plan_sequence("race", &self.heads.race, features)?;
        let gender = plan_sequence("gender", &self.heads.gender, features)?;

        check_head_output("age", &age, None)?;
        check_head_output("race", &race, Some(RACE_LABELS.len()))?;
        check_head_output("gender", &gender, Some(GENDER_LABELS.len()))?;

        Ok(NetworkPlan {
            trunk,
            age,
            race,
            gender,
        })
    }
}

fn check_head_output(
    head: &str,
    layers: &[LayerPlan],
    classes: Option<usize>,
) -> Result<(), ServiceError> {
    let output = layers.last().map(|l| l.output);
    match (output, classes) {
        (Some(Shape::Flat(units)), Some(expected)) if units == expected => Ok(()),
        (Some(Shape::Flat(units)), None) if units > 0 => Ok(()),
        (Some(Shape::Flat(units)), Some(expected)) => Err(ServiceError::ModelLoad(format!(
            "{head} head produces {units} classes, label table has {expected}"
        ))),
        _ => Err(ServiceError::ModelLoad(format!(
            "{head} head must end in a flat output, got {output:?}"
        ))),
    }
}

fn plan_sequence(
    scope: &str,
    layers: &[LayerSpec],
    input: Shape,
) -> Result<Vec<LayerPlan>, ServiceError> {
    let mut names = HashSet::new();
    let mut shape = input;
    let mut planned = Vec::with_capacity(layers.len());

    for (idx, spec) in layers.iter().enumerate() {
        let name = spec
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}_{}", spec.kind(), idx + 1));
        if name.is_empty() || name.contains('.') {
            return Err(ServiceError::ModelLoad(format!(
                "{scope}: invalid layer name `{name}`"
            )));
        }
        if !names.insert(name.clone()) {
            return Err(ServiceError::ModelLoad(format!(
                "{scope}: duplicate layer name `{name}`"
            )));
        }

        let (op, output) = resolve(spec, shape)
            .map_err(|reason| ServiceError::ModelLoad(format!("{scope}.{name}: {reason}")))?;
        planned.push(LayerPlan { name, op, output });
        shape = output;
    }

    Ok(planned)
}

fn resolve(spec: &LayerSpec, input: Shape) -> Result<(PlannedOp, Shape), String> {
    match *spec {
        LayerSpec::Conv2d {
            filters,
            kernel_size,
            strides,
            padding,
            activation,
            ..
        } => {
            let (channels, height, width) = spatial(input)?;
            if filters == 0 || kernel_size == 0 || strides == 0 {
                return Err("filters, kernel_size and strides must be positive".into());
            }
            let pad = match padding {
                Padding::Valid => Pad2d::default(),
                Padding::Same => {
                    let (top, bottom) = same_padding(height, kernel_size, strides);
                    let (left, right) = same_padding(width, kernel_size, strides);
                    Pad2d {
                        top,
                        bottom,
                        left,
                        right,
                    }
                }
            };
            let height = window_output(height + pad.top + pad.bottom, kernel_size, strides)?;
            let width = window_output(width + pad.left + pad.right, kernel_size, strides)?;
            let op = PlannedOp::Conv2d {
                in_channels: channels,
                filters,
                kernel_size,
                strides,
                padding: pad,
                activation,
            };
            Ok((
                op,
                Shape::Spatial {
                    channels: filters,
                    height,
                    width,
                },
            ))
        }
        LayerSpec::BatchNorm { epsilon, .. } => {
            if !(epsilon > 0.0) {
                return Err("epsilon must be positive".into());
            }
            let (features, spatial) = match input {
                Shape::Spatial { channels, .. } => (channels, true),
                Shape::Flat(units) => (units, false),
            };
            Ok((
                PlannedOp::BatchNorm {
                    features,
                    spatial,
                    epsilon,
                },
                input,
            ))
        }
        LayerSpec::MaxPool2d {
            pool_size, strides, ..
        } => {
            let (channels, height, width) = spatial(input)?;
            let strides = strides.unwrap_or(pool_size);
            if pool_size == 0 || strides == 0 {
                return Err("pool_size and strides must be positive".into());
            }
            let height = window_output(height, pool_size, strides)?;
            let width = window_output(width, pool_size, strides)?;
            Ok((
                PlannedOp::MaxPool2d { pool_size, strides },
                Shape::Spatial {
                    channels,
                    height,
                    width,
                },
            ))
        }
        LayerSpec::GlobalAvgPool { .. } => {
            let (channels, _, _) = spatial(input)?;
            Ok((PlannedOp::GlobalAvgPool, Shape::Flat(channels)))
        }
        LayerSpec::GlobalMaxPool { .. } => {
            let (channels, _, _) = spatial(input)?;
            Ok((PlannedOp::GlobalMaxPool, Shape::Flat(channels)))
        }
        LayerSpec::Flatten { .. } => {
            let units = match input {
                Shape::Spatial {
                    channels,
                    height,
                    width,
                } => channels * height * width,
                Shape::Flat(units) => units,
            };
            Ok((PlannedOp::Flatten, Shape::Flat(units)))
        }
        LayerSpec::Dense {
            units, activation, ..
        } => {
            let Shape::Flat(in_features) = input else {
                return Err("dense layer needs flat input, add flatten or global pooling".into());
            };
            if units == 0 {
                return Err("units must be positive".into());
            }
            Ok((
                PlannedOp::Dense {
                    in_features,
                    units,
                    activation,
                },
                Shape::Flat(units),
            ))
        }
        LayerSpec::Dropout { rate, .. } => {
            if !(0.0..1.0).contains(&rate) {
                return Err(format!("dropout rate {rate} outside [0, 1)"));
            }
            Ok((PlannedOp::Dropout, input))
        }
    }
}

fn spatial(shape: Shape) -> Result<(usize, usize, usize), String> {
    match shape {
        Shape::Spatial {
            channels,
            height,
            width,
        } => Ok((channels, height, width)),
        Shape::Flat(_) => Err("layer needs spatial input, got a flat vector".into()),
    }
}

/// Keras-style `same` padding: the output keeps `ceil(extent / stride)`
/// positions and any odd remainder goes to the bottom or right edge.
fn same_padding(extent: usize, window: usize, stride: usize) -> (usize, usize) {
    let output = extent.div_ceil(stride);
    let total = ((output - 1) * stride + window).saturating_sub(extent);
    (total / 2, total - total / 2)
}

fn window_output(extent: usize, window: usize, stride: usize) -> Result<usize, String> {
    if window > extent {
        return Err(format!("window {window} larger than input extent {extent}"));
    }
    Ok((extent - window) / stride + 1)
}

impl LayerSpec {
    fn name(&self) -> Option<&str> {
        match self {
            LayerSpec::Conv2d { name, .. }
            | LayerSpec::BatchNorm { name, .. }
            | LayerSpec::MaxPool2d { name, .. }
            | LayerSpec::GlobalAvgPool { name }
            | LayerSpec::GlobalMaxPool { name }
            | LayerSpec::Flatten { name }
            | LayerSpec::Dense { name, .. }
            | LayerSpec::Dropout { name, .. } => name.as_deref(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            LayerSpec::Conv2d { .. } => "conv2d",
            LayerSpec::BatchNorm { .. } => "batch_norm",
            LayerSpec::MaxPool2d { .. } => "max_pool2d",
            LayerSpec::GlobalAvgPool { .. } => "global_avg_pool",
            LayerSpec::GlobalMaxPool { .. } => "global_max_pool",
            LayerSpec::Flatten { .. } => "flatten",
            LayerSpec::Dense { .. } => "dense",
            LayerSpec::Dropout { .. } => "dropout",
        }
    }
}
