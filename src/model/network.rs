use tch::{
    Kind, Tensor,
    nn::{self, Module, ModuleT},
};

use crate::model::topology::{Activation, LayerPlan, NetworkPlan, Pad2d, PlannedOp};

enum Layer {
    Conv2d {
        conv: nn::Conv2D,
        /// `[left, right, top, bottom]`, applied before the convolution when
        /// the padding is uneven.
        pre_pad: Option<[i64; 4]>,
        activation: Activation,
    },
    BatchNorm(nn::BatchNorm),
    MaxPool2d {
        pool_size: i64,
        strides: i64,
    },
    GlobalAvgPool,
    GlobalMaxPool,
    Flatten,
    Dense {
        linear: nn::Linear,
        activation: Activation,
    },
    Identity,
}

/// Trunk plus the three output heads, built from a [`NetworkPlan`].
/// Parameters live under `trunk.*`, `age.*`, `race.*` and `gender.*`.
pub(crate) struct Network {
    trunk: Vec<Layer>,
    age: Vec<Layer>,
    race: Vec<Layer>,
    gender: Vec<Layer>,
}

impl Network {
    pub(crate) fn build(root: nn::Path, plan: &NetworkPlan) -> Self {
        Self {
            trunk: build_sequence(&(&root / "trunk"), &plan.trunk),
            age: build_sequence(&(&root / "age"), &plan.age),
            race: build_sequence(&(&root / "race"), &plan.race),
            gender: build_sequence(&(&root / "gender"), &plan.gender),
        }
    }

    /// Runs an NCHW batch through the network in inference mode.
    pub(crate) fn forward(&self, xs: &Tensor) -> (Tensor, Tensor, Tensor) {
        let features = run(&self.trunk, xs);
        (
            run(&self.age, &features),
            run(&self.race, &features),
            run(&self.gender, &features),
        )
    }
}

fn build_sequence(vs: &nn::Path, plans: &[LayerPlan]) -> Vec<Layer> {
    plans
        .iter()
        .map(|plan| build_layer(&(vs / plan.name.as_str()), &plan.op))
        .collect()
}

fn build_layer(vs: &nn::Path, op: &PlannedOp) -> Layer {
    match *op {
        PlannedOp::Conv2d {
            in_channels,
            filters,
            kernel_size,
            strides,
            padding,
            activation,
        } => {
            let (conv_padding, pre_pad) = split_padding(padding);
            let config = nn::ConvConfig {
                stride: strides as i64,
                padding: conv_padding,
                ..Default::default()
            };
            Layer::Conv2d {
                conv: nn::conv2d(
                    vs,
                    in_channels as i64,
                    filters as i64,
                    kernel_size as i64,
                    config,
                ),
                pre_pad,
                activation,
            }
        }
        PlannedOp::BatchNorm {
            features,
            spatial,
            epsilon,
        } => {
            let config = nn::BatchNormConfig {
                eps: epsilon,
                ..Default::default()
            };
            let norm = if spatial {
                nn::batch_norm2d(vs, features as i64, config)
            } else {
                nn::batch_norm1d(vs, features as i64, config)
            };
            Layer::BatchNorm(norm)
        }
        PlannedOp::MaxPool2d { pool_size, strides } => Layer::MaxPool2d {
            pool_size: pool_size as i64,
            strides: strides as i64,
        },
        PlannedOp::GlobalAvgPool => Layer::GlobalAvgPool,
        PlannedOp::GlobalMaxPool => Layer::GlobalMaxPool,
        PlannedOp::Flatten => Layer::Flatten,
        PlannedOp::Dense {
            in_features,
            units,
            activation,
        } => Layer::Dense {
            linear: nn::linear(vs, in_features as i64, units as i64, Default::default()),
            activation,
        },
        PlannedOp::Dropout => Layer::Identity,
    }
}

/// Even padding goes to the convolution itself, anything else is applied
/// as an explicit zero pad beforehand.
fn split_padding(padding: Pad2d) -> (i64, Option<[i64; 4]>) {
    if padding.is_symmetric() {
        (padding.top as i64, None)
    } else {
        let pad = [padding.left, padding.right, padding.top, padding.bottom].map(|p| p as i64);
        (0, Some(pad))
    }
}

fn run(layers: &[Layer], xs: &Tensor) -> Tensor {
    layers
        .iter()
        .fold(xs.shallow_clone(), |xs, layer| layer.forward(&xs))
}

impl Layer {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Layer::Conv2d {
                conv,
                pre_pad,
                activation,
            } => {
                let ys = match pre_pad {
                    Some(pad) => conv.forward(&xs.constant_pad_nd(*pad)),
                    None => conv.forward(xs),
                };
                activate(ys, *activation)
            }
            Layer::BatchNorm(norm) => norm.forward_t(xs, false),
            Layer::MaxPool2d { pool_size, strides } => xs.max_pool2d(
                [*pool_size, *pool_size],
                [*strides, *strides],
                [0, 0],
                [1, 1],
                false,
            ),
            Layer::GlobalAvgPool => xs.adaptive_avg_pool2d([1, 1]).flatten(1, -1),
            Layer::GlobalMaxPool => xs.amax([2, 3], false),
            // Feature maps are flattened channels-last so dense kernels keep
            // the (height, width, channel) input order they were trained with.
            Layer::Flatten if xs.dim() == 4 => xs.permute([0, 2, 3, 1]).flatten(1, -1),
            Layer::Flatten => xs.flatten(1, -1),
            Layer::Dense { linear, activation } => activate(linear.forward(xs), *activation),
            Layer::Identity => xs.shallow_clone(),
        }
    }
}

fn activate(xs: Tensor, activation: Activation) -> Tensor {
    match activation {
        Activation::Linear => xs,
        Activation::Relu => xs.relu(),
        Activation::Sigmoid => xs.sigmoid(),
        Activation::Tanh => xs.tanh(),
        Activation::Softmax => xs.softmax(-1, Kind::Float),
    }
}
