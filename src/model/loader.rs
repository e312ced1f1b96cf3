use std::{collections::HashMap, fs, path::Path};

use ndarray::{Array4, ArrayD, IxDyn};
use parking_lot::Mutex;
use tch::{Device, Kind, Tensor, nn, no_grad};

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        AttributeModel, ModelMetadata, PredictionOutput, network::Network, topology::Topology,
    },
};

/// The process-wide model: topology-derived network plus its trained weights.
/// Read-only after [`FaceModel::load`].
pub struct FaceModel {
    metadata: ModelMetadata,
    device: Device,
    network: Mutex<Network>,
}

impl FaceModel {
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        Self::from_files(&config.topology_path, &config.weights_path, config.device)
    }

    pub fn from_files(
        topology_path: &Path,
        weights_path: &Path,
        device: Device,
    ) -> Result<Self, ServiceError> {
        let topology = Topology::from_path(topology_path)?;
        let plan = topology.plan()?;

        if !weights_path.exists() {
            return Err(ServiceError::ModelLoad(format!(
                "weights file missing: {}",
                weights_path.display()
            )));
        }
        let size_bytes = fs::metadata(weights_path)?.len();

        let mut vs = nn::VarStore::new(device);
        let network = Network::build(vs.root(), &plan);
        let parameters = load_weights(&vs, weights_path)?;
        vs.freeze();

        tracing::info!(
            name = %topology.name,
            parameters,
            size_bytes,
            ?device,
            "model weights loaded"
        );

        Ok(Self {
            metadata: ModelMetadata {
                name: topology.name,
                device: format!("{device:?}"),
                parameters,
                size_bytes,
                topology_path: topology_path.display().to_string(),
                weights_path: weights_path.display().to_string(),
            },
            device,
            network: Mutex::new(network),
        })
    }
}

impl AttributeModel for FaceModel {
    fn forward(&self, input: &Array4<f32>) -> Result<PredictionOutput, ServiceError> {
        let (n, h, w, c) = input.dim();
        let data: Vec<f32> = input.iter().copied().collect();

        // Device placement and the no-grad guard are entered on every call.
        let (age, race, gender) = no_grad(|| {
            let xs = Tensor::from_slice(&data)
                .reshape([n as i64, h as i64, w as i64, c as i64])
                .permute([0, 3, 1, 2])
                .to_device(self.device);
            let network = self.network.lock();
            network.forward(&xs)
        });

        Ok(PredictionOutput {
            age: to_array(&age)?,
            race: to_array(&race)?,
            gender: to_array(&gender)?,
        })
    }

    fn metadata(&self) -> ModelMetadata {
        self.metadata.clone()
    }
}

/// Copies every parameter the network declares out of the weights file.
/// Missing, extra or mis-shaped tensors are load errors.
fn load_weights(vs: &nn::VarStore, path: &Path) -> Result<usize, ServiceError> {
    let named = match path.extension().and_then(|ext| ext.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(path),
        _ => Tensor::load_multi(path),
    }
    .map_err(|e| {
        ServiceError::ModelLoad(format!("cannot read weights {}: {e}", path.display()))
    })?;
    let mut stored: HashMap<String, Tensor> = named.into_iter().collect();

    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));

    let mut parameters = 0;
    for (name, mut var) in variables {
        let src = stored.remove(&name).ok_or_else(|| {
            ServiceError::ModelLoad(format!("weights file has no tensor `{name}`"))
        })?;
        if src.size() != var.size() {
            return Err(ServiceError::ModelLoad(format!(
                "tensor `{name}` has shape {:?}, topology expects {:?}",
                src.size(),
                var.size()
            )));
        }
        no_grad(|| var.f_copy_(&src))
            .map_err(|e| ServiceError::ModelLoad(format!("cannot copy `{name}`: {e}")))?;
        parameters += var.numel();
    }

    if !stored.is_empty() {
        let mut extra: Vec<_> = stored.into_keys().collect();
        extra.sort();
        return Err(ServiceError::ModelLoad(format!(
            "weights file has tensors the topology does not use: {}",
            extra.join(", ")
        )));
    }

    Ok(parameters)
}

fn to_array(tensor: &Tensor) -> Result<ArrayD<f32>, ServiceError> {
    let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .contiguous()
        .view([-1]);
    let data = Vec::<f32>::try_from(&flat)
        .map_err(|e| ServiceError::Inference(format!("cannot read output tensor: {e}")))?;
    ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|e| ServiceError::Inference(format!("invalid output shape: {e}")))
}
