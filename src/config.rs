use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::Context;
#[cfg(feature = "tch-backend")]
use tch::Device;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:5000";
const DEFAULT_TOPOLOGY_PATH: &str = "model/model.json";
const DEFAULT_WEIGHTS_PATH: &str = "model/weights.safetensors";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub topology_path: PathBuf,
    pub weights_path: PathBuf,
    pub max_upload_bytes: usize,
    pub json_logs: bool,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so tests do not
    /// have to touch the process environment.
    pub fn from_vars<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_addr = lookup("SERVER_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.into());
        let listen_addr = raw_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid SERVER_ADDR `{raw_addr}`"))?;

        let topology_path = PathBuf::from(
            lookup("MODEL_TOPOLOGY_PATH").unwrap_or_else(|| DEFAULT_TOPOLOGY_PATH.to_string()),
        );
        let weights_path = PathBuf::from(
            lookup("MODEL_WEIGHTS_PATH").unwrap_or_else(|| DEFAULT_WEIGHTS_PATH.to_string()),
        );

        let max_upload_bytes = lookup("MAX_UPLOAD_BYTES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let json_logs = lookup("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = lookup("DEVICE").unwrap_or_else(|| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            topology_path,
            weights_path,
            max_upload_bytes,
            json_logs,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::Cpu
    }
}
