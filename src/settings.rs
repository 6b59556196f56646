use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8767;
const DEFAULT_MODEL: u32 = 1;
/// How long a request waits for the device gate before reporting busy.
const GATE_WAIT_MS: u64 = 100;
/// Profile sources are probed as MODEL_1_CONFIG .. MODEL_<MAX>_CONFIG.
const MAX_MODEL: u32 = 16;

/// Runtime settings, read from the environment exactly once at startup.
///
/// The core components receive these as plain values and never touch the
/// environment themselves.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding plottable artwork (ART_DIRECTORY).
    pub art_dir: PathBuf,
    /// Where uploaded artwork lands (UPLOAD_DIRECTORY).
    pub upload_dir: PathBuf,
    /// Model assumed when a device cannot be classified (DEFAULT_MODEL).
    pub default_model: u32,
    /// Per-model profile sources (MODEL_<n>_CONFIG).
    pub model_configs: HashMap<u32, PathBuf>,
    /// Serial port override (DEVICE_PORT); autodetected when unset.
    pub device_port: Option<String>,
    /// HTTP bind address (HOST / HOST_PORT).
    pub bind: SocketAddr,
    pub gate_wait: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let art_dir =
            PathBuf::from(env::var("ART_DIRECTORY").context("ART_DIRECTORY is not set")?);

        let upload_dir = match env::var("UPLOAD_DIRECTORY") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => ProjectDirs::from("", "", "plotd")
                .context("Failed to determine an upload directory")?
                .data_dir()
                .join("uploads"),
        };

        let default_model = match env::var("DEFAULT_MODEL") {
            Ok(value) => value.parse().context("DEFAULT_MODEL is not an integer")?,
            Err(_) => DEFAULT_MODEL,
        };

        let mut model_configs = HashMap::new();
        for model in 1..=MAX_MODEL {
            if let Ok(path) = env::var(format!("MODEL_{}_CONFIG", model)) {
                model_configs.insert(model, PathBuf::from(path));
            }
        }

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = match env::var("HOST_PORT") {
            Ok(value) => value.parse().context("HOST_PORT is not a valid port")?,
            Err(_) => DEFAULT_PORT,
        };
        let bind = format!("{}:{}", host, port)
            .parse()
            .context("HOST/HOST_PORT is not a valid bind address")?;

        Ok(Self {
            art_dir,
            upload_dir,
            default_model,
            model_configs,
            device_port: env::var("DEVICE_PORT").ok(),
            bind,
            gate_wait: Duration::from_millis(GATE_WAIT_MS),
        })
    }
}
