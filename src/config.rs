//! Face embedding service configuration

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub max_upload_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Directory holding the ONNX model artifacts.
    pub dir: PathBuf,
    /// Detector model file name, relative to `dir`.
    pub detector: String,
    /// Embedder model file name, relative to `dir`.
    pub embedder: String,
    /// Comma-delimited execution provider preference list.
    /// The first provider the runtime supports wins.
    pub providers: String,
    /// Detector input resolution as "W,H".
    pub det_size: String,
    /// -1 = CPU only, N >= 0 = accelerator device index.
    pub device_id: i32,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    /// Apply environment overrides on top of the file/default config.
    /// Unset variables leave the current value untouched.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port.parse().context("PORT must be a valid port number")?;
        }
        if let Ok(dir) = std::env::var("MODEL_DIR") {
            self.model.dir = PathBuf::from(dir.trim());
        }
        if let Ok(providers) = std::env::var("ORT_PROVIDERS") {
            self.model.providers = providers;
        }
        if let Ok(det_size) = std::env::var("DET_SIZE") {
            self.model.det_size = det_size;
        }
        if let Ok(gpu_id) = std::env::var("GPU_ID") {
            self.model.device_id = gpu_id.parse().context("GPU_ID must be an integer")?;
        }
        Ok(())
    }
}

impl ModelConfig {
    pub fn detector_path(&self) -> PathBuf {
        self.dir.join(&self.detector)
    }

    pub fn embedder_path(&self) -> PathBuf {
        self.dir.join(&self.embedder)
    }

    /// Execution provider names in preference order, trimmed, empties dropped.
    pub fn providers(&self) -> Vec<String> {
        self.providers
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Parse the "W,H" detection size string. Both sides must be positive.
    pub fn det_size(&self) -> Result<(u32, u32)> {
        let parts: Vec<&str> = self.det_size.split(',').map(str::trim).collect();
        if parts.len() != 2 {
            bail!("det_size must be \"W,H\", got {:?}", self.det_size);
        }
        let w: u32 = parts[0]
            .parse()
            .with_context(|| format!("invalid detection width {:?}", parts[0]))?;
        let h: u32 = parts[1]
            .parse()
            .with_context(|| format!("invalid detection height {:?}", parts[1]))?;
        if w == 0 || h == 0 {
            bail!("detection size must be positive, got {}x{}", w, h);
        }
        Ok((w, h))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                port: 8000,
                max_upload_mb: 20,
            },
            model: ModelConfig {
                dir: PathBuf::from("models"),
                detector: "scrfd_10g_kps.onnx".to_string(),
                embedder: "glint360k_r100.onnx".to_string(),
                providers: "CPUExecutionProvider".to_string(),
                det_size: "640,640".to_string(),
                device_id: -1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_det_size_parsing() {
        let mut model = Config::default().model;
        model.det_size = "640,640".to_string();
        assert_eq!(model.det_size().unwrap(), (640, 640));

        model.det_size = " 320 , 416 ".to_string();
        assert_eq!(model.det_size().unwrap(), (320, 416));
    }

    #[test]
    fn test_det_size_rejects_malformed() {
        let mut model = Config::default().model;
        for bad in ["640", "640,640,640", "0,640", "640,0", "abc,640", ""] {
            model.det_size = bad.to_string();
            assert!(model.det_size().is_err(), "expected {:?} to be rejected", bad);
        }
    }

    #[test]
    fn test_providers_split() {
        let mut model = Config::default().model;
        model.providers = "CUDAExecutionProvider, CPUExecutionProvider,,".to_string();
        assert_eq!(
            model.providers(),
            vec!["CUDAExecutionProvider", "CPUExecutionProvider"]
        );
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.model.det_size().unwrap(), (640, 640));
        assert_eq!(config.model.providers(), vec!["CPUExecutionProvider"]);
        assert_eq!(config.model.device_id, -1);
    }
}
