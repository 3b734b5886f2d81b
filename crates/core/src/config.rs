use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::OutputFormat;
use crate::fallback::{Device, ModelId};
use crate::orchestrator::{
    UpscaleConfig, DEFAULT_MAX_IMAGE_SIZE, DEFAULT_TILE_OVERLAP, DEFAULT_TILE_SIZE,
    DEFAULT_TILE_TIMEOUT,
};

const CONFIG_FILE_NAME: &str = "config.toml";
pub const ENV_DATA_DIR: &str = "UPSCALER_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub upscaler: UpscalerConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    /// When set, every upscaled result served over HTTP is also written here.
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_upload_mb: u64,
    /// Upscale requests allowed to run at once; the rest queue.
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpscalerConfig {
    /// Primary model, tried first.
    pub model: String,
    /// Known-compatible alternatives, tried in order after the primary.
    pub fallback_models: Vec<String>,
    /// Device chain, accelerators first (`cuda`, `cuda:1`, `tensorrt`, `cpu`).
    pub devices: Vec<String>,
    pub max_image_size: u32,
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub tile_timeout_secs: u64,
    pub max_in_flight_tiles: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub quality: u8,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
            output_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            host: "0.0.0.0".to_string(),
            max_upload_mb: 20,
            max_concurrent_requests: 1,
        }
    }
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_mb as usize).saturating_mul(1024 * 1024)
    }
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            model: "RealESRGAN_x4plus_anime_6B".to_string(),
            fallback_models: vec![
                "RealESRGAN_x4plus".to_string(),
                "realesr-general-x4v3".to_string(),
            ],
            devices: vec!["cuda".to_string(), "cpu".to_string()],
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            tile_size: DEFAULT_TILE_SIZE,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            tile_timeout_secs: DEFAULT_TILE_TIMEOUT.as_secs(),
            max_in_flight_tiles: 1,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Jpeg,
            quality: 95,
        }
    }
}

impl UpscalerConfig {
    /// Primary model followed by the fallbacks, without duplicates.
    pub fn model_chain(&self) -> Vec<ModelId> {
        let mut chain: Vec<ModelId> = Vec::new();
        for name in std::iter::once(&self.model).chain(&self.fallback_models) {
            let id = ModelId::new(name.trim());
            if !id.as_str().is_empty() && !chain.contains(&id) {
                chain.push(id);
            }
        }
        chain
    }

    pub fn device_chain(&self) -> Result<Vec<Device>> {
        let mut chain = Vec::new();
        for raw in &self.devices {
            let device: Device = raw
                .parse()
                .with_context(|| format!("invalid device in [upscaler].devices: {raw}"))?;
            if !chain.contains(&device) {
                chain.push(device);
            }
        }
        Ok(chain)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Builds and validates the per-request upscale settings.
    pub fn upscale_config(&self) -> Result<UpscaleConfig> {
        let up = &self.upscaler;
        let config = UpscaleConfig {
            max_image_size: up.max_image_size,
            tile_size: up.tile_size,
            tile_overlap: up.tile_overlap,
            model_chain: up.model_chain(),
            device_chain: up.device_chain()?,
            output_format: self.output.format,
            output_quality: self.output.quality,
            tile_timeout: Duration::from_secs(up.tile_timeout_secs),
            max_in_flight_tiles: up.max_in_flight_tiles,
        };
        config
            .validate()
            .context("invalid [upscaler] or [output] configuration")?;
        Ok(config)
    }

    /// Rewrites relative paths against `data_dir`.
    pub fn resolve_paths(&mut self, data_dir: &Path) {
        self.paths.models_dir = resolve_relative_to(data_dir, &self.paths.models_dir);
        self.paths.trt_cache_dir = resolve_relative_to(data_dir, &self.paths.trt_cache_dir);
        if let Some(dir) = self.paths.output_dir.take() {
            self.paths.output_dir = Some(resolve_relative_to(data_dir, &dir));
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. UPSCALER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and writes a default config.toml on first run.
/// An existing config file is never touched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` as-is if absolute, otherwise joined to `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert!(cfg.paths.output_dir.is_none());
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.server.max_upload_bytes(), 20 * 1024 * 1024);
        assert_eq!(cfg.upscaler.max_image_size, 1024);
        assert_eq!(cfg.output.format, OutputFormat::Jpeg);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = AppConfig::default();
        original.paths.output_dir = Some(PathBuf::from("results"));
        original.output.format = OutputFormat::Webp;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: AppConfig = toml::from_str(
            "[upscaler]\ntile_size = 256\ndevices = [\"tensorrt\", \"cpu\"]\n\n[output]\nformat = \"png\"\n",
        )
        .unwrap();
        assert_eq!(cfg.upscaler.tile_size, 256);
        assert_eq!(cfg.upscaler.tile_overlap, 32);
        assert_eq!(cfg.output.format, OutputFormat::Png);
        assert_eq!(cfg.server.port, 8000);
    }

    #[test]
    fn upscale_config_builds_chains() {
        let mut cfg = AppConfig::default();
        cfg.upscaler.fallback_models = vec![
            "RealESRGAN_x4plus".into(),
            "RealESRGAN_x4plus_anime_6B".into(),
            " ".into(),
        ];
        cfg.upscaler.devices = vec!["cuda:1".into(), "CPU".into(), "cpu".into()];
        let up = cfg.upscale_config().unwrap();
        assert_eq!(
            up.model_chain,
            vec![
                ModelId::from("RealESRGAN_x4plus_anime_6B"),
                ModelId::from("RealESRGAN_x4plus")
            ]
        );
        assert_eq!(up.device_chain, vec![Device::Cuda(1), Device::Cpu]);
        assert_eq!(up.tile_timeout, DEFAULT_TILE_TIMEOUT);
    }

    #[test]
    fn upscale_config_rejects_bad_values() {
        let mut cfg = AppConfig::default();
        cfg.upscaler.tile_overlap = cfg.upscaler.tile_size;
        assert!(cfg.upscale_config().is_err());

        let mut cfg = AppConfig::default();
        cfg.upscaler.devices = vec!["quantum".into()];
        let err = cfg.upscale_config().unwrap_err();
        assert!(format!("{err:#}").contains("quantum"));

        let mut cfg = AppConfig::default();
        cfg.upscaler.devices.clear();
        assert!(cfg.upscale_config().is_err());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AppConfig::load_from_path(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn load_rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = ").unwrap();
        assert!(AppConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_uses_env_var_when_no_cli() {
        env::set_var(ENV_DATA_DIR, "/env/path");
        let result = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        assert_eq!(result, PathBuf::from("/env/path"));
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let temp = tempfile::tempdir().unwrap();
        let data = temp.path().join("data");
        initialize_data_dir(&data).expect("initialize data dir");
        assert!(data.join("config.toml").exists());
        let loaded = AppConfig::load_from_path(&config_path(&data)).unwrap();
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let temp = tempfile::tempdir().unwrap();
        let cfg_path = temp.path().join("config.toml");
        let custom_content = "[server]\nport = 9999\n";
        fs::write(&cfg_path, custom_content).unwrap();

        initialize_data_dir(temp.path()).expect("initialize data dir");

        assert_eq!(fs::read_to_string(&cfg_path).unwrap(), custom_content);
    }

    #[test]
    fn resolve_paths_joins_relative_entries() {
        let mut cfg = AppConfig::default();
        cfg.paths.trt_cache_dir = PathBuf::from("/abs/trt");
        cfg.paths.output_dir = Some(PathBuf::from("out"));
        cfg.resolve_paths(Path::new("/base"));
        assert_eq!(cfg.paths.models_dir, PathBuf::from("/base/models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("/abs/trt"));
        assert_eq!(cfg.paths.output_dir, Some(PathBuf::from("/base/out")));
    }
}
