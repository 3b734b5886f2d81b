use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

/// Catalog entry for a super-resolution model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    /// Upscale factor. `None` for discovered files whose metadata is unknown;
    /// the backend then derives it from the output shape.
    pub scale: Option<u32>,
    /// Value range the model expects/produces: `(0.0, 255.0)` for ESRGAN, `(0.0, 1.0)` for Compact.
    pub normalization_range: (f32, f32),
    /// Spatial dimensions must be multiples of this.
    pub pad_align: u32,
    pub description: String,
    /// Whether the model uses FP16 inputs/outputs.
    pub is_fp16: bool,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    vec![
        ModelEntry {
            name: "RealESRGAN_x4plus_anime_6B".into(),
            filename: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            url: Some("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into()),
            sha256: None,
            scale: Some(4),
            normalization_range: (0.0, 255.0),
            pad_align: 4,
            description: "RealESRGAN x4 anime-optimized model (6-block variant, 17.9 MB)".into(),
            is_fp16: false,
        },
        ModelEntry {
            name: "RealESRGAN_x4plus".into(),
            filename: "RealESRGAN_x4plus.onnx".into(),
            url: None,
            sha256: None,
            scale: Some(4),
            normalization_range: (0.0, 255.0),
            pad_align: 4,
            description: "RealESRGAN x4 general-purpose model (23-block RRDB)".into(),
            is_fp16: false,
        },
        ModelEntry {
            name: "realesr-general-x4v3".into(),
            filename: "realesr-general-x4v3.onnx".into(),
            url: None,
            sha256: None,
            scale: Some(4),
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "Real-ESRGAN general x4 v3, small Compact architecture".into(),
            is_fp16: false,
        },
        ModelEntry {
            name: "AnimeJaNai_V3_L1_Sharp_HD_x2_FP16".into(),
            filename: "the_database_AnimeJaNaiV3L1_sharp_HD_x2_fp16_op17.onnx".into(),
            url: None,
            sha256: None,
            scale: Some(2),
            normalization_range: (0.0, 1.0),
            pad_align: 4,
            description: "AnimeJaNai V3 L1 Sharp HD 2x FP16, Compact architecture for anime".into(),
            is_fp16: true,
        },
    ]
}

pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: Vec<ModelEntry>,
}

impl ModelRegistry {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: Vec::new(),
        }
    }

    pub fn with_builtin_models(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            entries: builtin_catalog(),
        }
    }

    /// Builtin catalog plus whatever `.onnx` files sit in `models_dir`. A
    /// directory that cannot be scanned leaves the builtin catalog.
    pub fn load(models_dir: PathBuf) -> Self {
        let mut registry = Self::with_builtin_models(models_dir);
        if let Err(err) = registry.discover() {
            warn!(error = %format!("{err:#}"), "Failed to scan models directory; using builtin catalog only");
        }
        registry
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Adds entries for `.onnx` files in the models directory that the catalog
    /// does not know about.
    pub fn discover(&mut self) -> Result<()> {
        let dir = &self.models_dir;
        if !dir.exists() {
            return Ok(());
        }

        let read_dir = fs::read_dir(dir)
            .with_context(|| format!("Failed to read models directory: {}", dir.display()))?;

        for entry in read_dir {
            let entry = entry?;
            let path = entry.path();

            let is_onnx = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("onnx"))
                .unwrap_or(false);
            if !is_onnx {
                continue;
            }

            let filename = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            if self.entries.iter().any(|e| e.filename == filename) {
                continue;
            }

            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&filename)
                .to_string();

            info!(filename = %filename, "Discovered unknown ONNX model");

            let lower = filename.to_lowercase();
            self.entries.push(ModelEntry {
                name,
                scale: scale_from_filename(&lower),
                is_fp16: lower.contains("fp16"),
                filename,
                url: None,
                sha256: None,
                normalization_range: (0.0, 1.0),
                pad_align: 4,
                description: "Discovered model (metadata unknown)".into(),
            });
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn is_downloaded(&self, name: &str) -> bool {
        self.get(name)
            .map(|e| self.models_dir.join(&e.filename).is_file())
            .unwrap_or(false)
    }

    pub fn model_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(|e| self.models_dir.join(&e.filename))
    }

    pub fn download(&self, name: &str) -> Result<PathBuf> {
        let entry = self
            .get(name)
            .with_context(|| format!("Unknown model: {name}"))?;

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!(
                "Failed to create models directory: {}",
                self.models_dir.display()
            )
        })?;

        let final_path = self.models_dir.join(&entry.filename);
        let tmp_path = self.models_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "Downloading model");

        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .context("Failed to build HTTP client for model download")?;

        let mut response = client
            .get(url)
            .send()
            .with_context(|| format!("Failed to start download for model {name}"))?;

        if !response.status().is_success() {
            bail!(
                "Download request for model {name} returned HTTP {}",
                response.status().as_u16()
            );
        }

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;

        let written = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("Failed while downloading model {name} from {url}"))
            .and_then(|_| {
                tmp_file
                    .sync_all()
                    .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected_hash) = &entry.sha256 {
            let actual_hash = sha256_file(&tmp_path)?;
            if !actual_hash.eq_ignore_ascii_case(expected_hash) {
                let _ = fs::remove_file(&tmp_path);
                bail!("SHA256 mismatch for {name}: expected {expected_hash}, got {actual_hash}");
            }
            info!(model = %name, "Hash verified OK");
        } else {
            warn!(model = %name, "No SHA256 hash configured, skipping verification");
        }

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to move {} to {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;

        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }
}

/// Picks `x2`/`x3`/`x4` (or `2x`...) out of a lowercase file name.
fn scale_from_filename(lower: &str) -> Option<u32> {
    lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find_map(|token| {
            let digits: String = if let Some(rest) = token.strip_prefix('x') {
                rest.chars().take_while(|c| c.is_ascii_digit()).collect()
            } else {
                token.strip_suffix('x')?.to_string()
            };
            match digits.parse::<u32>() {
                Ok(scale @ 1..=8) => Some(scale),
                _ => None,
            }
        })
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    let hash = hasher.finalize();
    Ok(format!("{hash:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_models_dir() -> PathBuf {
        std::env::temp_dir().join("models")
    }

    #[test]
    fn test_builtin_catalog_is_super_res_only() {
        let catalog = builtin_catalog();
        assert_eq!(catalog.len(), 4);
        assert!(catalog.iter().all(|e| e.scale.is_some()));
    }

    #[test]
    fn test_get_existing() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());

        let esrgan = reg.get("RealESRGAN_x4plus_anime_6B").unwrap();
        assert_eq!(esrgan.scale, Some(4));
        assert_eq!(esrgan.pad_align, 4);
        assert_eq!(esrgan.normalization_range, (0.0, 255.0));
        assert!(!esrgan.is_fp16);
        assert!(esrgan.url.is_some());

        let animejanai = reg.get("AnimeJaNai_V3_L1_Sharp_HD_x2_FP16").unwrap();
        assert_eq!(animejanai.scale, Some(2));
        assert!(animejanai.is_fp16);
        assert_eq!(animejanai.normalization_range, (0.0, 1.0));
    }

    #[test]
    fn test_get_missing() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());
        assert!(reg.get("NonExistentModel").is_none());
        assert!(reg.model_path("NonExistentModel").is_none());
    }

    #[test]
    fn test_model_path() {
        let reg = ModelRegistry::with_builtin_models(test_models_dir());
        assert_eq!(
            reg.model_path("RealESRGAN_x4plus"),
            Some(test_models_dir().join("RealESRGAN_x4plus.onnx"))
        );
    }

    #[test]
    fn test_is_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        assert!(!reg.is_downloaded("RealESRGAN_x4plus_anime_6B"));
        fs::write(
            dir.path().join("RealESRGAN_x4plus_anime_6B.onnx"),
            b"fake model data",
        )
        .unwrap();
        assert!(reg.is_downloaded("RealESRGAN_x4plus_anime_6B"));
    }

    #[test]
    fn test_discover_known_and_unknown_models() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("RealESRGAN_x4plus.onnx"), b"data").unwrap();
        fs::write(dir.path().join("4x_MyCustomModel_fp16.onnx"), b"data").unwrap();
        fs::write(dir.path().join("readme.txt"), b"hello").unwrap();

        let mut reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 5);

        let custom = reg.get("4x_MyCustomModel_fp16").unwrap();
        assert_eq!(custom.filename, "4x_MyCustomModel_fp16.onnx");
        assert_eq!(custom.scale, Some(4));
        assert!(custom.is_fp16);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let mut reg =
            ModelRegistry::with_builtin_models(PathBuf::from("/nonexistent/upscaler/models"));
        reg.discover().unwrap();
        assert_eq!(reg.list().len(), 4);
    }

    #[test]
    fn test_scale_from_filename() {
        assert_eq!(scale_from_filename("realesrgan_x2plus.onnx"), Some(2));
        assert_eq!(scale_from_filename("4x-ultrasharp.onnx"), Some(4));
        assert_eq!(scale_from_filename("denoise.onnx"), None);
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testfile.bin");
        fs::write(&path, b"hello world").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_download_no_url() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        let err = reg.download("RealESRGAN_x4plus").unwrap_err();
        assert!(
            err.to_string().contains("No download URL"),
            "Expected 'No download URL' error, got: {err}"
        );
    }

    #[test]
    fn test_download_unknown_model() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        let err = reg.download("NonExistentModel").unwrap_err();
        assert!(err.to_string().contains("Unknown model"));
    }

    #[test]
    #[ignore]
    fn test_download_real() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::with_builtin_models(dir.path().to_path_buf());
        let path = reg.download("RealESRGAN_x4plus_anime_6B").unwrap();
        let meta = fs::metadata(&path).unwrap();
        assert!(meta.len() > 1_000_000, "Downloaded file is too small");
    }
}
