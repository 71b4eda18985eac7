use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::metadata::Coordinates;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub map: MapConfig,

    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Number of labeled predictions to keep per photo.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    5
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Map center shown when no photo carries a location yet.
    #[serde(default = "default_center_lat")]
    pub default_center_lat: f64,

    #[serde(default = "default_center_lng")]
    pub default_center_lng: f64,
}

// London, matching the map collaborator's fallback view.
fn default_center_lat() -> f64 {
    51.505
}

fn default_center_lng() -> f64 {
    -0.09
}

impl MapConfig {
    pub fn default_center(&self) -> Coordinates {
        Coordinates {
            lat: self.default_center_lat,
            lng: self.default_center_lng,
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            default_center_lat: default_center_lat(),
            default_center_lng: default_center_lng(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Where downloaded model artifacts are cached.
    #[serde(default = "default_model_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_model_url")]
    pub model_url: String,

    #[serde(default = "default_labels_url")]
    pub labels_url: String,
}

fn default_model_cache_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("photomap")
        .join("models")
}

fn default_model_url() -> String {
    "https://github.com/onnx/models/raw/main/validated/vision/classification/mobilenet/model/mobilenetv2-12.onnx".to_string()
}

fn default_labels_url() -> String {
    "https://raw.githubusercontent.com/pytorch/hub/master/imagenet_classes.txt".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_model_cache_dir(),
            model_url: default_model_url(),
            labels_url: default_labels_url(),
        }
    }
}

impl Config {
    /// Load configuration: explicit path, else `PHOTOMAP_CONFIG`, else
    /// the platform config dir; missing file means defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path
            .or_else(|| std::env::var_os("PHOTOMAP_CONFIG").map(PathBuf::from))
            .unwrap_or_else(Self::config_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("photomap")
            .join("config.toml")
    }
}
