//! ONNX-backed image classifier using a MobileNetV2 ImageNet model.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use ndarray::Array1;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::{Classifier, ModelLoader};
use crate::config::ModelConfig;
use crate::registry::Prediction;

const INPUT_SIZE: u32 = 224;

/// Loads the ONNX classifier from the configured cache directory,
/// downloading model and label artifacts on first use.
pub struct OnnxModelLoader {
    config: ModelConfig,
}

impl OnnxModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self) -> Result<Arc<dyn Classifier>> {
        let model_path = ensure_artifact(
            &self.config.cache_dir,
            "classifier.onnx",
            &self.config.model_url,
        )?;
        let labels_path = ensure_artifact(
            &self.config.cache_dir,
            "labels.txt",
            &self.config.labels_url,
        )?;

        let labels = load_labels(&labels_path)?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;

        Ok(Arc::new(OnnxClassifier {
            session: Mutex::new(session),
            labels,
        }))
    }
}

/// A ready ONNX session plus its label vocabulary.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    labels: Vec<String>,
}

impl Classifier for OnnxClassifier {
    fn classify(&self, image: &DynamicImage, top_k: usize) -> Result<Vec<Prediction>> {
        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("failed to lock model session: {}", e))?;

        // Resize to model input size and normalize with ImageNet stats
        let resized =
            image.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();

        let mean = [0.485, 0.456, 0.406];
        let std = [0.229, 0.224, 0.225];

        // NCHW layout
        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut input_data = vec![0.0f32; 3 * plane];
        for y in 0..INPUT_SIZE as usize {
            for x in 0..INPUT_SIZE as usize {
                let pixel = rgb.get_pixel(x as u32, y as u32);
                let idx = y * INPUT_SIZE as usize + x;

                input_data[idx] = ((pixel[0] as f32 / 255.0) - mean[0]) / std[0];
                input_data[plane + idx] = ((pixel[1] as f32 / 255.0) - mean[1]) / std[1];
                input_data[2 * plane + idx] = ((pixel[2] as f32 / 255.0) - mean[2]) / std[2];
            }
        }

        let input_tensor = Tensor::from_array((
            [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
            input_data.into_boxed_slice(),
        ))?;

        let outputs = session.run(ort::inputs!["input" => input_tensor])?;

        let logits_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("model produced no output"))?;
        let (_shape, logits) = logits_output.1.try_extract_tensor::<f32>()?;

        let confidences = softmax(logits);

        let mut predictions: Vec<Prediction> = confidences
            .iter()
            .enumerate()
            .map(|(i, &confidence)| Prediction {
                label: self
                    .labels
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("class {}", i)),
                confidence,
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions.truncate(top_k);
        Ok(predictions)
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let values = Array1::from_iter(logits.iter().copied());
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp = values.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    if sum > 0.0 {
        (exp / sum).to_vec()
    } else {
        vec![0.0; logits.len()]
    }
}

fn load_labels(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading labels from {}", path.display()))?;
    Ok(content
        .lines()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// Download an artifact into the cache directory if it isn't there yet.
fn ensure_artifact(cache_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("creating model cache dir {}", cache_dir.display()))?;
    let artifact_path = cache_dir.join(filename);

    if !artifact_path.exists() {
        tracing::info!(artifact = %filename, "downloading model artifact...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("failed to download {}: {}", filename, e))?;

        let mut file = std::fs::File::create(&artifact_path)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        tracing::info!(artifact = %filename, path = ?artifact_path, "model artifact downloaded");
    }

    Ok(artifact_path)
}
