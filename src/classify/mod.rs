//! Content classification stage.
//!
//! Two independent lifecycles meet here: the process-wide model service
//! (loaded lazily exactly once, shared read-only by every photo) and the
//! per-photo state machine that joins model readiness with image decode
//! before running a single classify call.

pub mod model;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use image::DynamicImage;
use tokio::sync::watch;

use crate::error::PipelineError;
use crate::registry::{PhotoId, PhotoRegistry, Prediction, Stage};

pub use model::{OnnxClassifier, OnnxModelLoader};

/// A ready classification model. Implementations must be callable from
/// the blocking pool.
pub trait Classifier: Send + Sync {
    /// Top-K labeled predictions for a decoded image, best first.
    fn classify(&self, image: &DynamicImage, top_k: usize) -> anyhow::Result<Vec<Prediction>>;
}

/// Loads the shared model. Invoked at most once per process; the result
/// (success or failure) is shared by all callers.
pub trait ModelLoader: Send + Sync {
    fn load(&self) -> anyhow::Result<Arc<dyn Classifier>>;
}

/// Lifecycle of the shared model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelPhase {
    Unloaded,
    Loading,
    Ready,
    /// Sticky: no load is auto-retried after a failure.
    LoadFailed(String),
}

/// State shared between the service handle and the in-flight load task.
struct ModelShared {
    phase: watch::Sender<ModelPhase>,
    classifier: Mutex<Option<Arc<dyn Classifier>>>,
}

impl ModelShared {
    fn lock_classifier(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn Classifier>>> {
        match self.classifier.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Process-wide shared model state. All classification requests go
/// through one instance of this; concurrent callers during `Loading`
/// await the same in-flight load instead of starting duplicates.
pub struct ModelService {
    loader: Arc<dyn ModelLoader>,
    shared: Arc<ModelShared>,
}

impl ModelService {
    pub fn new(loader: Arc<dyn ModelLoader>) -> Self {
        let (phase, _) = watch::channel(ModelPhase::Unloaded);
        Self {
            loader,
            shared: Arc::new(ModelShared {
                phase,
                classifier: Mutex::new(None),
            }),
        }
    }

    pub fn phase(&self) -> ModelPhase {
        self.shared.phase.borrow().clone()
    }

    /// Idempotent lazy load. The first caller claims the load; everyone
    /// else awaits its outcome. After `LoadFailed` every caller gets
    /// `PipelineError::ModelLoad` immediately.
    pub async fn ensure_loaded(&self) -> Result<Arc<dyn Classifier>, PipelineError> {
        loop {
            let phase = self.shared.phase.borrow().clone();
            match phase {
                ModelPhase::Ready => {
                    let classifier = self.shared.lock_classifier().clone();
                    return classifier.ok_or_else(|| {
                        PipelineError::ModelLoad("model marked ready but absent".to_string())
                    });
                }
                ModelPhase::LoadFailed(reason) => {
                    return Err(PipelineError::ModelLoad(reason));
                }
                ModelPhase::Loading => {
                    let mut rx = self.shared.phase.subscribe();
                    if rx
                        .wait_for(|p| !matches!(p, ModelPhase::Loading))
                        .await
                        .is_err()
                    {
                        return Err(PipelineError::ModelLoad(
                            "model service shut down".to_string(),
                        ));
                    }
                    // Loop back to read the settled phase.
                }
                ModelPhase::Unloaded => {
                    let claimed = self.shared.phase.send_if_modified(|p| {
                        if matches!(p, ModelPhase::Unloaded) {
                            *p = ModelPhase::Loading;
                            true
                        } else {
                            false
                        }
                    });
                    if !claimed {
                        continue;
                    }

                    tracing::info!("loading classification model");
                    // The blocking task settles the phase itself, so a
                    // dropped claimer cannot strand waiters in `Loading`.
                    let loader = self.loader.clone();
                    let shared = self.shared.clone();
                    let load_task = tokio::task::spawn_blocking(move || {
                        match loader.load() {
                            Ok(classifier) => {
                                *shared.lock_classifier() = Some(classifier.clone());
                                shared.phase.send_replace(ModelPhase::Ready);
                                tracing::info!("classification model ready");
                                Ok(classifier)
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                tracing::error!(error = %reason, "classification model load failed");
                                shared
                                    .phase
                                    .send_replace(ModelPhase::LoadFailed(reason.clone()));
                                Err(reason)
                            }
                        }
                    });
                    match load_task.await {
                        Ok(Ok(classifier)) => return Ok(classifier),
                        Ok(Err(reason)) => return Err(PipelineError::ModelLoad(reason)),
                        Err(e) => {
                            // Load task panicked before it could settle.
                            let reason = format!("model load task failed: {}", e);
                            tracing::error!(error = %reason, "classification model load failed");
                            self.shared.phase.send_if_modified(|p| {
                                if matches!(p, ModelPhase::Loading) {
                                    *p = ModelPhase::LoadFailed(reason.clone());
                                    true
                                } else {
                                    false
                                }
                            });
                            return Err(PipelineError::ModelLoad(reason));
                        }
                    }
                }
            }
        }
    }
}

/// Per-photo classification progress, observable for diagnostics/UI.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassifyPhase {
    /// Waiting on the model/image readiness join.
    AwaitingReadiness { model_ready: bool, image_ready: bool },
    Classifying,
    Done,
    Failed(String),
}

/// Drives classification for individual photos against the shared model.
pub struct ClassifyStage {
    registry: Arc<PhotoRegistry>,
    model: Arc<ModelService>,
    top_k: usize,
    phases: Mutex<HashMap<PhotoId, ClassifyPhase>>,
}

impl ClassifyStage {
    pub fn new(registry: Arc<PhotoRegistry>, model: Arc<ModelService>, top_k: usize) -> Self {
        Self {
            registry,
            model,
            top_k,
            phases: Mutex::new(HashMap::new()),
        }
    }

    /// Current per-photo phase, if classification was ever triggered.
    /// Phases for photos no longer in the registry are pruned here.
    pub fn phase(&self, id: PhotoId) -> Option<ClassifyPhase> {
        let mut phases = self.lock_phases();
        if !self.registry.contains(id) {
            phases.remove(&id);
            return None;
        }
        phases.get(&id).cloned()
    }

    /// Drop any tracked phase for a removed photo.
    pub fn forget(&self, id: PhotoId) {
        self.lock_phases().remove(&id);
    }

    /// Run classification for one photo.
    ///
    /// Idempotent by id and stage state: a repeat call while the stage is
    /// in progress or after it settled is a no-op, so the surrounding
    /// system may re-trigger freely on unrelated record changes. Model
    /// readiness and image decode are awaited as a join; whichever
    /// finishes last unblocks the actual classify call.
    pub async fn process(&self, id: PhotoId) {
        if !self.registry.begin_stage(id, Stage::Classification) {
            return;
        }
        let Some(bytes) = self.registry.image_bytes(id) else {
            return;
        };
        self.set_phase(
            id,
            ClassifyPhase::AwaitingReadiness {
                model_ready: false,
                image_ready: false,
            },
        );

        let model_fut = async {
            let result = self.model.ensure_loaded().await;
            if result.is_ok() {
                self.note_ready(id, ReadySignal::Model);
            }
            result
        };
        let image_fut = async {
            let result = match tokio::task::spawn_blocking(move || {
                image::load_from_memory(&bytes)
            })
            .await
            {
                Ok(Ok(img)) => Ok(img),
                Ok(Err(e)) => Err(PipelineError::Decode(format!("image decode failed: {}", e))),
                Err(e) => Err(PipelineError::Decode(format!("decode task failed: {}", e))),
            };
            if result.is_ok() {
                self.note_ready(id, ReadySignal::Image);
            }
            result
        };

        // Both readiness signals gate the one classify call; either may
        // fire first.
        let (model, image) = tokio::join!(model_fut, image_fut);

        let (classifier, image) = match (model, image) {
            (Ok(classifier), Ok(image)) => (classifier, image),
            (Err(e), _) => return self.fail(id, e),
            (_, Err(e)) => return self.fail(id, e),
        };

        self.set_phase(id, ClassifyPhase::Classifying);
        let top_k = self.top_k;
        let outcome =
            tokio::task::spawn_blocking(move || classifier.classify(&image, top_k)).await;

        match outcome {
            Ok(Ok(predictions)) => {
                let result = normalize_predictions(predictions, top_k);
                tracing::debug!(id = %id, labels = result.len(), "classification complete");
                self.settle_phase(id, ClassifyPhase::Done);
                self.registry.merge_classification(id, result);
            }
            Ok(Err(e)) => self.fail(id, PipelineError::Inference(e.to_string())),
            Err(e) => self.fail(
                id,
                PipelineError::Inference(format!("classify task failed: {}", e)),
            ),
        }
    }

    fn fail(&self, id: PhotoId, error: PipelineError) {
        let reason = error.to_string();
        self.settle_phase(id, ClassifyPhase::Failed(reason.clone()));
        self.registry.fail_classification(id, reason);
    }

    fn set_phase(&self, id: PhotoId, phase: ClassifyPhase) {
        self.lock_phases().insert(id, phase);
    }

    /// Record a terminal phase, unless the photo was removed mid-flight;
    /// then the entry is dropped so the map cannot accumulate ghosts.
    fn settle_phase(&self, id: PhotoId, phase: ClassifyPhase) {
        let mut phases = self.lock_phases();
        if self.registry.contains(id) {
            phases.insert(id, phase);
        } else {
            phases.remove(&id);
        }
    }

    fn note_ready(&self, id: PhotoId, signal: ReadySignal) {
        let mut phases = self.lock_phases();
        if let Some(ClassifyPhase::AwaitingReadiness {
            model_ready,
            image_ready,
        }) = phases.get_mut(&id)
        {
            match signal {
                ReadySignal::Model => *model_ready = true,
                ReadySignal::Image => *image_ready = true,
            }
        }
    }

    fn lock_phases(&self) -> std::sync::MutexGuard<'_, HashMap<PhotoId, ClassifyPhase>> {
        match self.phases.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

enum ReadySignal {
    Model,
    Image,
}

/// Apply the result contract: confidences clamped to [0, 1], ordered
/// descending with model output order breaking ties (stable sort), at
/// most `top_k` entries.
fn normalize_predictions(mut predictions: Vec<Prediction>, top_k: usize) -> Vec<Prediction> {
    for p in &mut predictions {
        p.confidence = p.confidence.clamp(0.0, 1.0);
    }
    predictions.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    predictions.truncate(top_k);
    predictions
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::registry::StageState;

    fn pred(label: &str, confidence: f32) -> Prediction {
        Prediction {
            label: label.to_string(),
            confidence,
        }
    }

    /// Classifier that counts invocations and returns a fixed list.
    struct CountingClassifier {
        calls: Arc<AtomicUsize>,
        output: Vec<Prediction>,
    }

    impl Classifier for CountingClassifier {
        fn classify(&self, _image: &DynamicImage, _top_k: usize) -> anyhow::Result<Vec<Prediction>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.output.clone())
        }
    }

    struct StubLoader {
        loads: Arc<AtomicUsize>,
        classify_calls: Arc<AtomicUsize>,
        output: Vec<Prediction>,
        delay: Duration,
        fail: bool,
    }

    impl StubLoader {
        fn new() -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                classify_calls: Arc::new(AtomicUsize::new(0)),
                output: vec![pred("tabby cat", 0.8), pred("dog", 0.1)],
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    impl ModelLoader for StubLoader {
        fn load(&self) -> anyhow::Result<Arc<dyn Classifier>> {
            std::thread::sleep(self.delay);
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("model file corrupt");
            }
            Ok(Arc::new(CountingClassifier {
                calls: self.classify_calls.clone(),
                output: self.output.clone(),
            }))
        }
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_pixel(4, 4, image::Rgb([120, 80, 40]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
            .expect("encode tiny png");
        buf
    }

    fn stage_with(loader: StubLoader) -> (Arc<ClassifyStage>, Arc<PhotoRegistry>) {
        let registry = Arc::new(PhotoRegistry::new());
        let model = Arc::new(ModelService::new(Arc::new(loader)));
        let stage = Arc::new(ClassifyStage::new(registry.clone(), model, 5));
        (stage, registry)
    }

    #[test]
    fn normalize_clamps_sorts_and_truncates() {
        let raw = vec![
            pred("a", 0.2),
            pred("b", 1.7),
            pred("c", -0.3),
            pred("d", 0.9),
            pred("e", 0.9),
            pred("f", 0.5),
        ];
        let out = normalize_predictions(raw, 5);

        assert_eq!(out.len(), 5);
        assert_eq!(out[0].label, "b");
        assert_eq!(out[0].confidence, 1.0);
        // Ties keep model output order (d before e).
        assert_eq!(out[1].label, "d");
        assert_eq!(out[2].label, "e");
        // "c" clamps to 0.0, sorts last, and falls to the top-5 cut.
        assert_eq!(out.last().unwrap().label, "a");
        assert_eq!(out.last().unwrap().confidence, 0.2);
        assert!(out.iter().all(|p| p.label != "c"));
    }

    #[test]
    fn normalize_returns_fewer_than_k_when_model_does() {
        let out = normalize_predictions(vec![pred("a", 0.4)], 5);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn double_trigger_runs_exactly_one_classify() {
        let loader = StubLoader::new();
        let calls = loader.classify_calls.clone();
        let (stage, registry) = stage_with(loader);
        let id = registry.intake(tiny_png(), "cat.png");

        tokio::join!(stage.process(id), stage.process(id));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = registry.get(id).unwrap();
        assert_eq!(record.classification_state, StageState::Done);
        assert_eq!(record.classification.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn join_completes_when_model_is_slower_than_decode() {
        let mut loader = StubLoader::new();
        loader.delay = Duration::from_millis(50);
        let (stage, registry) = stage_with(loader);
        let id = registry.intake(tiny_png(), "slow-model.png");

        stage.process(id).await;

        assert_eq!(stage.phase(id), Some(ClassifyPhase::Done));
        assert!(registry.get(id).unwrap().classification.is_some());
    }

    #[tokio::test]
    async fn join_completes_when_model_is_already_ready() {
        let loader = StubLoader::new();
        let (stage, registry) = stage_with(loader);

        // Warm the model with a first photo, then classify a second one.
        let warm = registry.intake(tiny_png(), "warm.png");
        stage.process(warm).await;

        let id = registry.intake(tiny_png(), "second.png");
        stage.process(id).await;

        assert_eq!(stage.phase(id), Some(ClassifyPhase::Done));
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_model_load() {
        let loader = StubLoader::new();
        let loads = loader.loads.clone();
        let (stage, registry) = stage_with(loader);
        let a = registry.intake(tiny_png(), "a.png");
        let b = registry.intake(tiny_png(), "b.png");
        let c = registry.intake(tiny_png(), "c.png");

        tokio::join!(stage.process(a), stage.process(b), stage.process(c));

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        for id in [a, b, c] {
            assert_eq!(
                registry.get(id).unwrap().classification_state,
                StageState::Done
            );
        }
    }

    #[tokio::test]
    async fn load_failure_is_sticky_and_fails_every_photo() {
        let mut loader = StubLoader::new();
        loader.fail = true;
        let loads = loader.loads.clone();
        let (stage, registry) = stage_with(loader);

        let a = registry.intake(tiny_png(), "a.png");
        stage.process(a).await;
        // A later photo must not retry the load.
        let b = registry.intake(tiny_png(), "b.png");
        stage.process(b).await;

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        for id in [a, b] {
            let record = registry.get(id).unwrap();
            assert!(record.classification.is_none());
            match &record.classification_state {
                StageState::Failed(reason) => {
                    assert!(reason.contains("model unavailable"), "reason: {reason}")
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn undecodable_image_fails_only_that_photo() {
        let loader = StubLoader::new();
        let (stage, registry) = stage_with(loader);

        let bad = registry.intake(b"not an image".to_vec(), "bad.bin");
        let good = registry.intake(tiny_png(), "good.png");
        tokio::join!(stage.process(bad), stage.process(good));

        assert!(matches!(
            registry.get(bad).unwrap().classification_state,
            StageState::Failed(_)
        ));
        assert_eq!(
            registry.get(good).unwrap().classification_state,
            StageState::Done
        );
    }

    #[tokio::test]
    async fn removal_mid_flight_drops_the_result() {
        let mut loader = StubLoader::new();
        loader.delay = Duration::from_millis(50);
        let calls = loader.classify_calls.clone();
        let (stage, registry) = stage_with(loader);
        let id = registry.intake(tiny_png(), "doomed.png");

        let removal = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(registry.remove(id));
        };
        tokio::join!(stage.process(id), removal);

        // The classify call may or may not have run, but the registry
        // must not have been resurrected and no phase lingers.
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
        assert!(stage.phase(id).is_none());
        let _ = calls;
    }

    #[tokio::test]
    async fn phase_is_dropped_once_the_photo_is_removed() {
        let loader = StubLoader::new();
        let (stage, registry) = stage_with(loader);
        let id = registry.intake(tiny_png(), "fleeting.png");

        stage.process(id).await;
        assert_eq!(stage.phase(id), Some(ClassifyPhase::Done));

        assert!(registry.remove(id));
        assert!(stage.phase(id).is_none());
        // And it stays gone on repeat queries.
        assert!(stage.phase(id).is_none());
    }

    #[tokio::test]
    async fn concurrent_ensure_loaded_awaits_one_inflight_load() {
        let mut loader = StubLoader::new();
        loader.delay = Duration::from_millis(30);
        let loads = loader.loads.clone();
        let service = Arc::new(ModelService::new(Arc::new(loader)));

        let (a, b) = tokio::join!(service.ensure_loaded(), service.ensure_loaded());
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(service.phase(), ModelPhase::Ready);
    }

    #[tokio::test]
    async fn cancelled_claimer_does_not_strand_waiters() {
        let mut loader = StubLoader::new();
        loader.delay = Duration::from_millis(30);
        let loads = loader.loads.clone();
        let service = Arc::new(ModelService::new(Arc::new(loader)));

        // First caller claims the load and is cancelled mid-flight.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(5),
            service.ensure_loaded(),
        )
        .await;
        assert!(cancelled.is_err());

        // The in-flight load still settles; a later caller observes it.
        let classifier = service.ensure_loaded().await;
        assert!(classifier.is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(service.phase(), ModelPhase::Ready);
    }
}
