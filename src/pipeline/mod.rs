//! Coordination glue: wires the registry, both stages, and the map view
//! together, and fans each intake out to the stage tasks.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::classify::{ClassifyStage, ModelLoader, ModelService, OnnxModelLoader};
use crate::config::Config;
use crate::mapview::MapView;
use crate::metadata::{ExifDecoder, MetadataDecoder, MetadataStage};
use crate::registry::{PhotoId, PhotoRegistry, RegistryEvent};

/// The assembled photo processing pipeline.
///
/// Must be created inside a tokio runtime; construction spawns the map
/// view's reactive update task, and every intake spawns the two stage
/// tasks for that photo.
pub struct PhotoPipeline {
    registry: Arc<PhotoRegistry>,
    metadata: Arc<MetadataStage>,
    classify: Arc<ClassifyStage>,
    map_view: Arc<MapView>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
    view_task: JoinHandle<()>,
}

impl PhotoPipeline {
    /// Assemble the pipeline with explicit collaborators.
    pub fn new(
        config: &Config,
        decoder: Arc<dyn MetadataDecoder>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        let registry = Arc::new(PhotoRegistry::new());
        let metadata = Arc::new(MetadataStage::new(registry.clone(), decoder));
        let model = Arc::new(ModelService::new(loader));
        let classify = Arc::new(ClassifyStage::new(
            registry.clone(),
            model,
            config.classifier.top_k,
        ));
        let map_view = Arc::new(MapView::new(registry.clone(), config.map.default_center()));
        let view_task = map_view.spawn();

        Self {
            registry,
            metadata,
            classify,
            map_view,
            inflight: Mutex::new(Vec::new()),
            view_task,
        }
    }

    /// Assemble with the default collaborators: EXIF metadata decoding
    /// and the ONNX classifier configured in `config.model`.
    pub fn with_defaults(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(ExifDecoder::new()),
            Arc::new(OnnxModelLoader::new(config.model.clone())),
        )
    }

    /// Take in a photo and kick off both processing stages. Returns the
    /// assigned id immediately; stage work runs in the background.
    pub fn intake(&self, image_bytes: Vec<u8>, display_name: impl Into<String>) -> PhotoId {
        let id = self.registry.intake(image_bytes, display_name);

        let metadata = self.metadata.clone();
        let metadata_task = tokio::spawn(async move { metadata.process(id).await });
        let classify = self.classify.clone();
        let classify_task = tokio::spawn(async move { classify.process(id).await });

        let mut inflight = self.lock_inflight();
        inflight.retain(|handle| !handle.is_finished());
        inflight.push(metadata_task);
        inflight.push(classify_task);

        id
    }

    /// Remove a photo. In-flight stage results for it will be dropped.
    pub fn remove(&self, id: PhotoId) -> bool {
        let removed = self.registry.remove(id);
        self.classify.forget(id);
        removed
    }

    /// Await all outstanding stage work and bring the derived view up to
    /// date. Intended for shutdown and tests; normal operation never
    /// needs to block on the stages.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = self.lock_inflight().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "stage task panicked");
            }
        }
        // Stage merges are settled; fold them into the view without
        // racing its event task.
        self.map_view.resync();
    }

    pub fn registry(&self) -> &Arc<PhotoRegistry> {
        &self.registry
    }

    pub fn map_view(&self) -> &Arc<MapView> {
        &self.map_view
    }

    /// Change notifications for UI subscribers.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for PhotoPipeline {
    fn drop(&mut self) {
        self.view_task.abort();
    }
}
