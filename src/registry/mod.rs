//! Photo registry: the single source of truth for photo identity and the
//! only mutation authority for photo records.
//!
//! Each stage reports back through the registry's merge entry points,
//! never by writing record fields directly. Merges for an already-settled
//! stage are rejected (logged, not overwritten), which gives at-most-once
//! completion per (id, stage) even when completions interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::PipelineError;
use crate::metadata::MetadataResult;

/// Unique identifier for a photo record. Assigned once at intake,
/// strictly increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PhotoId(u64);

impl fmt::Display for PhotoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "photo-{}", self.0)
    }
}

/// The two independent processing stages applied to every photo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Classification,
}

impl Stage {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Metadata => "metadata",
            Stage::Classification => "classification",
        }
    }
}

/// Per-stage processing status. Transitions are monotonic:
/// `Pending -> InProgress -> Done | Failed`, and the terminal states are
/// never left, even if the stage is re-triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    Pending,
    InProgress,
    Done,
    /// Terminal failure; the payload is the diagnostic message.
    Failed(String),
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageState::Done | StageState::Failed(_))
    }
}

/// One labeled prediction from the classification model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub label: String,
    /// Clamped to [0, 1] before merge.
    pub confidence: f32,
}

/// The canonical photo entity.
#[derive(Debug, Clone)]
pub struct PhotoRecord {
    pub id: PhotoId,
    /// Raw image data, owned by the record and never mutated after intake.
    pub image_bytes: Arc<[u8]>,
    pub display_name: String,
    pub metadata: Option<MetadataResult>,
    /// Ordered descending by confidence, at most top-K entries.
    pub classification: Option<Vec<Prediction>>,
    pub metadata_state: StageState,
    pub classification_state: StageState,
}

impl PhotoRecord {
    /// A record is map-ready iff its metadata carries coordinates and
    /// both components are finite numbers.
    pub fn is_map_ready(&self) -> bool {
        self.metadata
            .as_ref()
            .filter(|m| m.has_location)
            .and_then(|m| m.coordinates.as_ref())
            .map(|c| c.lat.is_finite() && c.lng.is_finite())
            .unwrap_or(false)
    }

    fn stage_state(&self, stage: Stage) -> &StageState {
        match stage {
            Stage::Metadata => &self.metadata_state,
            Stage::Classification => &self.classification_state,
        }
    }

    fn stage_state_mut(&mut self, stage: Stage) -> &mut StageState {
        match stage {
            Stage::Metadata => &mut self.metadata_state,
            Stage::Classification => &mut self.classification_state,
        }
    }
}

/// Which record field a merge wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangedField {
    Metadata,
    Classification,
}

/// Change notification emitted to downstream subscribers (map view, UI).
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A stage result was merged into the record.
    Merged { id: PhotoId, field: ChangedField },
    /// The record was removed; late stage results for it will be dropped.
    Removed { id: PhotoId },
}

struct RegistryInner {
    photos: HashMap<PhotoId, PhotoRecord>,
    /// Intake order, for `list_all` iteration.
    order: Vec<PhotoId>,
    next_id: u64,
}

/// Owns the id -> record mapping and serializes all mutation.
pub struct PhotoRegistry {
    inner: Mutex<RegistryInner>,
    events: broadcast::Sender<RegistryEvent>,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

impl PhotoRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(RegistryInner {
                photos: HashMap::new(),
                order: Vec::new(),
                next_id: 1,
            }),
            events,
        }
    }

    /// Subscribe to change notifications. Every successful merge and
    /// every removal is broadcast.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Create a record with both stages `Pending` and return its id.
    /// Never blocks on stage work.
    pub fn intake(&self, image_bytes: impl Into<Arc<[u8]>>, display_name: impl Into<String>) -> PhotoId {
        let mut inner = self.lock();
        let id = PhotoId(inner.next_id);
        inner.next_id += 1;

        let record = PhotoRecord {
            id,
            image_bytes: image_bytes.into(),
            display_name: display_name.into(),
            metadata: None,
            classification: None,
            metadata_state: StageState::Pending,
            classification_state: StageState::Pending,
        };
        inner.photos.insert(id, record);
        inner.order.push(id);

        tracing::debug!(id = %id, "photo intake");
        id
    }

    pub fn get(&self, id: PhotoId) -> Option<PhotoRecord> {
        self.lock().photos.get(&id).cloned()
    }

    pub fn contains(&self, id: PhotoId) -> bool {
        self.lock().photos.contains_key(&id)
    }

    /// Image bytes for a stage to work on; `None` if the record is gone.
    pub fn image_bytes(&self, id: PhotoId) -> Option<Arc<[u8]>> {
        self.lock().photos.get(&id).map(|r| r.image_bytes.clone())
    }

    /// All records in intake order, regardless of completion order.
    pub fn list_all(&self) -> Vec<PhotoRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.photos.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().photos.is_empty()
    }

    /// Atomically claim a stage for processing: `Pending -> InProgress`.
    ///
    /// Returns false for an unknown id or when the stage has already been
    /// claimed or settled. This is the idempotency gate: the surrounding
    /// system may re-trigger a stage whenever anything about the record
    /// changes, and redundant triggers must be distinguished from fresh
    /// work purely by id and stage state.
    pub fn begin_stage(&self, id: PhotoId, stage: Stage) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.photos.get_mut(&id) else {
            tracing::warn!(
                error = %PipelineError::UnknownId(id),
                stage = stage.name(),
                "stage claim rejected"
            );
            return false;
        };
        match record.stage_state(stage) {
            StageState::Pending => {
                *record.stage_state_mut(stage) = StageState::InProgress;
                true
            }
            state => {
                tracing::debug!(
                    id = %id,
                    stage = stage.name(),
                    state = ?state,
                    "redundant stage trigger ignored"
                );
                false
            }
        }
    }

    /// Merge a completed metadata extraction into the record.
    ///
    /// Fails silently (logged) if the record was removed while the stage
    /// was in flight, or if the stage is already settled.
    pub fn merge_metadata(&self, id: PhotoId, result: MetadataResult) {
        self.merge(id, Stage::Metadata, ChangedField::Metadata, |record| {
            record.metadata = Some(result);
            StageState::Done
        });
    }

    /// Merge a completed classification into the record.
    pub fn merge_classification(&self, id: PhotoId, result: Vec<Prediction>) {
        self.merge(
            id,
            Stage::Classification,
            ChangedField::Classification,
            |record| {
                record.classification = Some(result);
                StageState::Done
            },
        );
    }

    /// Record a metadata stage failure. The record's metadata is set to a
    /// sentinel with `has_location = false` and the failure message, so
    /// downstream consumers see a success-shaped value.
    pub fn fail_metadata(&self, id: PhotoId, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(id = %id, reason = %reason, "metadata stage failed");
        self.merge(id, Stage::Metadata, ChangedField::Metadata, |record| {
            record.metadata = Some(MetadataResult::failure(&reason));
            StageState::Failed(reason)
        });
    }

    /// Record a classification stage failure. `classification` stays
    /// `None`; the reason is retained on the stage state for diagnostics.
    pub fn fail_classification(&self, id: PhotoId, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(id = %id, reason = %reason, "classification stage failed");
        self.merge(
            id,
            Stage::Classification,
            ChangedField::Classification,
            |_record| StageState::Failed(reason),
        );
    }

    /// Remove a record. Outstanding stage completions for it become
    /// no-ops; a late result never resurrects the record.
    pub fn remove(&self, id: PhotoId) -> bool {
        let removed = {
            let mut inner = self.lock();
            inner.order.retain(|other| *other != id);
            inner.photos.remove(&id).is_some()
        };
        if removed {
            tracing::debug!(id = %id, "photo removed");
            let _ = self.events.send(RegistryEvent::Removed { id });
        }
        removed
    }

    /// Shared settle path for merges and failures: checks liveness and
    /// stage terminality, applies the write, emits the notification.
    fn merge<F>(&self, id: PhotoId, stage: Stage, field: ChangedField, write: F)
    where
        F: FnOnce(&mut PhotoRecord) -> StageState,
    {
        let merged = {
            let mut inner = self.lock();
            let Some(record) = inner.photos.get_mut(&id) else {
                tracing::info!(
                    error = %PipelineError::UnknownId(id),
                    stage = stage.name(),
                    "late stage result for removed photo dropped"
                );
                return;
            };
            if record.stage_state(stage).is_terminal() {
                tracing::info!(
                    id = %id,
                    stage = stage.name(),
                    "stage already settled, merge rejected"
                );
                return;
            }
            let state = write(record);
            *record.stage_state_mut(stage) = state;
            true
        };
        if merged {
            // Send fails only when nobody is subscribed, which is fine.
            let _ = self.events.send(RegistryEvent::Merged { id, field });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for PhotoRegistry {
    fn default() -> Self {
        Self::new()
    }
}
