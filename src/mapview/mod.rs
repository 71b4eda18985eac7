//! Map-ready view builder: the derived "photos with valid coordinates"
//! sequence used for map rendering, kept current reactively from
//! registry change notifications.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::metadata::Coordinates;
use crate::registry::{ChangedField, PhotoId, PhotoRecord, PhotoRegistry, RegistryEvent};

/// Geographic extent of the map-ready photos.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

/// Derived view over the registry, filtered to map-ready records.
pub struct MapView {
    registry: Arc<PhotoRegistry>,
    ready: Mutex<HashSet<PhotoId>>,
    default_center: Coordinates,
}

impl MapView {
    pub fn new(registry: Arc<PhotoRegistry>, default_center: Coordinates) -> Self {
        Self {
            registry,
            ready: Mutex::new(HashSet::new()),
            default_center,
        }
    }

    /// Start the reactive update task: every metadata merge re-evaluates
    /// that photo's map-readiness, removals drop it. Runs until the
    /// registry (and its event channel) is dropped.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let view = self.clone();
        let mut events = view.registry.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Merged { id, field }) => {
                        if field == ChangedField::Metadata {
                            view.reevaluate(id);
                        }
                    }
                    Ok(RegistryEvent::Removed { id }) => {
                        view.lock_ready().remove(&id);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "map view lagged behind registry, resyncing");
                        view.resync();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Map-ready records, intake order preserved.
    pub fn current_view(&self) -> Vec<PhotoRecord> {
        let ready = self.lock_ready();
        self.registry
            .list_all()
            .into_iter()
            .filter(|record| ready.contains(&record.id))
            .collect()
    }

    /// Arithmetic mean of all map-ready coordinates; the configured
    /// default center when the view is empty.
    pub fn centroid(&self) -> Coordinates {
        let coords = self.ready_coordinates();
        if coords.is_empty() {
            return self.default_center;
        }
        let n = coords.len() as f64;
        Coordinates {
            lat: coords.iter().map(|c| c.lat).sum::<f64>() / n,
            lng: coords.iter().map(|c| c.lng).sum::<f64>() / n,
        }
    }

    /// Extent of the map-ready photos. `None` below two records: a
    /// single point has no meaningful box.
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let coords = self.ready_coordinates();
        if coords.len() < 2 {
            return None;
        }
        let mut bbox = BoundingBox {
            south: f64::INFINITY,
            west: f64::INFINITY,
            north: f64::NEG_INFINITY,
            east: f64::NEG_INFINITY,
        };
        for c in &coords {
            bbox.south = bbox.south.min(c.lat);
            bbox.north = bbox.north.max(c.lat);
            bbox.west = bbox.west.min(c.lng);
            bbox.east = bbox.east.max(c.lng);
        }
        Some(bbox)
    }

    /// Re-check one photo against the map-ready invariant.
    fn reevaluate(&self, id: PhotoId) {
        let ready = self
            .registry
            .get(id)
            .map(|record| record.is_map_ready())
            .unwrap_or(false);
        let mut set = self.lock_ready();
        if ready {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    /// Rebuild the ready set from a full registry scan.
    pub(crate) fn resync(&self) {
        let fresh: HashSet<PhotoId> = self
            .registry
            .list_all()
            .iter()
            .filter(|record| record.is_map_ready())
            .map(|record| record.id)
            .collect();
        *self.lock_ready() = fresh;
    }

    fn ready_coordinates(&self) -> Vec<Coordinates> {
        self.current_view()
            .iter()
            .filter_map(|record| record.metadata.as_ref())
            .filter_map(|m| m.coordinates)
            .collect()
    }

    fn lock_ready(&self) -> std::sync::MutexGuard<'_, HashSet<PhotoId>> {
        match self.ready.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
