//! Metadata extraction stage: drives the metadata decoder and normalizes
//! its loosely-typed output into the fixed schema the rest of the
//! pipeline consumes.

mod exif;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::registry::{PhotoId, PhotoRegistry, Stage};

pub use exif::ExifDecoder;

/// Decoded GPS position, decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

/// Direction the photo was taken in: an explicit GPS heading when the
/// camera recorded one, otherwise the orientation tag rendered as a
/// descriptive string.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Heading {
    Degrees(f64),
    Description(String),
}

/// Normalized metadata for one photo. Immutable once merged.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataResult {
    /// True iff `coordinates` is present with finite lat/lng.
    pub has_location: bool,
    pub coordinates: Option<Coordinates>,
    pub captured_at: Option<NaiveDateTime>,
    pub heading: Option<Heading>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    /// All decoded tags, carried through uninterpreted.
    pub raw_tags: BTreeMap<String, String>,
    /// Human-readable note, set when extraction failed or found no data.
    pub message: Option<String>,
}

impl MetadataResult {
    /// Sentinel written when extraction fails: success-shaped, no
    /// location, reason preserved for presentation.
    pub fn failure(message: &str) -> Self {
        Self {
            message: Some(message.to_string()),
            ..Default::default()
        }
    }
}

/// Raw decoder output before normalization. Field presence and validity
/// are the decoder's problem; the normalization policy below decides
/// what counts.
#[derive(Debug, Clone, Default)]
pub struct RawMetadata {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Original capture time (EXIF DateTimeOriginal).
    pub captured: Option<NaiveDateTime>,
    /// Last-modified time (EXIF DateTime).
    pub modified: Option<NaiveDateTime>,
    /// Creation/digitization time (EXIF DateTimeDigitized).
    pub created: Option<NaiveDateTime>,
    /// Explicit heading in degrees (EXIF GPSImgDirection).
    pub heading_degrees: Option<f64>,
    /// Orientation tag code, fallback when no heading was recorded.
    pub orientation: Option<u32>,
    pub camera_make: Option<String>,
    pub camera_model: Option<String>,
    pub raw_tags: BTreeMap<String, String>,
}

/// External metadata decoder boundary.
pub trait MetadataDecoder: Send + Sync {
    fn extract(&self, image_bytes: &[u8]) -> anyhow::Result<RawMetadata>;
}

/// Apply the normalization policy to raw decoder output.
///
/// Coordinates are accepted only when both components are present and
/// finite; anything else yields `has_location = false` no matter what
/// other fields carry. Timestamp precedence: original capture, then
/// last-modified, then creation. Heading precedence: explicit heading,
/// then orientation rendered as text.
pub fn normalize(raw: RawMetadata) -> MetadataResult {
    let coordinates = match (raw.latitude, raw.longitude) {
        (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => {
            Some(Coordinates { lat, lng })
        }
        _ => None,
    };

    let heading = raw
        .heading_degrees
        .map(Heading::Degrees)
        .or_else(|| {
            raw.orientation
                .map(|code| Heading::Description(format!("Orientation: {}", code)))
        });

    MetadataResult {
        has_location: coordinates.is_some(),
        coordinates,
        captured_at: raw.captured.or(raw.modified).or(raw.created),
        heading,
        camera_make: raw.camera_make,
        camera_model: raw.camera_model,
        raw_tags: raw.raw_tags,
        message: None,
    }
}

/// Drives the decoder for one photo at a time and settles the result
/// through the registry.
pub struct MetadataStage {
    registry: Arc<PhotoRegistry>,
    decoder: Arc<dyn MetadataDecoder>,
}

impl MetadataStage {
    pub fn new(registry: Arc<PhotoRegistry>, decoder: Arc<dyn MetadataDecoder>) -> Self {
        Self { registry, decoder }
    }

    /// Run metadata extraction for one photo. Triggered once per id right
    /// after intake; re-invocation while in progress or after the stage
    /// settled is a no-op. Decode errors settle the stage as failed and
    /// never escape.
    pub async fn process(&self, id: PhotoId) {
        if !self.registry.begin_stage(id, Stage::Metadata) {
            return;
        }
        let Some(bytes) = self.registry.image_bytes(id) else {
            // Removed between the claim and here; nothing to settle.
            return;
        };

        let decoder = self.decoder.clone();
        let outcome =
            tokio::task::spawn_blocking(move || decoder.extract(&bytes)).await;

        match outcome {
            Ok(Ok(raw)) => {
                tracing::debug!(id = %id, "metadata extracted");
                self.registry.merge_metadata(id, normalize(raw));
            }
            Ok(Err(e)) => {
                self.registry
                    .fail_metadata(id, format!("decode failed: {}", e));
            }
            Err(e) => {
                self.registry
                    .fail_metadata(id, format!("metadata task failed: {}", e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 5, 1)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn finite_coordinates_become_location() {
        let result = normalize(RawMetadata {
            latitude: Some(48.8566),
            longitude: Some(2.3522),
            ..Default::default()
        });
        assert!(result.has_location);
        let coords = result.coordinates.unwrap();
        assert_eq!(coords.lat, 48.8566);
        assert_eq!(coords.lng, 2.3522);
    }

    #[test]
    fn non_finite_or_missing_coordinates_yield_no_location() {
        let cases = [
            (Some(f64::NAN), Some(2.0)),
            (Some(1.0), Some(f64::NAN)),
            (Some(f64::INFINITY), Some(2.0)),
            (Some(1.0), Some(f64::NEG_INFINITY)),
            (Some(1.0), None),
            (None, Some(2.0)),
            (None, None),
        ];
        for (lat, lng) in cases {
            let result = normalize(RawMetadata {
                latitude: lat,
                longitude: lng,
                camera_make: Some("Canon".into()),
                ..Default::default()
            });
            assert!(!result.has_location, "lat={lat:?} lng={lng:?}");
            assert!(result.coordinates.is_none());
            // Other fields still carry through.
            assert_eq!(result.camera_make.as_deref(), Some("Canon"));
        }
    }

    #[test]
    fn timestamp_precedence_original_then_modified_then_created() {
        let all = normalize(RawMetadata {
            captured: Some(at(1)),
            modified: Some(at(2)),
            created: Some(at(3)),
            ..Default::default()
        });
        assert_eq!(all.captured_at, Some(at(1)));

        let no_original = normalize(RawMetadata {
            modified: Some(at(2)),
            created: Some(at(3)),
            ..Default::default()
        });
        assert_eq!(no_original.captured_at, Some(at(2)));

        let created_only = normalize(RawMetadata {
            created: Some(at(3)),
            ..Default::default()
        });
        assert_eq!(created_only.captured_at, Some(at(3)));

        let none = normalize(RawMetadata::default());
        assert_eq!(none.captured_at, None);
    }

    #[test]
    fn heading_prefers_explicit_degrees_over_orientation() {
        let both = normalize(RawMetadata {
            heading_degrees: Some(271.5),
            orientation: Some(6),
            ..Default::default()
        });
        assert_eq!(both.heading, Some(Heading::Degrees(271.5)));

        let orientation_only = normalize(RawMetadata {
            orientation: Some(6),
            ..Default::default()
        });
        assert_eq!(
            orientation_only.heading,
            Some(Heading::Description("Orientation: 6".into()))
        );

        assert_eq!(normalize(RawMetadata::default()).heading, None);
    }

    #[test]
    fn failure_sentinel_has_no_location_and_a_message() {
        let sentinel = MetadataResult::failure("decode failed: truncated file");
        assert!(!sentinel.has_location);
        assert!(sentinel.coordinates.is_none());
        assert_eq!(
            sentinel.message.as_deref(),
            Some("decode failed: truncated file")
        );
    }
}
