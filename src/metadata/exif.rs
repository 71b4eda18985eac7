use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;

use super::{MetadataDecoder, RawMetadata};

/// EXIF datetime fields use this layout, no timezone.
const EXIF_DATETIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

/// Default metadata decoder, backed by kamadak-exif.
#[derive(Debug, Default)]
pub struct ExifDecoder;

impl ExifDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl MetadataDecoder for ExifDecoder {
    fn extract(&self, image_bytes: &[u8]) -> Result<RawMetadata> {
        let mut reader = Cursor::new(image_bytes);
        let exif = exif::Reader::new()
            .read_from_container(&mut reader)
            .map_err(|e| anyhow!("no readable EXIF container: {}", e))?;

        let mut raw = RawMetadata::default();

        // Camera make/model
        if let Some(field) = exif.get_field(exif::Tag::Make, exif::In::PRIMARY) {
            raw.camera_make = Some(display_string(field));
        }
        if let Some(field) = exif.get_field(exif::Tag::Model, exif::In::PRIMARY) {
            raw.camera_model = Some(display_string(field));
        }

        // Timestamp candidates, in normalization precedence order
        raw.captured = datetime_field(&exif, exif::Tag::DateTimeOriginal);
        raw.modified = datetime_field(&exif, exif::Tag::DateTime);
        raw.created = datetime_field(&exif, exif::Tag::DateTimeDigitized);

        // Explicit heading, with orientation tag as fallback material
        if let Some(field) = exif.get_field(exif::Tag::GPSImgDirection, exif::In::PRIMARY) {
            if let exif::Value::Rational(ref v) = field.value {
                if let Some(r) = v.first().filter(|r| r.denom != 0) {
                    raw.heading_degrees = Some(r.num as f64 / r.denom as f64);
                }
            }
        }
        if let Some(field) = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY) {
            if let exif::Value::Short(ref v) = field.value {
                raw.orientation = v.first().map(|&o| o as u32);
            }
        }

        // GPS coordinates: all four fields must be present for a fix
        if let (Some(lat_field), Some(lat_ref), Some(lon_field), Some(lon_ref)) = (
            exif.get_field(exif::Tag::GPSLatitude, exif::In::PRIMARY),
            exif.get_field(exif::Tag::GPSLatitudeRef, exif::In::PRIMARY),
            exif.get_field(exif::Tag::GPSLongitude, exif::In::PRIMARY),
            exif.get_field(exif::Tag::GPSLongitudeRef, exif::In::PRIMARY),
        ) {
            if let (exif::Value::Rational(lat_vals), exif::Value::Rational(lon_vals)) =
                (&lat_field.value, &lon_field.value)
            {
                if lat_vals.len() >= 3 && lon_vals.len() >= 3 {
                    let lat = dms_to_decimal(
                        lat_vals[0].to_f64(),
                        lat_vals[1].to_f64(),
                        lat_vals[2].to_f64(),
                    );
                    let lon = dms_to_decimal(
                        lon_vals[0].to_f64(),
                        lon_vals[1].to_f64(),
                        lon_vals[2].to_f64(),
                    );

                    let lat_ref_str = lat_ref.display_value().to_string();
                    let lon_ref_str = lon_ref.display_value().to_string();

                    raw.latitude = Some(if lat_ref_str.contains('S') { -lat } else { lat });
                    raw.longitude = Some(if lon_ref_str.contains('W') { -lon } else { lon });
                }
            }
        }

        // Carry every decoded tag through uninterpreted
        let mut tags = BTreeMap::new();
        for field in exif.fields() {
            tags.insert(field.tag.to_string(), field.display_value().to_string());
        }
        raw.raw_tags = tags;

        Ok(raw)
    }
}

fn display_string(field: &exif::Field) -> String {
    field
        .display_value()
        .to_string()
        .trim_matches('"')
        .to_string()
}

fn datetime_field(exif: &exif::Exif, tag: exif::Tag) -> Option<NaiveDateTime> {
    let field = exif.get_field(tag, exif::In::PRIMARY)?;
    let text = display_string(field);
    NaiveDateTime::parse_from_str(&text, EXIF_DATETIME_FORMAT).ok()
}

fn dms_to_decimal(degrees: f64, minutes: f64, seconds: f64) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}
