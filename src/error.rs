//! Error taxonomy for the processing pipeline.
//!
//! Every variant is recovered locally inside the stage that produced it:
//! the stage terminates in `Failed` with the error's message stored on the
//! record as a diagnostic. Nothing here propagates across stages or ids.

use thiserror::Error;

use crate::registry::PhotoId;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Metadata or image decode failed.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The classification model could not be loaded. Sticky: once the
    /// shared model load fails, every pending and future classification
    /// resolves with this variant.
    #[error("classification model unavailable: {0}")]
    ModelLoad(String),

    /// The classify call failed on a ready model.
    #[error("inference failed: {0}")]
    Inference(String),

    /// Operation referenced a removed or never-created photo id.
    #[error("unknown photo id {0}")]
    UnknownId(PhotoId),
}
