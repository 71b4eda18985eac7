//! Photo processing pipeline: takes raw photo bytes through EXIF metadata
//! extraction and on-device content classification, merges results into a
//! canonical per-photo record, and keeps a map-ready view of photos with
//! valid GPS coordinates current as results arrive out of order.

pub mod classify;
pub mod config;
pub mod error;
pub mod logging;
pub mod mapview;
pub mod metadata;
pub mod pipeline;
pub mod registry;

pub use classify::{ClassifyPhase, ClassifyStage, Classifier, ModelLoader, ModelPhase, ModelService};
pub use config::Config;
pub use error::PipelineError;
pub use mapview::{BoundingBox, MapView};
pub use metadata::{
    Coordinates, ExifDecoder, Heading, MetadataDecoder, MetadataResult, MetadataStage, RawMetadata,
};
pub use pipeline::PhotoPipeline;
pub use registry::{
    ChangedField, PhotoId, PhotoRecord, PhotoRegistry, Prediction, RegistryEvent, Stage,
    StageState,
};
