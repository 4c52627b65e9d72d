//! Portrait detection pipeline.
//!
//! Decides whether a single frame shows exactly one fully visible face:
//! one face region, at least one eye region and at least one mouth region
//! inside it. The numerical feature model behind each stage is pluggable
//! via [`FeatureClassifier`]; this crate owns preprocessing, candidate
//! grouping, and the accept/reject policy.

#![forbid(unsafe_code)]

pub mod classifier;
pub mod detector;
pub mod encode;
pub mod error;
pub mod frame;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod preprocess;
pub mod region;

pub use classifier::{ClassifierParams, FeatureClassifier};
pub use detector::{CascadeDetector, DetectionFailure, DetectionResult, FaceDetector};
pub use encode::encode_jpeg;
pub use error::DetectError;
pub use frame::Frame;
pub use preprocess::LumaPlane;
pub use region::Region;
