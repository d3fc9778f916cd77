//! `idet`: an embeddable CPU image-detection library covering text-region
//! detection (DBNet) and face detection (SCRFD) over ONNX Runtime.
//!
//! See `DESIGN.md` for how each module is grounded and which crates back
//! it.

pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod image;
pub mod nms;
pub mod placement;
pub mod tensor;
pub mod tiling;

pub use config::{DetectorConfig, EngineKind, GridSpec, InferenceOptions, NumaMemPolicy, RuntimePolicy, Task};
pub use detector::{Detector, Region};
pub use error::{Code, Result, Status};
pub use image::{load_image, Image, ImageView, PixelFormat};
pub use placement::apply_runtime_policy;
