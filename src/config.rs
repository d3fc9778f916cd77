//! Configuration types: task/engine identity, inference knobs, runtime
//! placement policy, and the full detector configuration with validation.
//!
//! Defaults mirror `idet.h` exactly so that a freshly-`Default`-constructed
//! config behaves the same as the original library's out-of-the-box config.

use serde::{Deserialize, Serialize};

use crate::error::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Text,
    Face,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    DBNet,
    SCRFD,
}

impl EngineKind {
    /// Task each engine kind serves; `DetectorConfig::validate` enforces
    /// that `task` and `engine` agree.
    pub fn task(self) -> Task {
        match self {
            EngineKind::DBNet => Task::Text,
            EngineKind::SCRFD => Task::Face,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumaMemPolicy {
    Latency,
    Throughput,
    Strict,
}

/// `(rows, cols)` tiling grid; `1x1` means "no tiling".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridSpec {
    pub rows: u32,
    pub cols: u32,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self { rows: 1, cols: 1 }
    }
}

impl GridSpec {
    pub fn cells(&self) -> u64 {
        self.rows as u64 * self.cols as u64
    }
}

/// Per-inference knobs, mutable via `update_config` hot updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceOptions {
    pub apply_sigmoid: bool,
    pub bind_io: bool,
    pub bin_thresh: f32,
    pub box_thresh: f32,
    pub unclip: f32,
    pub max_img_size: i32,
    pub min_roi_size_w: i32,
    pub min_roi_size_h: i32,
    /// `(0, 0)` means "auto" (derive from `max_img_size`).
    pub fixed_input_dim: (i32, i32),
    pub tiles_dim: GridSpec,
    pub tile_overlap: f32,
    pub nms_iou: f32,
    pub use_fast_iou: bool,
    /// Open question in spec.md §9: exporters disagree on whether the
    /// SCRFD face-class score lives at channel 0 or channel 1 when the
    /// score tensor has more than one channel. Rather than hardcode a
    /// guess, this is configurable; `None` preserves the original's
    /// behavior (channel 1 when C>1, else channel 0).
    pub scrfd_score_channel: Option<usize>,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            apply_sigmoid: false,
            bind_io: false,
            bin_thresh: 0.3,
            box_thresh: 0.5,
            unclip: 1.0,
            max_img_size: 960,
            min_roi_size_w: 5,
            min_roi_size_h: 5,
            fixed_input_dim: (0, 0),
            tiles_dim: GridSpec::default(),
            tile_overlap: 0.1,
            nms_iou: 0.3,
            use_fast_iou: false,
            scrfd_score_channel: None,
        }
    }
}

/// Process-wide knobs: thread counts, CPU/NUMA placement. Immutable after
/// a `Detector` is constructed — see `IEngine::check_hot_update_` in the
/// original, whose rejection message is preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimePolicy {
    pub ort_intra_threads: i32,
    pub ort_inter_threads: i32,
    pub tile_omp_threads: i32,
    pub soft_mem_bind: bool,
    pub numa_mem_policy: NumaMemPolicy,
    pub suppress_opencv: bool,
}

impl Default for RuntimePolicy {
    fn default() -> Self {
        Self {
            ort_intra_threads: 1,
            ort_inter_threads: 1,
            tile_omp_threads: 1,
            soft_mem_bind: true,
            numa_mem_policy: NumaMemPolicy::Latency,
            suppress_opencv: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub task: Task,
    pub engine: EngineKind,
    pub infer: InferenceOptions,
    pub runtime: RuntimePolicy,
    pub model_path: String,
    pub verbose: bool,
}

impl DetectorConfig {
    /// Build a config for `task` with `model_path`, defaults otherwise.
    pub fn setup(task: Task, model_path: impl Into<String>) -> Self {
        let engine = match task {
            Task::Text => EngineKind::DBNet,
            Task::Face => EngineKind::SCRFD,
        };
        Self {
            task,
            engine,
            infer: InferenceOptions::default(),
            runtime: RuntimePolicy::default(),
            model_path: model_path.into(),
            verbose: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.task() != self.task {
            return Err(Status::invalid(
                "DetectorConfig: task and engine kind must agree (DBNet<->Text, SCRFD<->Face)",
            ));
        }
        if self.infer.bind_io {
            if self.infer.fixed_input_dim.0 <= 0 || self.infer.fixed_input_dim.1 <= 0 {
                return Err(Status::invalid(
                    "DetectorConfig: bind_io requires a positive fixed_input_dim",
                ));
            }
        }
        if !(0.0..1.0).contains(&self.infer.tile_overlap) {
            return Err(Status::invalid("DetectorConfig: tile_overlap must be in [0,1)"));
        }
        if self.infer.tiles_dim.rows < 1 || self.infer.tiles_dim.cols < 1 {
            return Err(Status::invalid("DetectorConfig: tiles_dim components must be >= 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_defaults_match_original() {
        let cfg = DetectorConfig::setup(Task::Text, "model.onnx");
        assert_eq!(cfg.engine, EngineKind::DBNet);
        assert_eq!(cfg.infer.bin_thresh, 0.3);
        assert_eq!(cfg.infer.box_thresh, 0.5);
        assert_eq!(cfg.infer.max_img_size, 960);
        assert_eq!(cfg.runtime.ort_intra_threads, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn mismatched_task_engine_rejected() {
        let mut cfg = DetectorConfig::setup(Task::Text, "m.onnx");
        cfg.engine = EngineKind::SCRFD;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bind_io_requires_fixed_dims() {
        let mut cfg = DetectorConfig::setup(Task::Face, "m.onnx");
        cfg.infer.bind_io = true;
        assert!(cfg.validate().is_err());
        cfg.infer.fixed_input_dim = (640, 640);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn tile_overlap_out_of_range_rejected() {
        let mut cfg = DetectorConfig::setup(Task::Text, "m.onnx");
        cfg.infer.tile_overlap = 1.0;
        assert!(cfg.validate().is_err());
    }
}
