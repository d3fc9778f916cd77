//! Polymorphic inference backend consumed by the `Detector` facade.
//!
//! Grounded on `original_source/src/lib/idet/engine/engine.h` /
//! `engine.cpp`; session-building idioms (execution providers, thread
//! counts, `GraphOptimizationLevel`) are carried from
//! `ferrules-core/src/layout/model.rs`'s `ORTLayoutParser::new`.

pub mod dbnet;
pub mod scrfd;

use std::sync::OnceLock;

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;

use crate::config::{DetectorConfig, EngineKind};
use crate::error::{Result, Status};
use crate::image::ImageView;
use crate::nms::Detection;

/// Every operation an engine exposes to the facade. Implemented by
/// [`dbnet::DBNet`] and [`scrfd::Scrfd`].
pub trait Engine: Send + Sync {
    fn kind(&self) -> EngineKind;
    fn task(&self) -> crate::config::Task {
        self.kind().task()
    }
    fn config(&self) -> &DetectorConfig;

    fn binding_ready(&self) -> bool;
    fn bound_w(&self) -> i32;
    fn bound_h(&self) -> i32;
    fn bound_contexts(&self) -> usize;

    /// Only `infer` (thresholds, tiling knobs) and `verbose` may change;
    /// task/engine/model_path/runtime are immutable (recreate required).
    fn update_hot(&mut self, next: &DetectorConfig) -> Result<()>;

    fn setup_binding(&mut self, w: i32, h: i32, contexts: usize) -> Result<()>;
    fn unset_binding(&mut self);

    fn infer_unbound(&self, bgr: ImageView) -> Result<Vec<Detection>>;
    fn infer_bound(&self, bgr: ImageView, ctx_idx: usize) -> Result<Vec<Detection>>;
}

/// Process-wide ORT environment is a singleton: the first engine that
/// initializes it picks the log identifier; later engines silently reuse
/// it, exactly like `IEngine::global_env_` in the original.
static ORT_ENV_INIT: OnceLock<()> = OnceLock::new();

pub(crate) fn global_env_init(log_id: &str) -> Result<()> {
    ORT_ENV_INIT.get_or_init(|| {
        if let Err(e) = ort::init().with_name(log_id).commit() {
            tracing::warn!("ORT global environment init failed (may already be committed): {e}");
        }
    });
    Ok(())
}

/// Validate that a proposed config differs only in mutable fields from
/// `current`. Mirrors `IEngine::check_hot_update_`'s rejection message,
/// which spec.md §8 scenario 5 requires verbatim.
pub(crate) fn check_hot_update(current: &DetectorConfig, next: &DetectorConfig) -> Result<()> {
    if next.task != current.task {
        return Err(Status::invalid("update_hot: task cannot change"));
    }
    if next.engine != current.engine {
        return Err(Status::invalid("update_hot: engine cannot change"));
    }
    if next.model_path != current.model_path {
        return Err(Status::invalid("update_hot: model_path cannot change"));
    }
    if next.runtime != current.runtime {
        return Err(Status::invalid("update_hot: runtime cannot change (recreate detector)"));
    }
    Ok(())
}

/// Build an ORT session from `cfg`, applying graph optimization, arena,
/// mem-pattern, and thread-count session options.
pub(crate) fn create_session(cfg: &DetectorConfig) -> Result<Session> {
    global_env_init(match cfg.engine {
        EngineKind::DBNet => "idet-dbnet",
        EngineKind::SCRFD => "idet-scrfd",
    })?;

    let mut builder: SessionBuilder = Session::builder()
        .map_err(|e| Status::internal(format!("create_session: builder: {e}")))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| Status::internal(format!("create_session: opt level: {e}")))?;

    if cfg.runtime.ort_intra_threads > 0 {
        builder = builder
            .with_intra_threads(cfg.runtime.ort_intra_threads as usize)
            .map_err(|e| Status::internal(format!("create_session: intra threads: {e}")))?;
    }
    if cfg.runtime.ort_inter_threads > 0 {
        builder = builder
            .with_inter_threads(cfg.runtime.ort_inter_threads as usize)
            .map_err(|e| Status::internal(format!("create_session: inter threads: {e}")))?;
    }

    if cfg.model_path.is_empty() {
        return Err(Status::invalid("create_session: empty model path and no embedded model provided"));
    }

    builder
        .commit_from_file(&cfg.model_path)
        .map_err(|e| Status::internal(format!("create_session: commit_from_file: {e}")))
}

/// Returns the engine's probe/bound output shapes clamped for safe
/// allocation; pulled out of `create_session` so both engines share it.
pub(crate) fn align32(v: i32) -> i32 {
    if v <= 1 {
        32
    } else {
        (v + 31) / 32 * 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DetectorConfig, RuntimePolicy, Task};

    #[test]
    fn hot_update_rejects_runtime_change() {
        let mut a = DetectorConfig::setup(Task::Text, "m.onnx");
        a.runtime.ort_intra_threads = 2;
        let mut b = a.clone();
        b.runtime.ort_intra_threads = 4;
        let err = check_hot_update(&a, &b).unwrap_err();
        assert!(err.message.contains("runtime cannot change (recreate detector)"));
    }

    #[test]
    fn hot_update_accepts_infer_option_change() {
        let a = DetectorConfig::setup(Task::Text, "m.onnx");
        let mut b = a.clone();
        b.infer.box_thresh = 0.9;
        assert!(check_hot_update(&a, &b).is_ok());
    }

    #[test]
    fn hot_update_rejects_model_path_change() {
        let a = DetectorConfig::setup(Task::Text, "m.onnx");
        let mut b = a.clone();
        b.model_path = "other.onnx".into();
        assert!(check_hot_update(&a, &b).is_err());
    }

    #[test]
    fn align32_rounds_up() {
        assert_eq!(align32(1), 32);
        assert_eq!(align32(33), 64);
        assert_eq!(align32(64), 64);
    }

    #[allow(dead_code)]
    fn _runtime_policy_default_sanity() {
        let _ = RuntimePolicy::default();
    }
}
