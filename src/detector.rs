//! Public facade: constructs the right engine for a task, decides
//! tiled/bound dispatch, and applies NMS across all raw detections
//! (min-size filtering already happens per-engine, during decode).
//!
//! Grounded on `original_source/src/lib/idet/idet.h`'s `Detector` class and
//! `original_source/src/lib/idet/engine/engine.h`'s factory function.

use crate::config::{DetectorConfig, EngineKind};
use crate::engine::dbnet::DBNet;
use crate::engine::scrfd::Scrfd;
use crate::engine::Engine;
use crate::error::{Result, Status};
use crate::geometry::Quad;
use crate::image::ImageView;
use crate::nms::nms;
use crate::tiling::{infer_tiled, DispatchMode};

/// A detected region with its quad corners, in `[TL, TR, BR, BL]` order.
/// The score that drove NMS is intentionally dropped from the public
/// result, matching `idet::Detection` (score is an internal ranking
/// signal, not part of the facade's output contract).
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub pts: Quad,
}

enum Inner {
    DBNet(DBNet),
    Scrfd(Scrfd),
}

impl Inner {
    fn engine(&self) -> &dyn Engine {
        match self {
            Inner::DBNet(e) => e,
            Inner::Scrfd(e) => e,
        }
    }

    fn engine_mut(&mut self) -> &mut dyn Engine {
        match self {
            Inner::DBNet(e) => e,
            Inner::Scrfd(e) => e,
        }
    }
}

/// The original's `Detector` is move-only and treats use-after-move as a
/// logic error guarded by a runtime sentinel. Rust's ownership model
/// enforces the same contract at compile time instead: `Detector` derives
/// neither `Clone` nor `Copy`, so a moved-from binding cannot be named
/// again, and no runtime "moved" state is needed (see DESIGN.md).
pub struct Detector {
    inner: Inner,
}

impl Detector {
    /// Builds a detector matching `cfg.engine`, applying the process-wide
    /// placement policy first (spec.md §7: placement must happen before
    /// ORT session/thread-pool creation).
    pub fn new(cfg: DetectorConfig) -> Result<Self> {
        cfg.validate()?;
        crate::placement::apply_runtime_policy(&cfg.runtime, cfg.verbose)?;

        let inner = match cfg.engine {
            EngineKind::DBNet => Inner::DBNet(DBNet::new(cfg)?),
            EngineKind::SCRFD => Inner::Scrfd(Scrfd::new(cfg)?),
        };
        Ok(Self { inner })
    }

    pub fn config(&self) -> &DetectorConfig {
        self.inner.engine().config()
    }

    /// Hot-updates `infer`/`verbose`; rejects any other field change
    /// (exact message from `engine::check_hot_update`).
    pub fn update_config(&mut self, next: &DetectorConfig) -> Result<()> {
        self.inner.engine_mut().update_hot(next)
    }

    /// `contexts` is clamped to `>= 1` before being handed to the engine.
    pub fn prepare_binding(&mut self, w: i32, h: i32, contexts: usize) -> Result<()> {
        self.inner.engine_mut().setup_binding(w, h, contexts.max(1))
    }

    pub fn release_binding(&mut self) {
        self.inner.engine_mut().unset_binding();
    }

    pub fn binding_ready(&self) -> bool {
        self.inner.engine().binding_ready()
    }

    /// `nms` already degrades to "sort only" for `nms_iou <= 0` and to
    /// "single best" for `nms_iou >= 1`, so this always delegates to it.
    fn postprocess(cfg: &DetectorConfig, dets: Vec<crate::nms::Detection>) -> Vec<Region> {
        nms(&dets, cfg.infer.nms_iou, cfg.infer.use_fast_iou).into_iter().map(|d| Region { pts: d.pts }).collect()
    }

    /// Converts to BGR, decides single-vs-tiled by `tiles_dim.cells() > 1`,
    /// and bound-vs-unbound by `bind_io && binding_ready()`.
    pub fn detect(&self, bgr: ImageView) -> Result<Vec<Region>> {
        let engine = self.inner.engine();
        let cfg = engine.config();
        let grid = cfg.infer.tiles_dim;
        let use_bound = cfg.infer.bind_io && engine.binding_ready();

        let dets = if grid.cells() <= 1 {
            if use_bound {
                engine.infer_bound(bgr, 0)?
            } else {
                engine.infer_unbound(bgr)?
            }
        } else if use_bound {
            let contexts = engine.bound_contexts().max(1);
            let infer = |view: ImageView, ctx: usize| engine.infer_bound(view, ctx);
            infer_tiled(&bgr, grid, cfg.infer.tile_overlap, DispatchMode::BoundParallel { contexts, infer: &infer })?
        } else {
            let workers = cfg.runtime.tile_omp_threads.max(1) as usize;
            let infer = |view: ImageView| engine.infer_unbound(view);
            infer_tiled(&bgr, grid, cfg.infer.tile_overlap, DispatchMode::Unbound { desired_workers: workers, infer: &infer })?
        };

        Ok(Self::postprocess(cfg, dets))
    }

    /// Same as [`Detector::detect`] but always uses bound inference at
    /// `ctx_idx`; in tiled mode this disables parallel-bound distribution
    /// so every tile uses the caller's single context, per spec.md §4.9.
    pub fn detect_bound(&self, bgr: ImageView, ctx_idx: usize) -> Result<Vec<Region>> {
        let engine = self.inner.engine();
        if !engine.binding_ready() {
            return Err(Status::invalid("Detector::detect_bound: binding not ready"));
        }
        let cfg = engine.config();
        let grid = cfg.infer.tiles_dim;

        let dets = if grid.cells() <= 1 {
            engine.infer_bound(bgr, ctx_idx)?
        } else {
            let infer = |view: ImageView, ctx: usize| engine.infer_bound(view, ctx);
            infer_tiled(&bgr, grid, cfg.infer.tile_overlap, DispatchMode::BoundSingleCtx { ctx_idx, infer: &infer })?
        };

        Ok(Self::postprocess(cfg, dets))
    }
}
