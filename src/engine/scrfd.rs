//! SCRFD-like face detector engine (ONNX Runtime backend).
//!
//! Grounded on `original_source/src/lib/idet/engine/scrfd.h` / `scrfd.cpp`.
//! Multi-head (stride 8/16/32) name-based probing with a fixed-ordering
//! fallback, and per-head independent score/bbox layout classification, are
//! carried over verbatim in spirit; the layout enums live in [`Layout`]
//! rather than reusing `tensor::TensorLayout`, since SCRFD's per-head score
//! and bbox layouts are a distinct, smaller classification than the
//! general probability-map classifier in `tensor.rs`.

use std::sync::{Mutex, RwLock};

use ort::inputs;
use ort::session::Session;
use ort::value::Value;

use crate::config::{DetectorConfig, EngineKind, Task};
use crate::engine::{align32, check_hot_update, create_session, Engine};
use crate::error::{Result, Status};
use crate::image::ImageView;
use crate::nms::Detection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScoreLayout {
    Unknown,
    Chw,
    Flat,
    Hw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BboxLayout {
    Unknown,
    Chw,
    Flat,
    Hw4,
}

#[derive(Debug, Clone)]
struct Head {
    stride: i32,
    score_idx: usize,
    bbox_idx: usize,
    score_layout: ScoreLayout,
    bbox_layout: BboxLayout,
    hs: i32,
    ws: i32,
    anchors: i32,
    score_ch: i32,
}

struct BoundCtx {
    input: Vec<f32>,
}

pub struct Scrfd {
    cfg: DetectorConfig,
    session: Session,
    in_name: String,
    out_names: Vec<String>,

    apply_sigmoid: bool,
    score_thr: f32,
    max_img: i32,
    min_w: i32,
    min_h: i32,
    score_channel_override: Option<usize>,

    bound_heads: Option<Vec<Head>>,
    bound_in_w: i32,
    bound_in_h: i32,
    /// Each context has its own lock so that distinct `ctx_idx` callers
    /// (the `DispatchMode::BoundParallel` tiling path) run concurrently;
    /// the outer `RwLock` is only ever write-locked from `setup_binding`/
    /// `unset_binding`, never on the inference hot path.
    ctxs: RwLock<Vec<Mutex<BoundCtx>>>,
}

impl Scrfd {
    pub fn new(cfg: DetectorConfig) -> Result<Self> {
        cfg.validate()?;
        if cfg.task != Task::Face || cfg.engine != EngineKind::SCRFD {
            return Err(Status::invalid("SCRFD: cfg.task/engine must be Face/SCRFD"));
        }
        let session = create_session(&cfg)?;
        let in_name = session.inputs.first().map(|i| i.name.clone()).unwrap_or_else(|| "input".to_string());
        let out_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        let mut engine = Self {
            apply_sigmoid: cfg.infer.apply_sigmoid,
            score_thr: cfg.infer.box_thresh,
            max_img: cfg.infer.max_img_size,
            min_w: cfg.infer.min_roi_size_w,
            min_h: cfg.infer.min_roi_size_h,
            score_channel_override: cfg.infer.scrfd_score_channel,
            cfg,
            session,
            in_name,
            out_names,
            bound_heads: None,
            bound_in_w: 0,
            bound_in_h: 0,
            ctxs: RwLock::new(Vec::new()),
        };
        engine.cache_hot();
        Ok(engine)
    }

    fn cache_hot(&mut self) {
        self.apply_sigmoid = self.cfg.infer.apply_sigmoid;
        self.score_thr = self.cfg.infer.box_thresh;
        self.max_img = self.cfg.infer.max_img_size;
        self.min_w = self.cfg.infer.min_roi_size_w;
        self.min_h = self.cfg.infer.min_roi_size_h;
        self.score_channel_override = self.cfg.infer.scrfd_score_channel;
    }

    fn target_dims(&self, orig_w: i32, orig_h: i32, force_w: i32, force_h: i32) -> (i32, i32) {
        let (mut tw, mut th) = (force_w, force_h);
        if tw <= 0 || th <= 0 {
            tw = orig_w;
            th = orig_h;
            if self.max_img > 0 {
                let max_side = orig_w.max(orig_h);
                if max_side > self.max_img {
                    let scale = self.max_img as f32 / max_side as f32;
                    tw = ((orig_w as f32 * scale).round() as i32).max(1);
                    th = ((orig_h as f32 * scale).round() as i32).max(1);
                }
            }
        }
        (align32(tw), align32(th))
    }

    fn fill_input_chw(&self, dst: &mut [f32], in_w: i32, in_h: i32, bgr: &ImageView) {
        const MEAN: f32 = 127.5;
        const INV_STD: f32 = 1.0 / 128.0;

        let (iw, ih) = (in_w as usize, in_h as usize);
        let (ow, oh) = (bgr.width as f32, bgr.height as f32);
        let channels = bgr.channels();
        let hw = iw * ih;

        for y in 0..ih {
            let sy = ((y as f32 + 0.5) / ih as f32 * oh - 0.5).clamp(0.0, oh - 1.0);
            let sy0 = sy.floor() as usize;
            let sy1 = (sy0 + 1).min(bgr.height as usize - 1);
            let fy = sy - sy0 as f32;
            for x in 0..iw {
                let sx = ((x as f32 + 0.5) / iw as f32 * ow - 0.5).clamp(0.0, ow - 1.0);
                let sx0 = sx.floor() as usize;
                let sx1 = (sx0 + 1).min(bgr.width as usize - 1);
                let fx = sx - sx0 as f32;

                for c in 0..3 {
                    let px = |row: usize, col: usize| -> f32 {
                        bgr.data[row * bgr.stride_bytes as usize + col * channels + c] as f32
                    };
                    let top = px(sy0, sx0) * (1.0 - fx) + px(sy0, sx1) * fx;
                    let bot = px(sy1, sx0) * (1.0 - fx) + px(sy1, sx1) * fx;
                    let v = top * (1.0 - fy) + bot * fy;
                    dst[c * hw + y * iw + x] = (v - MEAN) * INV_STD;
                }
            }
        }
    }

    fn run_unbound(&self, input: &[f32], in_h: i32, in_w: i32) -> Result<Vec<(Vec<i64>, Vec<f32>)>> {
        let arr = ndarray::Array4::from_shape_vec((1, 3, in_h as usize, in_w as usize), input.to_vec())
            .map_err(|e| Status::internal(format!("SCRFD: bad input shape: {e}")))?;
        let outputs = self
            .session
            .run(inputs![self.in_name.as_str() => Value::from_array(arr).map_err(|e| Status::internal(e.to_string()))?]
                .map_err(|e| Status::internal(e.to_string()))?)
            .map_err(|e| Status::internal(format!("SCRFD: session.run: {e}")))?;

        let mut result = Vec::with_capacity(self.out_names.len());
        for name in &self.out_names {
            let out = outputs
                .get(name.as_str())
                .ok_or_else(|| Status::internal(format!("SCRFD: missing output '{name}'")))?;
            // ort 2.0.0-rc.9's `try_extract_tensor` returns an `ArrayViewD`,
            // not the `(Shape, &[T])` tuple of later `ort` releases.
            let view = out
                .try_extract_tensor::<f32>()
                .map_err(|e| Status::internal(format!("SCRFD: try_extract_tensor: {e}")))?;
            let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
            let data: Vec<f32> = view.iter().copied().collect();
            result.push((shape, data));
        }
        Ok(result)
    }

    fn find_by(&self, what: &str, stride_token: &str) -> Option<usize> {
        self.out_names.iter().position(|n| n.contains(what) && n.contains(stride_token))
    }

    fn infer_score_layout(shape: &[i64], h: &mut Head) {
        match shape.len() {
            4 => {
                if shape[1] > 0 && shape[1] <= 8 {
                    h.score_layout = ScoreLayout::Chw;
                    h.score_ch = shape[1].max(1) as i32;
                    h.hs = shape[2] as i32;
                    h.ws = shape[3] as i32;
                } else {
                    h.score_layout = ScoreLayout::Hw;
                    h.hs = shape[1] as i32;
                    h.ws = shape[2] as i32;
                    h.score_ch = shape[3].max(1) as i32;
                }
            }
            3 => {
                if shape[0] == 1 && shape[2] > 0 && shape[2] <= 8 {
                    h.score_layout = ScoreLayout::Flat;
                    h.score_ch = shape[2].max(1) as i32;
                } else {
                    h.score_layout = ScoreLayout::Hw;
                    h.hs = shape[1] as i32;
                    h.ws = shape[2] as i32;
                    h.score_ch = 1;
                }
            }
            _ => h.score_layout = ScoreLayout::Unknown,
        }
    }

    fn infer_bbox_layout(shape: &[i64], h: &mut Head) {
        if shape.len() == 4 && shape[1] == 4 {
            h.bbox_layout = BboxLayout::Chw;
            h.hs = shape[2] as i32;
            h.ws = shape[3] as i32;
        } else if shape.len() == 3 && shape[2] == 4 {
            h.bbox_layout = BboxLayout::Flat;
        } else if shape.len() == 4 && shape[3] == 4 {
            h.bbox_layout = BboxLayout::Hw4;
            h.hs = shape[1] as i32;
            h.ws = shape[2] as i32;
        } else {
            h.bbox_layout = BboxLayout::Unknown;
        }
    }

    fn add_head(&self, stride: i32, in_h: i32, in_w: i32, outs: &[(Vec<i64>, Vec<f32>)]) -> Option<Head> {
        let stoken = stride.to_string();
        let mut si = self.find_by("score", &stoken).or_else(|| self.find_by("cls", &stoken)).or_else(|| self.find_by("conf", &stoken));
        let mut bi = self.find_by("bbox", &stoken).or_else(|| self.find_by("reg", &stoken));

        if si.is_none() || bi.is_none() {
            if self.out_names.len() >= 6 {
                let (s, b) = match stride {
                    8 => (0, 3),
                    16 => (1, 4),
                    _ => (2, 5),
                };
                si = Some(s);
                bi = Some(b);
            } else {
                return None;
            }
        }
        let (si, bi) = (si.unwrap(), bi.unwrap());

        let mut h = Head {
            stride,
            score_idx: si,
            bbox_idx: bi,
            score_layout: ScoreLayout::Unknown,
            bbox_layout: BboxLayout::Unknown,
            hs: (in_h / stride).max(1),
            ws: (in_w / stride).max(1),
            anchors: 1,
            score_ch: 1,
        };

        let (sshape, _) = &outs[si];
        let (bshape, _) = &outs[bi];
        Self::infer_score_layout(sshape, &mut h);
        Self::infer_bbox_layout(bshape, &mut h);

        if h.score_layout == ScoreLayout::Flat && sshape.len() == 3 {
            let nloc = sshape[1];
            let hw = (h.hs * h.ws).max(1) as i64;
            if hw > 0 && nloc % hw == 0 {
                h.anchors = (nloc / hw) as i32;
            }
        }
        if h.bbox_layout == BboxLayout::Flat && bshape.len() == 3 {
            let nloc = bshape[1];
            let hw = (h.hs * h.ws).max(1) as i64;
            if hw > 0 && nloc % hw == 0 {
                h.anchors = (nloc / hw) as i32;
            }
        }

        if h.score_layout == ScoreLayout::Unknown || h.bbox_layout == BboxLayout::Unknown {
            return None;
        }
        Some(h)
    }

    fn probe_heads(&self, in_h: i32, in_w: i32) -> Result<Vec<Head>> {
        let zero = vec![0.0f32; 3 * in_h as usize * in_w as usize];
        let outs = self.run_unbound(&zero, in_h, in_w)?;
        let mut heads = Vec::with_capacity(3);
        for stride in [8, 16, 32] {
            if let Some(h) = self.add_head(stride, in_h, in_w, &outs) {
                heads.push(h);
            }
        }
        if heads.is_empty() {
            return Err(Status::unsupported("SCRFD: cannot resolve heads"));
        }
        Ok(heads)
    }

    fn score_at(&self, h: &Head, score: &[f32], y: i32, x: i32, a: i32) -> f32 {
        let ws = h.ws.max(1);
        let hw = (h.hs.max(1) * ws) as usize;
        let ch = self.score_channel_override.map(|c| c as i32).unwrap_or(if h.score_ch > 1 { 1 } else { 0 });
        match h.score_layout {
            ScoreLayout::Chw => score[(ch as usize) * hw + (y * ws + x) as usize],
            ScoreLayout::Flat => {
                let loc = (y * ws + x) * h.anchors.max(1) + a;
                score[loc as usize * h.score_ch.max(1) as usize + ch as usize]
            }
            ScoreLayout::Hw | ScoreLayout::Unknown => score[(y * ws + x) as usize],
        }
    }

    fn bbox_at(&self, h: &Head, bbox: &[f32], y: i32, x: i32, a: i32, stride: f32) -> (f32, f32, f32, f32) {
        let ws = h.ws.max(1);
        let hw = (h.hs.max(1) * ws) as usize;
        match h.bbox_layout {
            BboxLayout::Chw => {
                let idx = (y * ws + x) as usize;
                (
                    bbox[idx] * stride,
                    bbox[hw + idx] * stride,
                    bbox[2 * hw + idx] * stride,
                    bbox[3 * hw + idx] * stride,
                )
            }
            BboxLayout::Flat => {
                let loc = ((y * ws + x) * h.anchors.max(1) + a) as usize;
                (
                    bbox[loc * 4] * stride,
                    bbox[loc * 4 + 1] * stride,
                    bbox[loc * 4 + 2] * stride,
                    bbox[loc * 4 + 3] * stride,
                )
            }
            BboxLayout::Hw4 | BboxLayout::Unknown => {
                let idx = ((y * ws + x) * 4) as usize;
                (bbox[idx] * stride, bbox[idx + 1] * stride, bbox[idx + 2] * stride, bbox[idx + 3] * stride)
            }
        }
    }

    fn decode(&self, heads: &[Head], outs: &[(Vec<i64>, Vec<f32>)], sx: f32, sy: f32, orig_w: i32, orig_h: i32) -> Vec<Detection> {
        let mut dets = Vec::with_capacity(256);

        for h in heads {
            let score = &outs[h.score_idx].1;
            let bbox = &outs[h.bbox_idx].1;
            let (hs, ws, a_count, stride) = (h.hs.max(1), h.ws.max(1), h.anchors.max(1), h.stride as f32);

            for y in 0..hs {
                for x in 0..ws {
                    for a in 0..a_count {
                        let mut sc = self.score_at(h, score, y, x, a);
                        if self.apply_sigmoid {
                            sc = 1.0 / (1.0 + (-sc).exp());
                        }
                        if sc < self.score_thr {
                            continue;
                        }

                        let (dl, dt, dr, db) = self.bbox_at(h, bbox, y, x, a, stride);
                        let cx = (x as f32 + 0.5) * stride;
                        let cy = (y as f32 + 0.5) * stride;

                        let mut x1 = (cx - dl) / sx;
                        let mut y1 = (cy - dt) / sy;
                        let mut x2 = (cx + dr) / sx;
                        let mut y2 = (cy + db) / sy;

                        x1 = x1.clamp(0.0, orig_w as f32);
                        y1 = y1.clamp(0.0, orig_h as f32);
                        x2 = x2.clamp(0.0, orig_w as f32);
                        y2 = y2.clamp(0.0, orig_h as f32);

                        if x2 <= x1 || y2 <= y1 {
                            continue;
                        }
                        if self.min_w > 0 && (x2 - x1) < self.min_w as f32 {
                            continue;
                        }
                        if self.min_h > 0 && (y2 - y1) < self.min_h as f32 {
                            continue;
                        }

                        dets.push(Detection { pts: [(x1, y1), (x2, y1), (x2, y2), (x1, y2)], score: sc });
                    }
                }
            }
        }

        dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        dets
    }
}

impl Engine for Scrfd {
    fn kind(&self) -> EngineKind {
        EngineKind::SCRFD
    }

    fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    fn binding_ready(&self) -> bool {
        self.bound_heads.is_some()
    }

    fn bound_w(&self) -> i32 {
        self.bound_in_w
    }

    fn bound_h(&self) -> i32 {
        self.bound_in_h
    }

    fn bound_contexts(&self) -> usize {
        self.ctxs.read().unwrap().len()
    }

    fn update_hot(&mut self, next: &DetectorConfig) -> Result<()> {
        check_hot_update(&self.cfg, next)?;
        self.cfg.infer = next.infer;
        self.cfg.verbose = next.verbose;
        self.cache_hot();
        Ok(())
    }

    fn setup_binding(&mut self, w: i32, h: i32, contexts: usize) -> Result<()> {
        if w <= 0 || h <= 0 || contexts == 0 {
            return Err(Status::invalid("SCRFD::setup_binding: w,h must be positive and contexts >= 1"));
        }
        let (in_w, in_h) = self.target_dims(w, h, w, h);
        let heads = self.probe_heads(in_h, in_w)?;

        let mut ctxs = Vec::with_capacity(contexts);
        for _ in 0..contexts {
            ctxs.push(Mutex::new(BoundCtx { input: vec![0.0; 3 * in_h as usize * in_w as usize] }));
        }
        self.bound_in_w = in_w;
        self.bound_in_h = in_h;
        self.bound_heads = Some(heads);
        *self.ctxs.write().unwrap() = ctxs;
        Ok(())
    }

    fn unset_binding(&mut self) {
        self.bound_heads = None;
        self.bound_in_w = 0;
        self.bound_in_h = 0;
        self.ctxs.write().unwrap().clear();
    }

    fn infer_unbound(&self, bgr: ImageView) -> Result<Vec<Detection>> {
        let (ow, oh) = (bgr.width as i32, bgr.height as i32);
        let (fw, fh) = self.cfg.infer.fixed_input_dim;
        let (in_w, in_h) = self.target_dims(ow, oh, fw, fh);

        let mut input = vec![0.0f32; 3 * in_h as usize * in_w as usize];
        self.fill_input_chw(&mut input, in_w, in_h, &bgr);
        let outs = self.run_unbound(&input, in_h, in_w)?;
        let heads = self.probe_heads(in_h, in_w)?;

        let sx = in_w as f32 / ow as f32;
        let sy = in_h as f32 / oh as f32;
        Ok(self.decode(&heads, &outs, sx, sy, ow, oh))
    }

    fn infer_bound(&self, bgr: ImageView, ctx_idx: usize) -> Result<Vec<Detection>> {
        let heads = self
            .bound_heads
            .clone()
            .ok_or_else(|| Status::invalid("SCRFD::infer_bound: binding not ready"))?;
        let ctxs = self.ctxs.read().unwrap();
        let ctx_lock = ctxs.get(ctx_idx).ok_or_else(|| Status::invalid("SCRFD::infer_bound: ctx_idx out of range"))?;
        let mut ctx = ctx_lock.lock().unwrap();

        let (ow, oh) = (bgr.width as i32, bgr.height as i32);
        self.fill_input_chw(&mut ctx.input, self.bound_in_w, self.bound_in_h, &bgr);
        let outs = self.run_unbound(&ctx.input, self.bound_in_h, self.bound_in_w)?;

        let sx = self.bound_in_w as f32 / ow as f32;
        let sy = self.bound_in_h as f32 / oh as f32;
        Ok(self.decode(&heads, &outs, sx, sy, ow, oh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chw_score_layout_prefers_channel_one_when_multi_channel() {
        let h = Head {
            stride: 8,
            score_idx: 0,
            bbox_idx: 1,
            score_layout: ScoreLayout::Chw,
            bbox_layout: BboxLayout::Chw,
            hs: 2,
            ws: 2,
            anchors: 1,
            score_ch: 2,
        };
        // score tensor [1,2,2,2]: channel 0 all zeros, channel 1 all ones.
        let mut score = vec![0.0f32; 4];
        score.extend(vec![1.0f32; 4]);
        let engine_score_ch = if h.score_ch > 1 { 1 } else { 0 };
        assert_eq!(engine_score_ch, 1);
        let hw = (h.hs * h.ws) as usize;
        assert_eq!(score[hw + 0], 1.0);
    }

    #[test]
    fn infer_score_layout_chw_vs_hw() {
        let mut h = Head {
            stride: 8,
            score_idx: 0,
            bbox_idx: 0,
            score_layout: ScoreLayout::Unknown,
            bbox_layout: BboxLayout::Unknown,
            hs: 0,
            ws: 0,
            anchors: 1,
            score_ch: 1,
        };
        Scrfd::infer_score_layout(&[1, 2, 10, 12], &mut h);
        assert_eq!(h.score_layout, ScoreLayout::Chw);
        assert_eq!((h.hs, h.ws), (10, 12));
    }

    #[test]
    fn infer_bbox_layout_flat() {
        let mut h = Head {
            stride: 8,
            score_idx: 0,
            bbox_idx: 0,
            score_layout: ScoreLayout::Unknown,
            bbox_layout: BboxLayout::Unknown,
            hs: 1,
            ws: 1,
            anchors: 1,
            score_ch: 1,
        };
        Scrfd::infer_bbox_layout(&[1, 400, 4], &mut h);
        assert_eq!(h.bbox_layout, BboxLayout::Flat);
    }
}
