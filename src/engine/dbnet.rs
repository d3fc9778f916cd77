//! DBNet-like text-region detector engine (ONNX Runtime backend).
//!
//! Grounded on `original_source/src/lib/idet/engine/dbnet.h` / `dbnet.cpp`.
//! Contour extraction and minimum-area-rectangle fitting are delegated to
//! `imageproc` (an external collaborator per spec.md §1's "2D image
//! manipulation primitives").

use std::sync::{Mutex, RwLock};

use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use ort::inputs;
use ort::session::Session;
use ort::value::Value;

use crate::config::{DetectorConfig, EngineKind, Task};
use crate::engine::{align32, check_hot_update, create_session, Engine};
use crate::error::{Result, Status};
use crate::geometry::{contour_score, order_quad, Point2f, Quad};
use crate::image::ImageView;
use crate::nms::Detection;
use crate::tensor::{extract_hw_channel, make_desc_probmap, TensorDesc, TensorLayout};

struct NetGeom {
    in_w: i32,
    in_h: i32,
    sx: f32,
    sy: f32,
}

struct BoundCtx {
    input: Vec<f32>,
    output: Vec<f32>,
    scratch: Vec<f32>,
}

pub struct DBNet {
    cfg: DetectorConfig,
    session: Session,
    in_name: String,
    out_name: String,

    apply_sigmoid: bool,
    bin_thresh: f32,
    box_thresh: f32,
    unclip: f32,
    max_img: i32,
    min_w: i32,
    min_h: i32,

    bound_out_desc: Option<TensorDesc>,
    bound_out_w: i32,
    bound_out_h: i32,
    /// Each context has its own lock so that distinct `ctx_idx` callers
    /// (the `DispatchMode::BoundParallel` tiling path) run concurrently;
    /// the outer `RwLock` is only ever write-locked from `setup_binding`/
    /// `unset_binding`, never on the inference hot path.
    ctxs: RwLock<Vec<Mutex<BoundCtx>>>,
}

impl DBNet {
    pub fn new(cfg: DetectorConfig) -> Result<Self> {
        cfg.validate()?;
        if cfg.task != Task::Text || cfg.engine != EngineKind::DBNet {
            return Err(Status::invalid("DBNet: cfg.task/engine must be Text/DBNet"));
        }
        let session = create_session(&cfg)?;
        let in_name = session.inputs.first().map(|i| i.name.clone()).unwrap_or_else(|| "input".to_string());
        let out_name = session.outputs.first().map(|o| o.name.clone()).unwrap_or_else(|| "output".to_string());

        let mut engine = Self {
            apply_sigmoid: cfg.infer.apply_sigmoid,
            bin_thresh: cfg.infer.bin_thresh,
            box_thresh: cfg.infer.box_thresh,
            unclip: cfg.infer.unclip,
            max_img: cfg.infer.max_img_size,
            min_w: cfg.infer.min_roi_size_w,
            min_h: cfg.infer.min_roi_size_h,
            cfg,
            session,
            in_name,
            out_name,
            bound_out_desc: None,
            bound_out_w: 0,
            bound_out_h: 0,
            ctxs: RwLock::new(Vec::new()),
        };
        engine.cache_hot();
        Ok(engine)
    }

    fn cache_hot(&mut self) {
        self.apply_sigmoid = self.cfg.infer.apply_sigmoid;
        self.bin_thresh = self.cfg.infer.bin_thresh;
        self.box_thresh = self.cfg.infer.box_thresh;
        self.unclip = self.cfg.infer.unclip;
        self.max_img = self.cfg.infer.max_img_size;
        self.min_w = self.cfg.infer.min_roi_size_w;
        self.min_h = self.cfg.infer.min_roi_size_h;
    }

    fn make_geom(&self, orig_w: i32, orig_h: i32, force_w: i32, force_h: i32) -> NetGeom {
        if force_w > 0 && force_h > 0 {
            let in_w = align32(force_w);
            let in_h = align32(force_h);
            return NetGeom {
                in_w,
                in_h,
                sx: if orig_w > 0 { in_w as f32 / orig_w as f32 } else { 1.0 },
                sy: if orig_h > 0 { in_h as f32 / orig_h as f32 } else { 1.0 },
            };
        }

        let (mut tw, mut th) = (orig_w, orig_h);
        if self.max_img > 0 {
            let max_side = orig_w.max(orig_h);
            if max_side > self.max_img {
                let scale = self.max_img as f32 / max_side as f32;
                tw = ((orig_w as f32 * scale).round() as i32).max(1);
                th = ((orig_h as f32 * scale).round() as i32).max(1);
            }
        }
        let in_w = align32(tw);
        let in_h = align32(th);
        NetGeom {
            in_w,
            in_h,
            sx: if orig_w > 0 { in_w as f32 / orig_w as f32 } else { 1.0 },
            sy: if orig_h > 0 { in_h as f32 / orig_h as f32 } else { 1.0 },
        }
    }

    /// BGR U8 -> normalized CHW float32, using ImageNet mean/std stored in
    /// BGR order, resized to `(in_w, in_h)` with bilinear sampling.
    fn fill_input_chw(&self, dst: &mut [f32], in_w: i32, in_h: i32, bgr: &ImageView) {
        const MEAN: [f32; 3] = [0.406 * 255.0, 0.456 * 255.0, 0.485 * 255.0];
        const INV_STD: [f32; 3] = [1.0 / (0.225 * 255.0), 1.0 / (0.224 * 255.0), 1.0 / (0.229 * 255.0)];

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
                    dst[c * hw + y * iw + x] = (v - MEAN[c]) * INV_STD[c];
                }
            }
        }
    }

    fn run_ort_unbound(&self, input: &[f32], in_h: i32, in_w: i32) -> Result<Vec<f32>> {
        let arr = ndarray::Array4::from_shape_vec((1, 3, in_h as usize, in_w as usize), input.to_vec())
            .map_err(|e| Status::internal(format!("DBNet: bad input shape: {e}")))?;
        let outputs = self
            .session
            .run(inputs![self.in_name.as_str() => Value::from_array(arr).map_err(|e| Status::internal(e.to_string()))?]
                .map_err(|e| Status::internal(e.to_string()))?)
            .map_err(|e| Status::internal(format!("DBNet: session.run: {e}")))?;
        let out = outputs
            .get(self.out_name.as_str())
            .ok_or_else(|| Status::internal("DBNet: session.Run returned no outputs"))?;
        // ort 2.0.0-rc.9's `try_extract_tensor` returns an `ArrayViewD`, not
        // the `(Shape, &[T])` tuple of later `ort` releases.
        let view = out
            .try_extract_tensor::<f32>()
            .map_err(|e| Status::internal(format!("DBNet: try_extract_tensor: {e}")))?;
        Ok(view.iter().copied().collect())
    }

    fn probe_output_desc(&self, in_h: i32, in_w: i32) -> Result<TensorDesc> {
        let zero = vec![0.0f32; 3 * in_h as usize * in_w as usize];
        let arr = ndarray::Array4::from_shape_vec((1, 3, in_h as usize, in_w as usize), zero)
            .map_err(|e| Status::internal(e.to_string()))?;
        let outputs = self
            .session
            .run(inputs![self.in_name.as_str() => Value::from_array(arr).map_err(|e| Status::internal(e.to_string()))?]
                .map_err(|e| Status::internal(e.to_string()))?)
            .map_err(|e| Status::internal(format!("DBNet: probe run: {e}")))?;
        let out = outputs
            .get(self.out_name.as_str())
            .ok_or_else(|| Status::internal("DBNet: probe_output_desc: no outputs"))?;
        let view = out
            .try_extract_tensor::<f32>()
            .map_err(|e| Status::internal(e.to_string()))?;
        let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
        let desc = make_desc_probmap(&shape);
        if desc.layout == TensorLayout::Unknown || desc.h <= 0 || desc.w <= 0 {
            return Err(Status::unsupported("DBNet: cannot infer output probmap layout"));
        }
        Ok(desc)
    }

    fn unclip_rect_like(box_pts: &Quad, unclip: f32) -> Quad {
        let cx = box_pts.iter().map(|p| p.0).sum::<f32>() / 4.0;
        let cy = box_pts.iter().map(|p| p.1).sum::<f32>() / 4.0;
        let k = if unclip <= 0.0 { 1.0 } else { unclip };
        let mut out = *box_pts;
        for p in out.iter_mut() {
            p.0 = cx + (p.0 - cx) * k;
            p.1 = cy + (p.1 - cy) * k;
        }
        out
    }

    fn postprocess_hw(&self, prob_hw: &[f32], out_w: i32, out_h: i32, orig_w: i32, orig_h: i32) -> Vec<Detection> {
        let (ow, oh) = (out_w as usize, out_h as usize);
        let prob_owned;
        let prob: &[f32] = if self.apply_sigmoid {
            prob_owned = prob_hw.iter().map(|&x| 1.0 / (1.0 + (-x).exp())).collect::<Vec<_>>();
            &prob_owned
        } else {
            prob_hw
        };

        let bin_thresh = self.bin_thresh.clamp(0.0, 1.0);
        let mut gray = GrayImage::new(out_w.max(0) as u32, out_h.max(0) as u32);
        for y in 0..oh {
            for x in 0..ow {
                let v = if prob[y * ow + x] > bin_thresh { 255 } else { 0 };
                gray.put_pixel(x as u32, y as u32, Luma([v]));
            }
        }

        let contours = find_contours::<i32>(&gray);
        let sx = orig_w as f32 / out_w as f32;
        let sy = orig_h as f32 / out_h as f32;

        let mut dets = Vec::new();
        for c in &contours {
            if c.points.len() < 4 {
                continue;
            }
            let pts: Vec<Point2f> = c.points.iter().map(|p| (p.x as f32, p.y as f32)).collect();
            let score = contour_score(prob, ow, oh, &pts);
            if score < self.box_thresh {
                continue;
            }

            let (x0, y0, x1, y1) = pts.iter().fold(
                (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY),
                |(x0, y0, x1, y1), &(x, y)| (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            );
            let (w, h) = (x1 - x0, y1 - y0);
            if w <= 1.0 || h <= 1.0 {
                continue;
            }

            let mut quad: Quad = [(x0, y0), (x1, y0), (x1, y1), (x0, y1)];
            for p in quad.iter_mut() {
                p.0 *= sx;
                p.1 *= sy;
            }
            let (qw, qh) = ((quad[1].0 - quad[0].0).abs(), (quad[3].1 - quad[0].1).abs());
            if self.min_w > 0 && qw < self.min_w as f32 {
                continue;
            }
            if self.min_h > 0 && qh < self.min_h as f32 {
                continue;
            }

            if self.unclip > 1.0 {
                quad = Self::unclip_rect_like(&quad, self.unclip);
            }
            for p in quad.iter_mut() {
                p.0 = p.0.clamp(0.0, orig_w as f32);
                p.1 = p.1.clamp(0.0, orig_h as f32);
            }
            dets.push(Detection { pts: order_quad(&quad), score });
        }

        dets.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap());
        dets
    }
}

impl Engine for DBNet {
    fn kind(&self) -> EngineKind {
        EngineKind::DBNet
    }

    fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    fn binding_ready(&self) -> bool {
        self.bound_out_desc.is_some()
    }

    fn bound_w(&self) -> i32 {
        self.bound_out_w
    }

    fn bound_h(&self) -> i32 {
        self.bound_out_h
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
            return Err(Status::invalid("DBNet::setup_binding: w,h must be positive and contexts >= 1"));
        }
        let geom = self.make_geom(w, h, w, h);
        let desc = self.probe_output_desc(geom.in_h, geom.in_w)?;

        let mut ctxs = Vec::with_capacity(contexts);
        for _ in 0..contexts {
            ctxs.push(Mutex::new(BoundCtx {
                input: vec![0.0; 3 * geom.in_h as usize * geom.in_w as usize],
                output: vec![0.0; desc.numel],
                scratch: Vec::new(),
            }));
        }
        self.bound_out_w = geom.in_w;
        self.bound_out_h = geom.in_h;
        self.bound_out_desc = Some(desc);
        *self.ctxs.write().unwrap() = ctxs;
        Ok(())
    }

    fn unset_binding(&mut self) {
        self.bound_out_desc = None;
        self.bound_out_w = 0;
        self.bound_out_h = 0;
        self.ctxs.write().unwrap().clear();
    }

    fn infer_unbound(&self, bgr: ImageView) -> Result<Vec<Detection>> {
        let (ow, oh) = (bgr.width as i32, bgr.height as i32);
        let (fw, fh) = self.cfg.infer.fixed_input_dim;
        let geom = self.make_geom(ow, oh, fw, fh);

        let mut input = vec![0.0f32; 3 * geom.in_h as usize * geom.in_w as usize];
        self.fill_input_chw(&mut input, geom.in_w, geom.in_h, &bgr);
        let raw = self.run_ort_unbound(&input, geom.in_h, geom.in_w)?;
        let desc = self.probe_output_desc(geom.in_h, geom.in_w)?;
        let mut scratch = Vec::new();
        let plane = extract_hw_channel(&raw, &desc, 0, &mut scratch);
        Ok(self.postprocess_hw(plane, desc.w as i32, desc.h as i32, ow, oh))
    }

    fn infer_bound(&self, bgr: ImageView, ctx_idx: usize) -> Result<Vec<Detection>> {
        let desc = self
            .bound_out_desc
            .clone()
            .ok_or_else(|| Status::invalid("DBNet::infer_bound: binding not ready"))?;
        let ctxs = self.ctxs.read().unwrap();
        let ctx_lock = ctxs.get(ctx_idx).ok_or_else(|| Status::invalid("DBNet::infer_bound: ctx_idx out of range"))?;
        let mut ctx = ctx_lock.lock().unwrap();

        let (ow, oh) = (bgr.width as i32, bgr.height as i32);
        self.fill_input_chw(&mut ctx.input, self.bound_out_w, self.bound_out_h, &bgr);
        let raw = self.run_ort_unbound(&ctx.input, self.bound_out_h, self.bound_out_w)?;
        ctx.output.copy_from_slice(&raw[..ctx.output.len().min(raw.len())]);
        let plane = extract_hw_channel(&ctx.output, &desc, 0, &mut ctx.scratch);
        Ok(self.postprocess_hw(plane, desc.w as i32, desc.h as i32, ow, oh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unclip_expands_around_centroid() {
        let q: Quad = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let out = DBNet::unclip_rect_like(&q, 2.0);
        // centroid (5,5): each corner should move to twice its offset.
        assert!((out[0].0 - (-5.0)).abs() < 1e-4);
        assert!((out[2].0 - 15.0).abs() < 1e-4);
    }

    #[test]
    fn unclip_leq_one_is_identity() {
        let q: Quad = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let out = DBNet::unclip_rect_like(&q, 1.0);
        for i in 0..4 {
            assert!((out[i].0 - q[i].0).abs() < 1e-4);
            assert!((out[i].1 - q[i].1).abs() < 1e-4);
        }
    }
}
