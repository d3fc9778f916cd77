//! Score-sorted greedy non-maximum suppression with a uniform-grid AABB
//! prefilter. Grounded on `original_source/src/lib/idet/algo/nms.cpp`.

use crate::geometry::{quad_iou, Quad};

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub pts: Quad,
    pub score: f32,
}

fn aabb(q: &Quad) -> (f32, f32, f32, f32) {
    let xs = q.iter().map(|p| p.0);
    let ys = q.iter().map(|p| p.1);
    (
        xs.clone().fold(f32::INFINITY, f32::min),
        ys.clone().fold(f32::INFINITY, f32::min),
        xs.fold(f32::NEG_INFINITY, f32::max),
        ys.fold(f32::NEG_INFINITY, f32::max),
    )
}

fn aabb_overlap(a: (f32, f32, f32, f32), b: (f32, f32, f32, f32)) -> bool {
    a.0 <= b.2 && b.0 <= a.2 && a.1 <= b.3 && b.1 <= a.3
}

fn snap_cell(cell: f32) -> f32 {
    if cell < 64.0 {
        64.0
    } else if cell < 128.0 {
        128.0
    } else {
        256.0
    }
}

/// Suppress `dets` with IoU threshold `iou_thr`. `iou_thr <= 0` sorts by
/// descending score without suppression; `iou_thr >= 1` keeps only the
/// single highest-scoring detection.
pub fn nms(dets: &[Detection], iou_thr: f32, use_fast_iou: bool) -> Vec<Detection> {
    let n = dets.len();
    if n == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| dets[b].score.partial_cmp(&dets[a].score).unwrap());

    if iou_thr <= 0.0 {
        return order.into_iter().map(|i| dets[i].clone()).collect();
    }
    if iou_thr >= 1.0 {
        return vec![dets[order[0]].clone()];
    }

    let mut rank = vec![0usize; n];
    for (r, &idx) in order.iter().enumerate() {
        rank[idx] = r;
    }

    let aabbs: Vec<(f32, f32, f32, f32)> = dets.iter().map(|d| aabb(&d.pts)).collect();
    let (mean_w, mean_h) = {
        let (mut sw, mut sh) = (0.0f32, 0.0f32);
        for &(x0, y0, x1, y1) in &aabbs {
            sw += (x1 - x0).max(0.0);
            sh += (y1 - y0).max(0.0);
        }
        (sw / n as f32, sh / n as f32)
    };
    let cell = snap_cell((0.5 * (mean_w + mean_h)).clamp(48.0, 256.0));

    let (mut gx0, mut gy0, mut gx1, mut gy1) = (f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY, f32::NEG_INFINITY);
    for &(x0, y0, x1, y1) in &aabbs {
        gx0 = gx0.min(x0);
        gy0 = gy0.min(y0);
        gx1 = gx1.max(x1);
        gy1 = gy1.max(y1);
    }
    let nx = (((gx1 - gx0).max(0.0) / cell).floor() as usize + 1).max(1);
    let ny = (((gy1 - gy0).max(0.0) / cell).floor() as usize + 1).max(1);
    let use_grid = (nx as u64) * (ny as u64) <= 2_000_000;

    let mut suppressed = vec![false; n];
    let mut kept: Vec<usize> = Vec::new();

    if use_grid {
        let cell_of = |x: f32, y: f32| -> (usize, usize) {
            let cx = (((x - gx0) / cell).floor() as isize).clamp(0, nx as isize - 1) as usize;
            let cy = (((y - gy0) / cell).floor() as isize).clamp(0, ny as isize - 1) as usize;
            (cx, cy)
        };
        // CSR bucket build: which cells each detection's AABB spans.
        let mut counts = vec![0u32; nx * ny + 1];
        let mut spans: Vec<Vec<usize>> = Vec::with_capacity(n);
        for &(x0, y0, x1, y1) in &aabbs {
            let (cx0, cy0) = cell_of(x0, y0);
            let (cx1, cy1) = cell_of(x1, y1);
            let mut cells = Vec::new();
            for gy in cy0..=cy1 {
                for gx in cx0..=cx1 {
                    let id = gy * nx + gx;
                    counts[id + 1] += 1;
                    cells.push(id);
                }
            }
            spans.push(cells);
        }
        for i in 1..counts.len() {
            counts[i] += counts[i - 1];
        }
        let total: u32 = *counts.last().unwrap();
        let mut items = vec![0usize; total as usize];
        let mut cursor = counts.clone();
        for (det_idx, cells) in spans.iter().enumerate() {
            for &id in cells {
                items[cursor[id] as usize] = det_idx;
                cursor[id] += 1;
            }
        }

        let mut seen = vec![0u32; n];
        let mut stamp = 0u32;

        for &i in &order {
            if suppressed[i] {
                continue;
            }
            kept.push(i);
            stamp += 1;

            let (x0, y0, x1, y1) = aabbs[i];
            let (cx0, cy0) = cell_of(x0, y0);
            let (cx1, cy1) = cell_of(x1, y1);
            for gy in cy0..=cy1 {
                for gx in cx0..=cx1 {
                    let id = gy * nx + gx;
                    let start = counts[id] as usize;
                    let end = counts[id + 1] as usize;
                    for &j in &items[start..end] {
                        if seen[j] == stamp || rank[j] <= rank[i] || suppressed[j] {
                            continue;
                        }
                        seen[j] = stamp;
                        if !aabb_overlap(aabbs[i], aabbs[j]) {
                            continue;
                        }
                        if quad_iou(&dets[i].pts, &dets[j].pts, use_fast_iou) >= iou_thr {
                            suppressed[j] = true;
                        }
                    }
                }
            }
        }
    } else {
        for (p, &i) in order.iter().enumerate() {
            if suppressed[i] {
                continue;
            }
            kept.push(i);
            for &j in &order[p + 1..] {
                if suppressed[j] {
                    continue;
                }
                if !aabb_overlap(aabbs[i], aabbs[j]) {
                    continue;
                }
                if quad_iou(&dets[i].pts, &dets[j].pts, use_fast_iou) >= iou_thr {
                    suppressed[j] = true;
                }
            }
        }
    }

    kept.sort_by(|&a, &b| dets[b].score.partial_cmp(&dets[a].score).unwrap());
    kept.into_iter().map(|i| dets[i].clone()).collect()
}

fn rect(x0: f32, y0: f32, x1: f32, y1: f32, score: f32) -> Detection {
    Detection { pts: [(x0, y0), (x1, y0), (x1, y1), (x0, y1)], score }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_overlap_and_one_disjoint_box() {
        let dets = vec![
            rect(0.0, 0.0, 10.0, 10.0, 0.9),
            rect(1.0, 1.0, 9.0, 9.0, 0.8),
            rect(100.0, 100.0, 110.0, 110.0, 0.7),
        ];
        let out = nms(&dets, 0.3, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].score, 0.9);
        assert_eq!(out[1].score, 0.7);
    }

    #[test]
    fn threshold_leq_zero_sorts_only() {
        let dets = vec![rect(0.0, 0.0, 5.0, 5.0, 0.2), rect(0.0, 0.0, 5.0, 5.0, 0.9)];
        let out = nms(&dets, 0.0, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn threshold_geq_one_keeps_single_best() {
        let dets = vec![rect(0.0, 0.0, 5.0, 5.0, 0.2), rect(0.0, 0.0, 5.0, 5.0, 0.9)];
        let out = nms(&dets, 1.0, true);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.9);
    }

    #[test]
    fn kept_detections_are_pairwise_below_threshold() {
        let dets = vec![
            rect(0.0, 0.0, 10.0, 10.0, 0.95),
            rect(2.0, 2.0, 12.0, 12.0, 0.9),
            rect(50.0, 50.0, 60.0, 60.0, 0.8),
            rect(51.0, 51.0, 61.0, 61.0, 0.7),
        ];
        let out = nms(&dets, 0.3, true);
        for i in 0..out.len() {
            for j in (i + 1)..out.len() {
                assert!(quad_iou(&out[i].pts, &out[j].pts, true) < 0.3);
            }
        }
        // sorted descending
        for i in 1..out.len() {
            assert!(out[i - 1].score >= out[i].score);
        }
    }

    #[test]
    fn large_scattered_set_uses_grid_path_without_missing_suppressions() {
        let mut dets = Vec::new();
        for i in 0..200 {
            let x = (i % 20) as f32 * 30.0;
            let y = (i / 20) as f32 * 30.0;
            dets.push(rect(x, y, x + 10.0, y + 10.0, 0.5));
            dets.push(rect(x + 1.0, y + 1.0, x + 9.0, y + 9.0, 0.9));
        }
        let out = nms(&dets, 0.3, true);
        assert_eq!(out.len(), 200);
        for d in &out {
            assert_eq!(d.score, 0.9);
        }
    }
}
