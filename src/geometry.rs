//! Geometry primitives: quad canonicalization, IoU (axis-aligned and
//! polygon), contour scoring, and aspect-fit-with-alignment sizing.
//!
//! Grounded on `original_source/src/lib/idet/algo/geometry.cpp`.

const EPS_LEX: f32 = 1e-4;
const EPS_ANG: f32 = 1e-6;

pub type Point2f = (f32, f32);
pub type Quad = [Point2f; 4];

fn lex_less(a: Point2f, b: Point2f) -> bool {
    if (a.1 - b.1).abs() > EPS_LEX {
        a.1 < b.1
    } else {
        a.0 < b.0
    }
}

fn all_finite(pts: &Quad) -> bool {
    pts.iter().all(|p| p.0.is_finite() && p.1.is_finite())
}

/// Lexicographic fallback used both for non-finite input and for detected
/// geometric degeneracy: sort by (y,x), then pick TL/BR from the extremes
/// and disambiguate TR/BL by a deterministic right-vs-left rule.
fn lex_fallback(pts: &Quad) -> Quad {
    let mut v: Vec<Point2f> = pts.to_vec();
    v.sort_by(|a, b| {
        if lex_less(*a, *b) {
            std::cmp::Ordering::Less
        } else if lex_less(*b, *a) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });
    let tl = v[0];
    let br = v[3];
    let (mut t1, mut t2) = (v[1], v[2]);
    // deterministic right-vs-left tiebreak: the point with the larger x (or,
    // on a tie, smaller y) is TR.
    let t1_lower = t1.1 > t2.1;
    let same_y = (t1.1 - t2.1).abs() <= EPS_LEX;
    let t1_left = t1.0 < t2.0;
    if t1_lower || (same_y && t1_left) {
        std::mem::swap(&mut t1, &mut t2);
    }
    [tl, t1, br, t2]
}

fn poly_area2(pts: &Quad) -> f32 {
    let mut a = 0.0f32;
    for i in 0..4 {
        let (x0, y0) = pts[i];
        let (x1, y1) = pts[(i + 1) % 4];
        a += x0 * y1 - x1 * y0;
    }
    a
}

/// Rearrange `pts` (any order) into `[TL, TR, BR, BL]`.
pub fn order_quad(pts: &Quad) -> Quad {
    if !all_finite(pts) {
        return lex_fallback(pts);
    }

    let cx = pts.iter().map(|p| p.0).sum::<f32>() / 4.0;
    let cy = pts.iter().map(|p| p.1).sum::<f32>() / 4.0;

    let max_r2 = pts
        .iter()
        .map(|p| (p.0 - cx).powi(2) + (p.1 - cy).powi(2))
        .fold(0.0f32, f32::max);
    let deg_thr = 1e-6 * (max_r2 + 1.0);

    if poly_area2(pts).abs() * 0.5 < deg_thr {
        return lex_fallback(pts);
    }

    let mut v: Vec<Point2f> = pts.to_vec();
    v.sort_by(|a, b| {
        if angle_less(*a, *b, cx, cy) {
            std::cmp::Ordering::Less
        } else if angle_less(*b, *a, cx, cy) {
            std::cmp::Ordering::Greater
        } else {
            std::cmp::Ordering::Equal
        }
    });

    // Rotate so index 0 is the lex-min under (y,x).
    let mut min_idx = 0;
    for i in 1..4 {
        if lex_less(v[i], v[min_idx]) {
            min_idx = i;
        }
    }
    v.rotate_left(min_idx);
    [v[0], v[1], v[2], v[3]]
}

/// Half-plane + cross-product angular comparator around `(cx, cy)`.
fn angle_less(a: Point2f, b: Point2f, cx: f32, cy: f32) -> bool {
    let (ax, ay) = (a.0 - cx, a.1 - cy);
    let (bx, by) = (b.0 - cx, b.1 - cy);

    let half_a = ay > 0.0 || (ay == 0.0 && ax < 0.0);
    let half_b = by > 0.0 || (by == 0.0 && bx < 0.0);
    if half_a != half_b {
        return !half_a; // upper half sorts before lower half
    }

    let cross = ax * by - ay * bx;
    if cross.abs() > EPS_ANG {
        return cross > 0.0;
    }

    // collinear: farther point first, then lex tiebreak.
    let ra = ax * ax + ay * ay;
    let rb = bx * bx + by * by;
    if (ra - rb).abs() > EPS_ANG {
        return ra > rb;
    }
    lex_less(a, b)
}

fn aabb_of(q: &Quad) -> (f32, f32, f32, f32) {
    let xs = q.iter().map(|p| p.0);
    let ys = q.iter().map(|p| p.1);
    (
        xs.clone().fold(f32::INFINITY, f32::min),
        ys.clone().fold(f32::INFINITY, f32::min),
        xs.fold(f32::NEG_INFINITY, f32::max),
        ys.fold(f32::NEG_INFINITY, f32::max),
    )
}

/// Axis-aligned IoU over each quad's tight bounding box.
pub fn aabb_iou(a: &Quad, b: &Quad) -> f32 {
    if !all_finite(a) || !all_finite(b) {
        return 0.0;
    }
    let (ax0, ay0, ax1, ay1) = aabb_of(a);
    let (bx0, by0, bx1, by1) = aabb_of(b);

    let ix0 = ax0.max(bx0);
    let iy0 = ay0.max(by0);
    let ix1 = ax1.min(bx1);
    let iy1 = ay1.min(by1);

    let iw = (ix1 - ix0).max(0.0);
    let ih = (iy1 - iy0).max(0.0);
    let inter = iw * ih;

    let area_a = (ax1 - ax0).max(0.0) * (ay1 - ay0).max(0.0);
    let area_b = (bx1 - bx0).max(0.0) * (by1 - by0).max(0.0);
    let union = area_a + area_b - inter;

    if union <= 1e-6 {
        return 0.0;
    }
    (inter / union).clamp(0.0, 1.0)
}

fn convex_hull(points: &[Point2f]) -> Vec<Point2f> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.partial_cmp(&b.1).unwrap()));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }
    let cross = |o: Point2f, a: Point2f, b: Point2f| (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0);

    let mut lower = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn polygon_area(poly: &[Point2f]) -> f32 {
    if poly.len() < 3 {
        return 0.0;
    }
    let mut a = 0.0f32;
    for i in 0..poly.len() {
        let (x0, y0) = poly[i];
        let (x1, y1) = poly[(i + 1) % poly.len()];
        a += x0 * y1 - x1 * y0;
    }
    (a * 0.5).abs()
}

/// Sutherland-Hodgman clip of `subject` against convex `clip`.
fn clip_convex(subject: &[Point2f], clip: &[Point2f]) -> Vec<Point2f> {
    let mut output = subject.to_vec();
    let n = clip.len();
    for i in 0..n {
        if output.is_empty() {
            break;
        }
        let a = clip[i];
        let b = clip[(i + 1) % n];
        let edge = (b.0 - a.0, b.1 - a.1);
        let inside = |p: Point2f| edge.0 * (p.1 - a.1) - edge.1 * (p.0 - a.0) <= 0.0;
        let intersect = |p: Point2f, q: Point2f| -> Point2f {
            let d1 = edge.0 * (p.1 - a.1) - edge.1 * (p.0 - a.0);
            let d2 = edge.0 * (q.1 - a.1) - edge.1 * (q.0 - a.0);
            let t = d1 / (d1 - d2);
            (p.0 + t * (q.0 - p.0), p.1 + t * (q.1 - p.1))
        };

        let input = output;
        let mut next = Vec::with_capacity(input.len() + 1);
        for j in 0..input.len() {
            let cur = input[j];
            let prev = input[(j + input.len() - 1) % input.len()];
            let cur_in = inside(cur);
            let prev_in = inside(prev);
            if cur_in {
                if !prev_in {
                    next.push(intersect(prev, cur));
                }
                next.push(cur);
            } else if prev_in {
                next.push(intersect(prev, cur));
            }
        }
        output = next;
    }
    output
}

/// Convex-hull-intersection polygon IoU, with degenerate-hull guard and a
/// clamp to `[0,1]` to absorb floating-point noise.
pub fn quad_iou(a: &Quad, b: &Quad, use_fast_iou: bool) -> f32 {
    if use_fast_iou {
        return aabb_iou(a, b);
    }
    if !all_finite(a) || !all_finite(b) {
        return 0.0;
    }
    let hull_a = convex_hull(a);
    let hull_b = convex_hull(b);
    if hull_a.len() < 3 || hull_b.len() < 3 {
        return 0.0;
    }
    let area_a = polygon_area(&hull_a);
    let area_b = polygon_area(&hull_b);
    if area_a <= 1e-9 || area_b <= 1e-9 {
        return 0.0;
    }

    let inter_poly = clip_convex(&hull_a, &hull_b);
    let mut inter_area = polygon_area(&inter_poly);
    inter_area = inter_area.min(area_a.min(area_b));

    let union = area_a + area_b - inter_area;
    if union <= 1e-9 {
        return 0.0;
    }
    (inter_area / union).clamp(0.0, 1.0)
}

/// Clip `contour` to `[0,w) x [0,h)`, rasterize it, and return the mean of
/// `prob` under the rasterized mask. Returns 0 for empty or fully
/// out-of-bounds contours.
pub fn contour_score(prob: &[f32], w: usize, h: usize, contour: &[Point2f]) -> f32 {
    if contour.len() < 3 || w == 0 || h == 0 {
        return 0.0;
    }
    let clipped: Vec<Point2f> = contour
        .iter()
        .map(|&(x, y)| (x.clamp(0.0, (w - 1) as f32), y.clamp(0.0, (h - 1) as f32)))
        .collect();

    let (x0, y0, x1, y1) = aabb_of(&[clipped[0], clipped[1 % clipped.len()], clipped[2 % clipped.len()], clipped[0]]);
    let (bx0, by0, bx1, by1) = clipped.iter().fold((x0, y0, x1, y1), |(x0, y0, x1, y1), &(x, y)| {
        (x0.min(x), y0.min(y), x1.max(x), y1.max(y))
    });
    let rx0 = bx0.floor().max(0.0) as usize;
    let ry0 = by0.floor().max(0.0) as usize;
    let rx1 = (bx1.ceil() as usize).min(w.saturating_sub(1));
    let ry1 = (by1.ceil() as usize).min(h.saturating_sub(1));
    if rx1 < rx0 || ry1 < ry0 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut count = 0u64;
    for y in ry0..=ry1 {
        for x in rx0..=rx1 {
            if point_in_polygon((x as f32 + 0.5, y as f32 + 0.5), &clipped) {
                sum += prob[y * w + x] as f64;
                count += 1;
            }
        }
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}

fn point_in_polygon(p: Point2f, poly: &[Point2f]) -> bool {
    let mut inside = false;
    let n = poly.len();
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = poly[i];
        let (xj, yj) = poly[j];
        if ((yi > p.1) != (yj > p.1)) && (p.0 < (xj - xi) * (p.1 - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
        j = i;
    }
    inside
}

fn align_down32_safe(v: i32) -> i32 {
    (v.max(32)) & !31
}

/// `side <= 0`: align both dims down to 32. `side > 0`: scale the longer
/// side to `side` without upscaling, then align down; both dims are at
/// least 32.
pub fn aspect_fit32(w: i32, h: i32, side: i32) -> (i32, i32) {
    if side <= 0 {
        return (align_down32_safe(w), align_down32_safe(h));
    }
    let max_side = w.max(h).max(1);
    let (tw, th) = if max_side > side {
        let scale = side as f32 / max_side as f32;
        ((w as f32 * scale).round().max(1.0) as i32, (h as f32 * scale).round().max(1.0) as i32)
    } else {
        (w, h)
    };
    (align_down32_safe(tw), align_down32_safe(th))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_quad_shuffled_axis_aligned_rect() {
        let input: Quad = [(10.0, 80.0), (60.0, 20.0), (60.0, 80.0), (10.0, 20.0)];
        let out = order_quad(&input);
        assert_eq!(out, [(10.0, 20.0), (60.0, 20.0), (60.0, 80.0), (10.0, 80.0)]);
    }

    #[test]
    fn order_quad_is_permutation_of_input() {
        let input: Quad = [(0.0, 0.0), (5.0, 1.0), (4.0, 6.0), (-1.0, 5.0)];
        let out = order_quad(&input);
        let mut a: Vec<_> = input.to_vec();
        let mut b: Vec<_> = out.to_vec();
        a.sort_by(|p, q| p.partial_cmp(q).unwrap());
        b.sort_by(|p, q| p.partial_cmp(q).unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn order_quad_non_finite_uses_lex_fallback() {
        let input: Quad = [(0.0, 0.0), (f32::NAN, 1.0), (4.0, 6.0), (-1.0, 5.0)];
        let out = order_quad(&input);
        assert!(out.iter().any(|p| p.0.is_nan()));
    }

    #[test]
    fn aabb_iou_identical_is_one() {
        let q: Quad = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        assert!((aabb_iou(&q, &q) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn quad_iou_symmetric_and_translation_invariant() {
        let a: Quad = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let b: Quad = [(5.0, 5.0), (15.0, 5.0), (15.0, 15.0), (5.0, 15.0)];
        let iou_ab = quad_iou(&a, &b, false);
        let iou_ba = quad_iou(&b, &a, false);
        assert!((iou_ab - iou_ba).abs() < 1e-4);
        assert!((0.0..=1.0).contains(&iou_ab));

        let shift = |q: &Quad, dx: f32, dy: f32| -> Quad {
            [(q[0].0 + dx, q[0].1 + dy), (q[1].0 + dx, q[1].1 + dy), (q[2].0 + dx, q[2].1 + dy), (q[3].0 + dx, q[3].1 + dy)]
        };
        let a2 = shift(&a, 3.0, -2.0);
        let b2 = shift(&b, 3.0, -2.0);
        let iou_shifted = quad_iou(&a2, &b2, false);
        assert!((iou_ab - iou_shifted).abs() < 1e-4);
    }

    #[test]
    fn aspect_fit32_no_side_aligns_down() {
        assert_eq!(aspect_fit32(100, 70, 0), (96, 64));
    }

    #[test]
    fn aspect_fit32_scales_longer_side_without_upscale() {
        let (w, h) = aspect_fit32(2000, 1000, 960);
        assert!(w <= 960 + 32);
        assert_eq!(w % 32, 0);
        assert_eq!(h % 32, 0);

        // smaller than target side: no upscale, only alignment.
        let (w2, h2) = aspect_fit32(100, 50, 960);
        assert_eq!(w2, 96);
        assert_eq!(h2, 32);
    }

    #[test]
    fn contour_score_empty_is_zero() {
        let prob = vec![1.0f32; 100];
        assert_eq!(contour_score(&prob, 10, 10, &[]), 0.0);
    }

    #[test]
    fn contour_score_full_square_is_mean_one() {
        let prob = vec![1.0f32; 100];
        let contour = vec![(0.0, 0.0), (9.0, 0.0), (9.0, 9.0), (0.0, 9.0)];
        let score = contour_score(&prob, 10, 10, &contour);
        assert!((score - 1.0).abs() < 1e-6);
    }
}
