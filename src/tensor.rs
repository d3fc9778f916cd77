//! Tensor shape classification and layout-aware plane extraction.
//!
//! Grounded on `original_source/src/lib/idet/internal/ort_tensor.h`. The
//! inference runtime (`ort`) reports shapes as `Vec<i64>`; dynamic dims are
//! sometimes reported as `<= 0` and are treated as `1` for safe arithmetic
//! only (never for spatial decisions).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Unknown,
    Nchw,
    Nhwc,
    N1hw,
    FlatNc,
    Hw,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub shape: Vec<i64>,
    pub layout: TensorLayout,
    pub n: i64,
    pub c: i64,
    pub h: i64,
    pub w: i64,
    pub numel: usize,
}

fn safe_dim(v: i64) -> i64 {
    if v > 0 {
        v
    } else {
        1
    }
}

fn looks_small_channel(x: i64) -> bool {
    x > 0 && x <= 16
}

fn safe_numel(shape: &[i64]) -> usize {
    shape.iter().map(|&d| safe_dim(d) as usize).product()
}

/// Classify a probability-map-like tensor shape into a normalized
/// `(N,C,H,W)` descriptor. Rank-4 tensors are disambiguated between NCHW
/// and NHWC by "which interpretation has a small channel dim"; if both
/// look plausible, the larger spatial area wins, with NHWC as the tie
/// policy.
pub fn make_desc_probmap(shape: &[i64]) -> TensorDesc {
    let numel = safe_numel(shape);
    match shape.len() {
        4 => {
            let nchw_ok = looks_small_channel(shape[1]);
            let nhwc_ok = looks_small_channel(shape[3]);
            let (layout, n, c, h, w) = if nchw_ok && nhwc_ok {
                let area_chw = safe_dim(shape[2]) * safe_dim(shape[3]);
                let area_hwc = safe_dim(shape[1]) * safe_dim(shape[2]);
                if area_chw > area_hwc {
                    (TensorLayout::Nchw, shape[0], shape[1], shape[2], shape[3])
                } else {
                    (TensorLayout::Nhwc, shape[0], shape[3], shape[1], shape[2])
                }
            } else if nchw_ok {
                (TensorLayout::Nchw, shape[0], shape[1], shape[2], shape[3])
            } else if nhwc_ok {
                (TensorLayout::Nhwc, shape[0], shape[3], shape[1], shape[2])
            } else {
                (TensorLayout::Unknown, 0, 0, 0, 0)
            };
            TensorDesc { shape: shape.to_vec(), layout, n: safe_dim(n), c: safe_dim(c), h: safe_dim(h), w: safe_dim(w), numel }
        }
        3 => TensorDesc {
            shape: shape.to_vec(),
            layout: TensorLayout::N1hw,
            n: safe_dim(shape[0]),
            c: 1,
            h: safe_dim(shape[1]),
            w: safe_dim(shape[2]),
            numel,
        },
        2 => TensorDesc {
            shape: shape.to_vec(),
            layout: TensorLayout::Hw,
            n: 1,
            c: 1,
            h: safe_dim(shape[0]),
            w: safe_dim(shape[1]),
            numel,
        },
        _ => TensorDesc { shape: shape.to_vec(), layout: TensorLayout::Unknown, n: 0, c: 0, h: 0, w: 0, numel },
    }
}

/// Returns an `H*W` contiguous plane for batch 0, channel `channel`
/// (clamped to `[0, C-1]`). NCHW/N1HW/HW alias `data`; NHWC gathers into
/// `scratch` (resized to `H*W`) and returns a view of it.
pub fn extract_hw_channel<'a>(data: &'a [f32], desc: &TensorDesc, channel: usize, scratch: &'a mut Vec<f32>) -> &'a [f32] {
    let h = desc.h.max(0) as usize;
    let w = desc.w.max(0) as usize;
    let hw = h * w;
    let c = desc.c.max(1) as usize;
    let ch = channel.min(c.saturating_sub(1));

    match desc.layout {
        TensorLayout::Nchw | TensorLayout::N1hw | TensorLayout::Hw => {
            let start = ch * hw;
            &data[start..start + hw]
        }
        TensorLayout::Nhwc => {
            scratch.clear();
            scratch.reserve(hw);
            for i in 0..hw {
                scratch.push(data[i * c + ch]);
            }
            &scratch[..]
        }
        TensorLayout::FlatNc | TensorLayout::Unknown => {
            scratch.clear();
            scratch.resize(hw, 0.0);
            &scratch[..]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disambiguates_nchw() {
        let d = make_desc_probmap(&[1, 2, 64, 64]);
        assert_eq!(d.layout, TensorLayout::Nchw);
        assert_eq!((d.c, d.h, d.w), (2, 64, 64));
    }

    #[test]
    fn disambiguates_nhwc() {
        let d = make_desc_probmap(&[1, 64, 128, 2]);
        assert_eq!(d.layout, TensorLayout::Nhwc);
        assert_eq!((d.c, d.h, d.w), (2, 64, 128));
    }

    #[test]
    fn rank3_is_n1hw() {
        let d = make_desc_probmap(&[1, 100, 200]);
        assert_eq!(d.layout, TensorLayout::N1hw);
        assert_eq!((d.c, d.h, d.w), (1, 100, 200));
    }

    #[test]
    fn classification_is_idempotent() {
        let shape = [1, 1, 32, 48];
        let a = make_desc_probmap(&shape);
        let b = make_desc_probmap(&shape);
        assert_eq!(a, b);
    }

    #[test]
    fn extract_nchw_aliases_input_buffer() {
        let data: Vec<f32> = (0..(2 * 3 * 4)).map(|v| v as f32).collect();
        let desc = make_desc_probmap(&[1, 2, 3, 4]);
        let mut scratch = Vec::new();
        let plane = extract_hw_channel(&data, &desc, 1, &mut scratch);
        assert_eq!(plane.as_ptr(), data[12..].as_ptr());
    }

    #[test]
    fn extract_nhwc_gathers_into_scratch() {
        // shape [1,2,3,2]: H=2,W=3,C=2
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let desc = make_desc_probmap(&[1, 2, 3, 2]);
        let mut scratch = Vec::new();
        let plane = extract_hw_channel(&data, &desc, 0, &mut scratch);
        assert_eq!(plane, &[0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }
}
