//! Non-owning and owning/shared image descriptors, grounded on
//! `idet/image.h`. Decoding from disk is delegated to the `image` crate
//! (an external collaborator per spec.md §1); this module only describes
//! the pixel-buffer contract the engines consume.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    Bgr8,
    Rgba8,
    Bgra8,
}

impl PixelFormat {
    pub const fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 | PixelFormat::Bgr8 => 3,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }
}

/// A non-owning view over interleaved pixel memory. The caller guarantees
/// the backing memory outlives the view.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    pub format: PixelFormat,
}

impl<'a> ImageView<'a> {
    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn min_row_bytes(&self) -> u32 {
        self.width * self.format.channels() as u32
    }

    pub fn tightly_packed(&self) -> bool {
        self.stride_bytes == self.min_row_bytes()
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.stride_bytes >= self.min_row_bytes()
    }

    pub fn empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// An owning or co-owning image. Ownership is decided at construction: a
/// plain byte buffer wrapped in `Arc` (deep copy / adopted), or no token at
/// all (pure borrow via `Image::view`). The release side effect, if any,
/// runs when the last `Arc` clone drops — this models the original's
/// "shared owner holding a releaser closure" (spec.md §9) without needing a
/// type-erased deleter: `Arc<dyn Any + Send + Sync>` captures any drop glue.
#[derive(Clone)]
pub struct Image {
    data: Arc<[u8]>,
    owner: Option<Arc<dyn Any + Send + Sync>>,
    width: u32,
    height: u32,
    stride_bytes: u32,
    format: PixelFormat,
}

impl Image {
    /// Deep-copies `src` into a freshly owned buffer.
    pub fn copy_from(format: PixelFormat, width: u32, height: u32, src: &[u8], src_stride: u32) -> Result<Self> {
        let view = ImageView { data: src, width, height, stride_bytes: src_stride, format };
        if !view.is_valid() {
            return Err(Status::invalid("Image::copy_from: invalid source view"));
        }
        let row_bytes = view.min_row_bytes() as usize;
        let mut out = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * src_stride as usize;
            out.extend_from_slice(&src[start..start + row_bytes]);
        }
        Ok(Self {
            data: out.into(),
            owner: None,
            width,
            height,
            stride_bytes: row_bytes as u32,
            format,
        })
    }

    /// Adopts an externally-owned buffer plus a releaser value whose `Drop`
    /// impl performs the release side effect; kept alive for as long as any
    /// clone of this `Image` is alive.
    pub fn adopt<T: Any + Send + Sync>(
        format: PixelFormat,
        width: u32,
        height: u32,
        data: Arc<[u8]>,
        stride_bytes: u32,
        releaser: T,
    ) -> Result<Self> {
        let img = Self { data, owner: Some(Arc::new(releaser)), width, height, stride_bytes, format };
        if !img.view().is_valid() {
            return Err(Status::invalid("Image::adopt: invalid view"));
        }
        Ok(img)
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView { data: &self.data, width: self.width, height: self.height, stride_bytes: self.stride_bytes, format: self.format }
    }

    pub fn owner(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.owner.as_ref()
    }
}

/// Loads an image from disk and converts to BGR8, delegating decoding to
/// the `image` crate. Flips vertically first when `flip_y` is set.
pub fn load_image(path: impl AsRef<Path>, flip_y: bool) -> Result<Image> {
    let mut dyn_img = ::image::open(path.as_ref())
        .map_err(|e| Status::decode_error(format!("load_image: {e}")))?;
    if flip_y {
        dyn_img = dyn_img.flipv();
    }
    let rgb = dyn_img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let mut bgr = Vec::with_capacity((w * h * 3) as usize);
    for px in rgb.pixels() {
        bgr.push(px.2[2]);
        bgr.push(px.2[1]);
        bgr.push(px.2[0]);
    }
    Image::copy_from(PixelFormat::Bgr8, w, h, &bgr, w * 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_validity_matches_stride_and_dims() {
        let data = vec![0u8; 300];
        let v = ImageView { data: &data, width: 10, height: 10, stride_bytes: 30, format: PixelFormat::Rgb8 };
        assert!(v.is_valid());
        assert!(v.tightly_packed());

        let bad = ImageView { data: &data, width: 0, height: 10, stride_bytes: 30, format: PixelFormat::Rgb8 };
        assert!(!bad.is_valid());

        let short_stride = ImageView { data: &data, width: 10, height: 10, stride_bytes: 20, format: PixelFormat::Rgb8 };
        assert!(!short_stride.is_valid());
    }

    #[test]
    fn copy_from_deep_copies_and_repacks_stride() {
        // 1x2 RGB (min_row_bytes = 1*3 = 3) with a padded stride of 8
        // bytes/row; the trailing 5 bytes of each row are padding and must
        // not survive the repack.
        let src = [
            1, 2, 3, 9, 9, 9, 9, 9, // row 0: px(1,2,3), padding
            4, 5, 6, 9, 9, 9, 9, 9, // row 1: px(4,5,6), padding
        ];
        let img = Image::copy_from(PixelFormat::Rgb8, 1, 2, &src, 8).unwrap();
        let v = img.view();
        assert_eq!(v.stride_bytes, 3);
        assert_eq!(v.data, &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn adopt_keeps_releaser_alive_until_drop() {
        use std::sync::atomic::{AtomicBool, Ordering};
        struct Releaser(Arc<AtomicBool>);
        impl Drop for Releaser {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }
        let released = Arc::new(AtomicBool::new(false));
        let data: Arc<[u8]> = vec![0u8; 12].into();
        let img = Image::adopt(PixelFormat::Rgb8, 2, 2, data, 6, Releaser(released.clone())).unwrap();
        let clone = img.clone();
        drop(img);
        assert!(!released.load(Ordering::SeqCst));
        drop(clone);
        assert!(released.load(Ordering::SeqCst));
    }
}
