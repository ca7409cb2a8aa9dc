//! detection — face/eye detector seam + SeetaFace backend
//!
//! The pipeline only ever talks to the [`FaceDetector`] / [`EyeDetector`]
//! traits: a grayscale plane in, axis-aligned boxes out, synchronously.
//! [`RustfaceDetector`] is the bundled face backend; [`ScaledDetector`]
//! wraps any backend to run detection on a downscaled plane for large
//! frames and map the boxes back to source coordinates.

use anyhow::{Context, Result};
use fast_image_resize as fr;
use std::path::Path;
use tracing::warn;

use crate::video::GrayPlane;

// ── Tuning constants ─────────────────────────────────────────────────────────

/// Detection pyramid scale step between levels.
pub const SCALE_FACTOR: f32 = 1.1;
/// Minimum neighboring detections for a face to be kept.
pub const MIN_NEIGHBORS: u32 = 6;
/// Smallest face edge (pixels) worth reporting.
const MIN_FACE_SIZE: u32 = 20;
/// SeetaFace classifier score threshold.
const SCORE_THRESH: f64 = 2.0;
/// Run detection on a downscaled plane above this dimension and map boxes
/// back to source coordinates.
const DETECTION_MAX_DIM: u32 = 960;

/// Detector sensitivity parameters.  Fixed by the pipeline; individual
/// backends interpret what they can and ignore the rest.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    pub scale_factor: f32,
    pub min_neighbors: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: SCALE_FACTOR,
            min_neighbors: MIN_NEIGHBORS,
        }
    }
}

// ── Public types ─────────────────────────────────────────────────────────────

/// Axis-aligned bounding box in pixel coordinates of the plane it was
/// detected on.  Produced per frame, consumed within the same frame.
#[derive(Debug, Clone, Copy)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
    /// Translate by an origin offset (eye boxes are ROI-local).
    pub fn offset_by(&self, dx: f32, dy: f32) -> FaceBox {
        FaceBox {
            x: self.x + dx,
            y: self.y + dy,
            ..*self
        }
    }
    /// Scale all coordinates (mapping between plane resolutions).
    pub fn scaled(&self, sx: f32, sy: f32) -> FaceBox {
        FaceBox {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

/// External face detector collaborator: grayscale plane + sensitivity
/// parameters in, boxes in plane coordinates out.  Synchronous.
pub trait FaceDetector {
    fn detect(&mut self, plane: &GrayPlane, params: &DetectorParams) -> Vec<FaceBox>;
}

/// External eye detector collaborator.  Invoked on a face's region of
/// interest; returned boxes are relative to that ROI.
pub trait EyeDetector {
    fn detect(&mut self, roi: &GrayPlane) -> Vec<FaceBox>;
}

// ── SeetaFace backend ────────────────────────────────────────────────────────

/// Face detector backed by the `rustface` crate (SeetaFace engine).
///
/// Loads its model file once at startup; a load failure is fatal before the
/// render loop ever starts.
pub struct RustfaceDetector {
    detector: Box<dyn rustface::Detector>,
}

impl RustfaceDetector {
    /// Load a SeetaFace frontal-face model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let bytes = std::fs::read(model_path.as_ref()).with_context(|| {
            format!(
                "failed to read face model: {}",
                model_path.as_ref().display()
            )
        })?;
        let model = rustface::read_model(std::io::Cursor::new(bytes))
            .map_err(|e| anyhow::anyhow!("failed to parse SeetaFace model: {e:?}"))?;

        let mut detector = rustface::create_detector_with_model(model);
        detector.set_min_face_size(MIN_FACE_SIZE);
        detector.set_score_thresh(SCORE_THRESH);
        detector.set_slide_window_step(4, 4);

        Ok(Self { detector })
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(&mut self, plane: &GrayPlane, params: &DetectorParams) -> Vec<FaceBox> {
        // SeetaFace walks its pyramid by a shrink ratio — the inverse of the
        // cascade-style scale factor.  min_neighbors has no SeetaFace analog.
        self.detector
            .set_pyramid_scale_factor(1.0 / params.scale_factor);

        let image = rustface::ImageData::new(&plane.data, plane.width, plane.height);
        self.detector
            .detect(&image)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                FaceBox {
                    x: bbox.x() as f32,
                    y: bbox.y() as f32,
                    width: bbox.width() as f32,
                    height: bbox.height() as f32,
                }
            })
            .collect()
    }
}

// ── Downscaling wrapper ──────────────────────────────────────────────────────

/// Runs the wrapped detector on a downscaled plane when the frame exceeds
/// [`DETECTION_MAX_DIM`], then maps boxes back to source coordinates.  Box
/// widths stay in source pixels, which is what the calibration model expects.
pub struct ScaledDetector<D> {
    inner: D,
    resizer: fr::Resizer,
    scaled_buf: Vec<u8>,
    max_dim: u32,
}

impl<D: FaceDetector> ScaledDetector<D> {
    pub fn new(inner: D) -> Self {
        Self::with_max_dim(inner, DETECTION_MAX_DIM)
    }

    pub fn with_max_dim(inner: D, max_dim: u32) -> Self {
        Self {
            inner,
            resizer: fr::Resizer::new(),
            scaled_buf: Vec::new(),
            max_dim: max_dim.max(1),
        }
    }

    fn downscale(&mut self, plane: &GrayPlane, out_w: u32, out_h: u32) -> Result<GrayPlane> {
        let src = fr::images::ImageRef::new(plane.width, plane.height, &plane.data, fr::PixelType::U8)
            .context("failed to create detection downscale source")?;

        let out_len = (out_w * out_h) as usize;
        if self.scaled_buf.len() != out_len {
            self.scaled_buf.resize(out_len, 0);
        }

        let mut dst = fr::images::Image::from_vec_u8(
            out_w,
            out_h,
            std::mem::take(&mut self.scaled_buf),
            fr::PixelType::U8,
        )
        .context("failed to create detection downscale destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("failed to downscale plane for detection")?;

        let data = dst.into_vec();
        Ok(GrayPlane {
            data,
            width: out_w,
            height: out_h,
        })
    }
}

impl<D: FaceDetector> FaceDetector for ScaledDetector<D> {
    fn detect(&mut self, plane: &GrayPlane, params: &DetectorParams) -> Vec<FaceBox> {
        let max_dim = plane.width.max(plane.height);
        if max_dim <= self.max_dim || plane.width == 0 || plane.height == 0 {
            return self.inner.detect(plane, params);
        }

        let scale = self.max_dim as f32 / max_dim as f32;
        let scaled_w = ((plane.width as f32 * scale).round() as u32).max(1);
        let scaled_h = ((plane.height as f32 * scale).round() as u32).max(1);

        let scaled = match self.downscale(plane, scaled_w, scaled_h) {
            Ok(scaled) => scaled,
            Err(e) => {
                warn!("detection downscale failed, detecting at full size: {e}");
                return self.inner.detect(plane, params);
            }
        };

        let boxes = self.inner.detect(&scaled, params);
        self.scaled_buf = scaled.data;

        let sx = plane.width as f32 / scaled_w as f32;
        let sy = plane.height as f32 / scaled_h as f32;
        boxes.into_iter().map(|b| b.scaled(sx, sy)).collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct StubDetector {
        seen: Vec<(u32, u32)>,
        boxes: Vec<FaceBox>,
    }

    impl FaceDetector for StubDetector {
        fn detect(&mut self, plane: &GrayPlane, _params: &DetectorParams) -> Vec<FaceBox> {
            self.seen.push((plane.width, plane.height));
            self.boxes.clone()
        }
    }

    #[test]
    fn face_box_offset_and_scale() {
        let b = FaceBox {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 40.0,
        };
        let moved = b.offset_by(5.0, 5.0);
        assert_eq!(moved.x, 15.0);
        assert_eq!(moved.y, 25.0);
        assert_eq!(moved.width, 30.0);
        assert_eq!(b.right(), 40.0);
        assert_eq!(b.bottom(), 60.0);

        let scaled = b.scaled(2.0, 0.5);
        assert_eq!(scaled.x, 20.0);
        assert_eq!(scaled.y, 10.0);
        assert_eq!(scaled.width, 60.0);
        assert_eq!(scaled.height, 20.0);
    }

    #[test]
    fn small_planes_pass_through_unscaled() {
        let stub = StubDetector {
            seen: Vec::new(),
            boxes: Vec::new(),
        };
        let mut detector = ScaledDetector::with_max_dim(stub, 100);
        let plane = GrayPlane {
            data: vec![0; 80 * 60],
            width: 80,
            height: 60,
        };
        detector.detect(&plane, &DetectorParams::default());
        assert_eq!(detector.inner.seen, vec![(80, 60)]);
    }

    #[test]
    fn large_planes_are_downscaled_and_boxes_mapped_back() {
        let stub = StubDetector {
            seen: Vec::new(),
            boxes: vec![FaceBox {
                x: 10.0,
                y: 10.0,
                width: 20.0,
                height: 20.0,
            }],
        };
        let mut detector = ScaledDetector::with_max_dim(stub, 50);
        let plane = GrayPlane {
            data: vec![128; 100 * 100],
            width: 100,
            height: 100,
        };
        let boxes = detector.detect(&plane, &DetectorParams::default());

        // Detection ran at half resolution.
        assert_eq!(detector.inner.seen, vec![(50, 50)]);
        // Boxes are mapped back to source coordinates.
        assert_eq!(boxes.len(), 1);
        assert!((boxes[0].x - 20.0).abs() < 1e-3);
        assert!((boxes[0].y - 20.0).abs() < 1e-3);
        assert!((boxes[0].width - 40.0).abs() < 1e-3);
        assert!((boxes[0].height - 40.0).abs() < 1e-3);
    }
}
