//! pipeline — per-frame detection → distance → annotation
//!
//! One [`Annotator`] instance runs once per captured frame: grayscale the
//! frame, detect faces, query the calibration model with each face's width,
//! draw boxes/eye boxes/labels in place, and report what happened.  Nothing
//! is persisted across frames except profiling counters; all transient
//! conditions (no faces, malformed frame) are absorbed here and never
//! propagate.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::calibration::{round_display, DistanceModel};
use crate::detection::{DetectorParams, EyeDetector, FaceDetector};
use crate::rendering::{
    draw_box, draw_label, DISPLAYED_FPS_POS, DISTANCE_COLOR, DISTANCE_POS, DISTANCE_SCALE,
    EYE_COLOR, FACE_COLOR, LABEL_COLOR, LABEL_SCALE, READ_FPS_POS,
};
use crate::video::{gray_plane, FpsSnapshot, RgbFrame};

/// What one frame's pass produced.  `distance` is the displayed value: the
/// last processed face wins, and it resets to `0` when no face is present.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub faces: usize,
    pub distance: f64,
    pub distance_label: String,
    /// False when the frame was malformed and annotation was skipped.
    pub annotated: bool,
}

impl FrameReport {
    fn skipped() -> Self {
        Self {
            faces: 0,
            distance: 0.0,
            distance_label: String::new(),
            annotated: false,
        }
    }
}

/// The per-frame worker.  Owns the calibration model and detector
/// collaborators for the process lifetime.
pub struct Annotator {
    model: DistanceModel,
    faces: Box<dyn FaceDetector>,
    eyes: Option<Box<dyn EyeDetector>>,
    params: DetectorParams,
    show_fps: bool,
    prof_frames: u64,
    prof_detect: Duration,
}

impl Annotator {
    pub fn new(model: DistanceModel, faces: Box<dyn FaceDetector>, show_fps: bool) -> Self {
        Self {
            model,
            faces,
            eyes: None,
            params: DetectorParams::default(),
            show_fps,
            prof_frames: 0,
            prof_detect: Duration::ZERO,
        }
    }

    /// Attach an eye detector; eye boxes are drawn inside each face's region
    /// of interest.
    pub fn with_eye_detector(mut self, eyes: Box<dyn EyeDetector>) -> Self {
        self.eyes = Some(eyes);
        self
    }

    /// Process one frame in place and report the displayed distance.
    pub fn annotate(&mut self, frame: &mut RgbFrame, fps: &FpsSnapshot) -> FrameReport {
        if frame.width == 0
            || frame.height == 0
            || frame.data.len() != (frame.width * frame.height * 3) as usize
        {
            warn!(
                width = frame.width,
                height = frame.height,
                len = frame.data.len(),
                "skipping malformed frame"
            );
            return FrameReport::skipped();
        }

        let gray = gray_plane(frame);

        let detect_start = Instant::now();
        let boxes = self.faces.detect(&gray, &self.params);
        self.prof_detect += detect_start.elapsed();

        let mut distance = 0.0;
        for b in &boxes {
            distance = round_display(self.model.evaluate(b.width as f64));
            debug!(distance, width = b.width, "face distance");

            draw_box(frame, *b, FACE_COLOR);

            if let Some(eyes) = self.eyes.as_mut() {
                let roi = gray.region(
                    b.x.max(0.0) as u32,
                    b.y.max(0.0) as u32,
                    b.width as u32,
                    b.height as u32,
                );
                for eye in eyes.detect(&roi) {
                    draw_box(frame, eye.offset_by(b.x, b.y), EYE_COLOR);
                }
            }
        }

        if self.show_fps {
            draw_label(
                frame,
                &format!("Frames Displayed (PS): {}", fps.frames_displayed_per_second),
                DISPLAYED_FPS_POS,
                LABEL_SCALE,
                LABEL_COLOR,
            );
            draw_label(
                frame,
                &format!("Frames Read (PS): {}", fps.frames_read_per_second),
                READ_FPS_POS,
                LABEL_SCALE,
                LABEL_COLOR,
            );
        }

        let distance_label = format!("Dist: {distance:.1}m");
        draw_label(
            frame,
            &distance_label,
            DISTANCE_POS,
            DISTANCE_SCALE,
            DISTANCE_COLOR,
        );

        self.prof_frames += 1;
        if self.prof_frames > 0 && self.prof_frames % 300 == 0 {
            info!(
                frames = self.prof_frames,
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "pipeline detect timings"
            );
        }

        FrameReport {
            faces: boxes.len(),
            distance,
            distance_label,
            annotated: true,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationSample, CalibrationTable, FitMode};
    use crate::detection::FaceBox;
    use crate::video::GrayPlane;

    struct StubFaces(Vec<FaceBox>);
    impl FaceDetector for StubFaces {
        fn detect(&mut self, _plane: &GrayPlane, _params: &DetectorParams) -> Vec<FaceBox> {
            self.0.clone()
        }
    }

    struct StubEyes(Vec<FaceBox>);
    impl EyeDetector for StubEyes {
        fn detect(&mut self, _roi: &GrayPlane) -> Vec<FaceBox> {
            self.0.clone()
        }
    }

    fn test_model() -> DistanceModel {
        let table = CalibrationTable::from_samples(vec![
            CalibrationSample {
                width: 50.0,
                distance: 3.0,
            },
            CalibrationSample {
                width: 100.0,
                distance: 1.5,
            },
            CalibrationSample {
                width: 150.0,
                distance: 1.0,
            },
        ]);
        DistanceModel::fit(&table, FitMode::Interpolate).unwrap()
    }

    fn blank_frame(width: u32, height: u32) -> RgbFrame {
        RgbFrame {
            data: vec![0; (width * height * 3) as usize],
            width,
            height,
            pts: 0,
        }
    }

    fn face(x: f32, y: f32, width: f32, height: f32) -> FaceBox {
        FaceBox {
            x,
            y,
            width,
            height,
        }
    }

    fn count_color(frame: &RgbFrame, color: [u8; 3]) -> usize {
        frame
            .data
            .chunks_exact(3)
            .filter(|px| **px == color)
            .count()
    }

    #[test]
    fn zero_faces_resets_distance_and_draws_no_boxes() {
        let mut annotator = Annotator::new(test_model(), Box::new(StubFaces(Vec::new())), false);
        let mut frame = blank_frame(320, 240);
        let report = annotator.annotate(&mut frame, &FpsSnapshot::default());

        assert_eq!(report.faces, 0);
        assert_eq!(report.distance, 0.0);
        assert!(report.annotated);
        assert_eq!(count_color(&frame, crate::rendering::FACE_COLOR), 0);
    }

    #[test]
    fn sampled_width_yields_the_tabulated_distance_label() {
        let boxes = vec![face(40.0, 40.0, 100.0, 100.0)];
        let mut annotator = Annotator::new(test_model(), Box::new(StubFaces(boxes)), true);
        let mut frame = blank_frame(320, 240);
        let report = annotator.annotate(&mut frame, &FpsSnapshot::default());

        assert_eq!(report.faces, 1);
        assert_eq!(report.distance, 1.5);
        assert_eq!(report.distance_label, "Dist: 1.5m");
        assert!(count_color(&frame, crate::rendering::FACE_COLOR) > 0);
    }

    #[test]
    fn last_processed_face_wins() {
        let boxes = vec![face(0.0, 0.0, 50.0, 50.0), face(100.0, 100.0, 150.0, 150.0)];
        let mut annotator = Annotator::new(test_model(), Box::new(StubFaces(boxes)), false);
        let mut frame = blank_frame(400, 400);
        let report = annotator.annotate(&mut frame, &FpsSnapshot::default());

        assert_eq!(report.faces, 2);
        // Width 150 maps to 1.0; the earlier face's 3.0 was overwritten.
        assert_eq!(report.distance, 1.0);
    }

    #[test]
    fn eye_boxes_are_drawn_offset_into_the_face() {
        let boxes = vec![face(50.0, 50.0, 100.0, 100.0)];
        let eyes = vec![face(10.0, 20.0, 15.0, 10.0)];
        let mut annotator = Annotator::new(test_model(), Box::new(StubFaces(boxes)), false)
            .with_eye_detector(Box::new(StubEyes(eyes)));
        let mut frame = blank_frame(320, 240);
        annotator.annotate(&mut frame, &FpsSnapshot::default());

        // Eye rect top-left lands at face origin + ROI-local offset.
        let base = ((70 * frame.width + 60) * 3) as usize;
        assert_eq!(
            [frame.data[base], frame.data[base + 1], frame.data[base + 2]],
            crate::rendering::EYE_COLOR
        );
    }

    #[test]
    fn malformed_frames_are_skipped_without_panic() {
        let mut annotator = Annotator::new(
            test_model(),
            Box::new(StubFaces(vec![face(0.0, 0.0, 100.0, 100.0)])),
            true,
        );
        let mut frame = RgbFrame {
            data: vec![0; 5],
            width: 320,
            height: 240,
            pts: 0,
        };
        let report = annotator.annotate(&mut frame, &FpsSnapshot::default());
        assert!(!report.annotated);
        assert_eq!(report.distance, 0.0);
    }

    #[test]
    fn fps_labels_only_appear_when_enabled() {
        let mut with_fps = Annotator::new(test_model(), Box::new(StubFaces(Vec::new())), true);
        let mut frame_a = blank_frame(320, 240);
        with_fps.annotate(&mut frame_a, &FpsSnapshot::default());
        assert!(count_color(&frame_a, crate::rendering::LABEL_COLOR) > 0);

        let mut without_fps = Annotator::new(test_model(), Box::new(StubFaces(Vec::new())), false);
        let mut frame_b = blank_frame(320, 240);
        without_fps.annotate(&mut frame_b, &FpsSnapshot::default());
        assert_eq!(count_color(&frame_b, crate::rendering::LABEL_COLOR), 0);
    }
}
