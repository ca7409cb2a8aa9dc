//! video — FFmpeg bridge + frame-rate bookkeeping
//!
//! Opens a video, hands every decoded frame to a caller-supplied annotation
//! callback as packed RGB24, and re-encodes the result as H.264.  The
//! annotator mutates frames in place and never changes their dimensions, so
//! the encoder is set up once, up front, from the source stream.
//!
//! The callback also receives read-only per-second frame counters maintained
//! here, and returns a continue/stop value that is polled once per frame —
//! the only cancellation point; a frame is never interrupted mid-processing.

use std::ops::ControlFlow;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{
    codec, encoder, format, frame, media, software::scaling, util::rational::Rational,
};
use rayon::prelude::*;
use tracing::{debug, info};

/// Output pixel format for the encoder (YUV420p is universally compatible).
const ENCODE_FORMAT: format::Pixel = format::Pixel::YUV420P;
/// Scaling flags — bilinear is fast and good enough for the decode→encode path.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

// ── Frame types ──────────────────────────────────────────────────────────────

/// A single decoded video frame in RGB24 format, along with its presentation
/// timestamp (in the source stream's time-base units).
pub struct RgbFrame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub pts: i64,
}

/// A single-channel grayscale plane, detached from the color frame so the
/// color data stays untouched for annotation.
#[derive(Debug, Clone)]
pub struct GrayPlane {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayPlane {
    /// Copy out a sub-rectangle, clamped to the plane bounds.  Used to hand
    /// a face's region of interest to the eye detector.
    pub fn region(&self, x: u32, y: u32, w: u32, h: u32) -> GrayPlane {
        let x = x.min(self.width);
        let y = y.min(self.height);
        let w = w.min(self.width - x);
        let h = h.min(self.height - y);

        let mut data = Vec::with_capacity((w * h) as usize);
        let stride = self.width as usize;
        for row in 0..h as usize {
            let start = (y as usize + row) * stride + x as usize;
            data.extend_from_slice(&self.data[start..start + w as usize]);
        }
        GrayPlane {
            data,
            width: w,
            height: h,
        }
    }
}

/// Extract a grayscale plane from an RGB frame (BT.601 luminance).
pub fn gray_plane(frame: &RgbFrame) -> GrayPlane {
    let mut data = vec![0u8; (frame.width * frame.height) as usize];
    let src = &frame.data;
    data.par_iter_mut().enumerate().for_each(|(idx, px)| {
        let base = idx * 3;
        *px = (0.299 * src[base] as f32
            + 0.587 * src[base + 1] as f32
            + 0.114 * src[base + 2] as f32) as u8;
    });
    GrayPlane {
        data,
        width: frame.width,
        height: frame.height,
    }
}

// ── Frame-rate counters ──────────────────────────────────────────────────────

/// Frames-per-wall-clock-second counter over one-second windows.
pub struct FpsCounter {
    window_start: Option<Instant>,
    in_window: u32,
    last: u32,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            window_start: None,
            in_window: 0,
            last: 0,
        }
    }

    /// Record one frame.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now());
    }

    fn tick_at(&mut self, now: Instant) {
        match self.window_start {
            None => self.window_start = Some(now),
            Some(start) if now.duration_since(start) >= Duration::from_secs(1) => {
                self.last = self.in_window;
                self.in_window = 0;
                self.window_start = Some(now);
            }
            _ => {}
        }
        self.in_window += 1;
    }

    /// Count from the last completed one-second window.
    pub fn per_second(&self) -> u32 {
        self.last
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of the capture side's counters, handed to the per-frame
/// callback.  The callback never mutates these.
#[derive(Debug, Clone, Copy, Default)]
pub struct FpsSnapshot {
    pub frames_read_per_second: u32,
    pub frames_displayed_per_second: u32,
}

// ── Decode / annotate / encode loop ──────────────────────────────────────────

/// Open `input_path`, apply `frame_fn` to every frame (receives a mutable
/// [`RgbFrame`] and the current [`FpsSnapshot`]; modify the frame in place),
/// and write the result to `output_path` encoded as H.264.
///
/// `frame_fn` returning [`ControlFlow::Break`] stops the run after the
/// current frame.  Returns the number of frames written.
pub fn process<P, Q, F>(input_path: P, output_path: Q, mut frame_fn: F) -> Result<u64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(&mut RgbFrame, &FpsSnapshot) -> ControlFlow<()>,
{
    process_inner(input_path, output_path, 0, &mut frame_fn, &mut |_, _| {})
}

/// Same as [`process`] but calls `progress_fn(current_frame, total_frames)`
/// after every encoded frame, enabling progress reporting to a UI.
pub fn process_with_progress<P, Q, F, G>(
    input_path: P,
    output_path: Q,
    total: u64,
    mut frame_fn: F,
    mut progress_fn: G,
) -> Result<u64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    F: FnMut(&mut RgbFrame, &FpsSnapshot) -> ControlFlow<()>,
    G: FnMut(u64, u64),
{
    process_inner(
        input_path,
        output_path,
        total,
        &mut frame_fn,
        &mut progress_fn,
    )
}

/// Encoder-side state bundled so the encode step can be shared between the
/// main loop and the decoder drain.
struct EncodeState {
    video_encoder: encoder::Video,
    to_yuv: scaling::Context,
    out_rgb_frame: frame::Video,
    yuv_frame: frame::Video,
    video_out_index: usize,
    time_base: Rational,
    width: u32,
    height: u32,
}

fn process_inner<P, Q>(
    input_path: P,
    output_path: Q,
    total: u64,
    frame_fn: &mut dyn FnMut(&mut RgbFrame, &FpsSnapshot) -> ControlFlow<()>,
    progress_fn: &mut dyn FnMut(u64, u64),
) -> Result<u64>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    ffmpeg::init().context("failed to initialise FFmpeg")?;

    // ── Input ────────────────────────────────────────────────────────────────
    let mut ictx = format::input(&input_path).context("could not open input file")?;

    let video_stream_index = ictx
        .streams()
        .best(media::Type::Video)
        .context("no video stream found in input")?
        .index();

    let input_video_stream = ictx.stream(video_stream_index).unwrap();
    let video_time_base = input_video_stream.time_base();
    let frame_rate = input_video_stream.avg_frame_rate();

    let decoder_ctx = codec::context::Context::from_parameters(input_video_stream.parameters())
        .context("failed to build decoder context")?;
    let mut decoder = decoder_ctx
        .decoder()
        .video()
        .context("failed to open video decoder")?;

    let src_width = decoder.width();
    let src_height = decoder.height();
    let src_pixel_fmt = decoder.format();

    info!(
        src_width,
        src_height,
        ?src_pixel_fmt,
        "opened input video stream"
    );

    // Scaler: decoded frame → RGB24 for the callback (fixed source size)
    let mut to_rgb = scaling::Context::get(
        src_pixel_fmt,
        src_width,
        src_height,
        format::Pixel::RGB24,
        src_width,
        src_height,
        SCALE_FLAGS,
    )
    .context("failed to create to-RGB scaler")?;

    // ── Output — dimensions are known up front, annotation never resizes ─────
    let mut octx = format::output(&output_path).context("could not create output context")?;

    let global_header = octx
        .format()
        .flags()
        .contains(format::flag::Flags::GLOBAL_HEADER);

    let encoder_codec = encoder::find(codec::Id::H264)
        .context("H.264 encoder not found — is FFmpeg built with libx264?")?;

    let mut video_out_stream = octx.add_stream(encoder_codec)?;
    let encoder_ctx = codec::context::Context::new_with_codec(encoder_codec);
    let mut video_encoder_builder = encoder_ctx.encoder().video()?;

    video_encoder_builder.set_width(src_width);
    video_encoder_builder.set_height(src_height);
    video_encoder_builder.set_format(ENCODE_FORMAT);
    video_encoder_builder.set_time_base(video_time_base);
    video_encoder_builder.set_frame_rate(Some(frame_rate));
    if global_header {
        video_encoder_builder.set_flags(codec::flag::Flags::GLOBAL_HEADER);
    }

    let video_encoder = video_encoder_builder
        .open_as_with(
            encoder_codec,
            ffmpeg_next::Dictionary::from_iter([("crf", "18"), ("preset", "fast")]),
        )
        .context("failed to open H.264 encoder")?;

    video_out_stream.set_parameters(&video_encoder);
    let video_out_index = video_out_stream.index();

    let to_yuv = scaling::Context::get(
        format::Pixel::RGB24,
        src_width,
        src_height,
        ENCODE_FORMAT,
        src_width,
        src_height,
        SCALE_FLAGS,
    )
    .context("failed to create to-YUV scaler")?;

    octx.write_header().context("failed to write output header")?;

    let mut state = EncodeState {
        video_encoder,
        to_yuv,
        out_rgb_frame: frame::Video::new(format::Pixel::RGB24, src_width, src_height),
        yuv_frame: frame::Video::empty(),
        video_out_index,
        time_base: video_time_base,
        width: src_width,
        height: src_height,
    };

    // ── Loop ─────────────────────────────────────────────────────────────────
    let mut decoded_frame = frame::Video::empty();
    let mut rgb_avframe = frame::Video::empty();
    let mut read_fps = FpsCounter::new();
    let mut displayed_fps = FpsCounter::new();
    let mut frame_count = 0u64;
    let mut stopped = false;

    'packets: for (stream, packet) in ictx.packets() {
        if stream.index() != video_stream_index {
            continue;
        }

        decoder
            .send_packet(&packet)
            .context("decoder send_packet")?;

        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            to_rgb
                .run(&decoded_frame, &mut rgb_avframe)
                .context("to-RGB scaling failed")?;
            read_fps.tick();

            let mut rgb =
                compact_rgb(&rgb_avframe, src_width, src_height, &decoded_frame, frame_count);

            let fps = FpsSnapshot {
                frames_read_per_second: read_fps.per_second(),
                frames_displayed_per_second: displayed_fps.per_second(),
            };
            let flow = frame_fn(&mut rgb, &fps);

            encode_rgb(&rgb, &mut state, &mut octx)?;
            displayed_fps.tick();
            frame_count += 1;
            progress_fn(frame_count, total);
            if frame_count % 100 == 0 {
                debug!(frame_count, "processed frames");
            }

            if flow.is_break() {
                stopped = true;
                break 'packets;
            }
        }
    }

    // Flush decoder (skipped when the callback requested a stop)
    if !stopped {
        decoder.send_eof().ok();
        while decoder.receive_frame(&mut decoded_frame).is_ok() {
            to_rgb
                .run(&decoded_frame, &mut rgb_avframe)
                .context("to-RGB scaling failed")?;
            read_fps.tick();

            let mut rgb =
                compact_rgb(&rgb_avframe, src_width, src_height, &decoded_frame, frame_count);

            let fps = FpsSnapshot {
                frames_read_per_second: read_fps.per_second(),
                frames_displayed_per_second: displayed_fps.per_second(),
            };
            let flow = frame_fn(&mut rgb, &fps);

            encode_rgb(&rgb, &mut state, &mut octx)?;
            displayed_fps.tick();
            frame_count += 1;
            progress_fn(frame_count, total);
            if flow.is_break() {
                break;
            }
        }
    }

    // Flush encoder
    state.video_encoder.send_eof().ok();
    flush_encoder(
        &mut state.video_encoder,
        &mut octx,
        state.video_out_index,
        state.time_base,
    )?;

    octx.write_trailer()
        .context("failed to write output trailer")?;

    info!(frame_count, stopped, "annotation pass complete");
    Ok(frame_count)
}

/// Compact an AVFrame's RGB plane to a plain `Vec<u8>` (strips stride padding).
fn compact_rgb(
    rgb_avframe: &frame::Video,
    width: u32,
    height: u32,
    decoded: &frame::Video,
    frame_count: u64,
) -> RgbFrame {
    let stride = rgb_avframe.stride(0);
    let raw = rgb_avframe.data(0);
    let mut data = Vec::with_capacity((width * height * 3) as usize);
    for row in 0..height as usize {
        let start = row * stride;
        data.extend_from_slice(&raw[start..start + width as usize * 3]);
    }

    RgbFrame {
        data,
        width,
        height,
        pts: decoded.pts().unwrap_or(frame_count as i64),
    }
}

/// Write an annotated RGB frame through the YUV scaler into the encoder.
fn encode_rgb(
    rgb: &RgbFrame,
    state: &mut EncodeState,
    octx: &mut format::context::Output,
) -> Result<()> {
    let out_stride = state.out_rgb_frame.stride(0);
    let plane_data = state.out_rgb_frame.data_mut(0);
    let row_bytes = state.width as usize * 3;
    for row in 0..state.height as usize {
        let dst_start = row * out_stride;
        let src_start = row * row_bytes;
        plane_data[dst_start..dst_start + row_bytes]
            .copy_from_slice(&rgb.data[src_start..src_start + row_bytes]);
    }

    state
        .to_yuv
        .run(&state.out_rgb_frame, &mut state.yuv_frame)
        .context("to-YUV scaling failed")?;
    state.yuv_frame.set_pts(Some(rgb.pts));

    state
        .video_encoder
        .send_frame(&state.yuv_frame)
        .context("encoder send_frame")?;

    flush_encoder(
        &mut state.video_encoder,
        octx,
        state.video_out_index,
        state.time_base,
    )
}

/// Drain all pending packets from the encoder and write them to the muxer.
fn flush_encoder(
    encoder: &mut encoder::Video,
    octx: &mut format::context::Output,
    stream_index: usize,
    time_base: Rational,
) -> Result<()> {
    let mut encoded = ffmpeg_next::Packet::empty();
    while encoder.receive_packet(&mut encoded).is_ok() {
        encoded.set_stream(stream_index);
        encoded.rescale_ts(time_base, octx.stream(stream_index).unwrap().time_base());
        encoded
            .write_interleaved(octx)
            .context("failed to write encoded packet")?;
    }
    Ok(())
}

/// Return the approximate total frame count for a video file (used for
/// progress reporting).  Falls back to 0 if the count cannot be determined.
pub fn total_frames<P: AsRef<Path>>(input_path: P) -> u64 {
    ffmpeg::init().ok();
    let Ok(ictx) = format::input(&input_path) else {
        return 0;
    };
    let Some(stream) = ictx.streams().best(media::Type::Video) else {
        return 0;
    };
    // nb_frames is set by most muxers; fall back to duration × fps estimate.
    let nb = stream.frames();
    if nb > 0 {
        return nb as u64;
    }
    let dur = stream.duration(); // in stream time-base units
    let tb = stream.time_base();
    let fps = stream.avg_frame_rate();
    if dur > 0 && tb.denominator() > 0 && fps.numerator() > 0 {
        let seconds = dur as f64 * tb.numerator() as f64 / tb.denominator() as f64;
        let fps_f = fps.numerator() as f64 / fps.denominator() as f64;
        return (seconds * fps_f).round() as u64;
    }
    0
}

// ── Tests ────────────────────────────────────────────────────────────────────
