use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::EnvFilter;

use facerange_core::{
    calibration::{CalibrationTable, DistanceModel, FitMode, DEFAULT_DEGREE},
    detection::{RustfaceDetector, ScaledDetector},
    pipeline::Annotator,
    video::{process_with_progress, total_frames},
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "face-range",
    version,
    about = "Estimate face-to-camera distance and overlay it on video",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect a calibration fit: per-sample residuals and curve samples.
    Fit {
        /// Calibration table path (width,distance rows, no header)
        #[arg(short, long)]
        table: PathBuf,

        /// Polynomial degree for the least-squares mode
        #[arg(long, default_value_t = DEFAULT_DEGREE)]
        degree: usize,

        /// Use piecewise quadratic interpolation instead of the polynomial fit
        #[arg(long)]
        interpolate: bool,

        /// Skip malformed table rows with a warning instead of failing
        #[arg(long)]
        permissive: bool,
    },

    /// Annotate a video with face boxes and distance labels.
    Annotate {
        /// Input video path
        #[arg(short, long)]
        input: PathBuf,

        /// Output video path
        #[arg(short, long, default_value = "annotated.mp4")]
        output: PathBuf,

        /// Calibration table path (width,distance rows, no header)
        #[arg(short, long)]
        table: PathBuf,

        /// SeetaFace frontal-face model path
        #[arg(long, default_value = "seeta_fd_frontal_v1.0.bin")]
        face_model: PathBuf,

        /// Polynomial degree for the least-squares mode
        #[arg(long, default_value_t = DEFAULT_DEGREE)]
        degree: usize,

        /// Use piecewise quadratic interpolation instead of the polynomial fit
        #[arg(long)]
        interpolate: bool,

        /// Skip the frame-rate labels
        #[arg(long)]
        no_fps: bool,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Respect RUST_LOG; default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fit {
            table,
            degree,
            interpolate,
            permissive,
        } => cmd_fit(table, degree, interpolate, permissive),
        Commands::Annotate {
            input,
            output,
            table,
            face_model,
            degree,
            interpolate,
            no_fps,
        } => cmd_annotate(input, output, table, face_model, degree, interpolate, no_fps),
    }
}

fn fit_mode(degree: usize, interpolate: bool) -> FitMode {
    if interpolate {
        FitMode::Interpolate
    } else {
        FitMode::Polynomial { degree }
    }
}

// ── Fit inspection ────────────────────────────────────────────────────────────

fn cmd_fit(table_path: PathBuf, degree: usize, interpolate: bool, permissive: bool) -> Result<()> {
    let table = if permissive {
        CalibrationTable::load_permissive(&table_path)
    } else {
        CalibrationTable::load(&table_path)
    }
    .with_context(|| format!("failed to load calibration table: {}", table_path.display()))?;

    info!(samples = table.len(), "calibration table loaded");

    let mode = fit_mode(degree, interpolate);
    let model = DistanceModel::fit(&table, mode).context("calibration model construction failed")?;

    let report = model.fit_report(&table);
    println!("{:>10} {:>10} {:>10} {:>10}", "width", "measured", "fitted", "residual");
    for row in &report.rows {
        println!(
            "{:>10.2} {:>10.3} {:>10.3} {:>10.4}",
            row.width, row.distance, row.fitted, row.residual
        );
    }
    println!(
        "mean |residual| = {:.4}, max |residual| = {:.4}",
        report.mean_abs_residual, report.max_abs_residual
    );

    // Sample the curve from zero through the top of the calibrated range so
    // extrapolation below the smallest measured width is visible too.
    let (_, hi) = model.calibrated_range();
    println!("\n{:>10} {:>10} {:>9}", "width", "distance", "in-range");
    let steps = 20;
    for i in 0..=steps {
        let width = hi * i as f64 / steps as f64;
        println!(
            "{:>10.2} {:>10.3} {:>9}",
            width,
            model.evaluate(width),
            if model.covers(width) { "yes" } else { "no" }
        );
    }

    Ok(())
}

// ── Annotation pass ───────────────────────────────────────────────────────────

fn cmd_annotate(
    input: PathBuf,
    output: PathBuf,
    table_path: PathBuf,
    face_model: PathBuf,
    degree: usize,
    interpolate: bool,
    no_fps: bool,
) -> Result<()> {
    info!("annotation pass");
    info!("  input  : {}", input.display());
    info!("  output : {}", output.display());
    info!("  table  : {}", table_path.display());

    let table = CalibrationTable::load(&table_path)
        .with_context(|| format!("failed to load calibration table: {}", table_path.display()))?;
    let model = DistanceModel::fit(&table, fit_mode(degree, interpolate))
        .context("calibration model construction failed")?;

    let detector = RustfaceDetector::load(&face_model)
        .with_context(|| format!("failed to load face model: {}", face_model.display()))?;
    let mut annotator = Annotator::new(model, Box::new(ScaledDetector::new(detector)), !no_fps);

    let total = total_frames(&input);
    let pb = progress(total);
    let pb2 = pb.clone();

    let frames = process_with_progress(
        &input,
        &output,
        total,
        move |frame, fps| {
            annotator.annotate(frame, fps);
            ControlFlow::Continue(())
        },
        move |done, _total| {
            pb2.set_position(done);
        },
    )
    .context("annotation pass failed")?;

    pb.finish_with_message("Done.");
    info!(frames, "annotated video written");
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn progress(total: u64) -> ProgressBar {
    if total > 0 {
        let pb = ProgressBar::new(total);
        pb.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} {msg} [{elapsed_precise}]",
            )
            .unwrap(),
        );
        pb
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {pos} frames {msg} [{elapsed_precise}]")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        pb
    }
}
