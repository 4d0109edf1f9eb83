use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use chessboard_tools::{run_calibration, CalibrationConfig, PatternSize};

#[derive(Parser, Debug)]
#[command(
    name = "chessboard-calibrate",
    version,
    about = "Calibrate a camera from chessboard images.",
    long_about = "Calibrate a camera from a directory of chessboard images.\n\n\
Every image is scanned for the chessboard's inner-corner grid; images where \
the pattern cannot be found are skipped. The detected corners are refined to \
sub-pixel accuracy and fed into a two-stage solve (closed-form initialization \
followed by Levenberg-Marquardt refinement). The resulting intrinsic matrix K \
and distortion coefficients D are written to a YAML file, reloaded to verify \
the round trip, and the mean reprojection error is reported."
)]
struct Args {
    /// Directory containing the calibration images.
    image_dir: PathBuf,

    /// Number of inner corners per board row.
    #[arg(long, default_value_t = 7)]
    cols: u32,

    /// Number of inner corners per board column.
    #[arg(long, default_value_t = 6)]
    rows: u32,

    /// Side length of one board square. Any unit works; the translation part
    /// of the recovered poses comes out in the same unit.
    #[arg(short, long, default_value_t = 1.0)]
    square_size: f64,

    /// Output path for the coefficients file.
    #[arg(short, long, default_value = "calibration.yaml")]
    output: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let pattern = PatternSize {
        cols: args.cols,
        rows: args.rows,
    };
    let config = CalibrationConfig::new(pattern, args.square_size, args.image_dir, args.output);

    let report = match run_calibration(&config) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Calibration failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    println!(
        "Calibrated from {} views ({} images skipped)",
        report.views_used, report.images_skipped
    );
    println!("K:");
    let k = report.model.intrinsics.to_matrix();
    for r in 0..3 {
        println!("  [{:12.6}, {:12.6}, {:12.6}]", k[(r, 0)], k[(r, 1)], k[(r, 2)]);
    }
    println!("D: {:?}", report.model.distortions);
    for view in &report.per_view {
        println!(
            "  {}: {} corners, error {:.4} px",
            view.image, view.points, view.error
        );
    }
    println!("Mean reprojection error: {:.4} px", report.mean_error);

    ExitCode::SUCCESS
}
