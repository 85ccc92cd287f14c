//! Command-line front end for frontal face triage.
//!
//! Usage:
//!   frontal-triage run <root> --backend dense-mesh --model face_mesh.onnx
//!   frontal-triage run <root> --backend geometric --model shape_predictor_68_face_landmarks.dat \
//!       --detector-model seeta_fd_frontal_v1.0.bin
//!   frontal-triage classify <image> --backend ... --model ... [--json]
//!   frontal-triage convert-model shape_predictor_68_face_landmarks.dat model.bin

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use frontal_triage::dlib::load_dlib_model;
use frontal_triage::{
    open_extractor, Backend, BackendConfig, ClassificationResult, Pipeline, TriageConfig,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "frontal-triage")]
#[command(author, version, about = "Sort face images by head pose", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify every image under a directory and move it into True/ or False/
    Run {
        /// Directory to triage
        root: PathBuf,

        #[command(flatten)]
        backend: BackendArgs,

        /// Classify and log without moving anything
        #[arg(long)]
        dry_run: bool,

        /// Write landmark overlays into this directory
        #[arg(long)]
        annotate_dir: Option<PathBuf>,

        /// Append the run log to this file instead of stderr
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Classify one image without moving it
    Classify {
        image: PathBuf,

        #[command(flatten)]
        backend: BackendArgs,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Convert a dlib shape predictor into the faster-loading bincode format
    ConvertModel { input: PathBuf, output: PathBuf },
}

#[derive(Args, Debug)]
struct BackendArgs {
    /// Landmark backend
    #[arg(long, value_enum, default_value_t = Backend::Geometric)]
    backend: Backend,

    /// Landmark model (.dat, .dat.bz2, .bin or .onnx)
    #[arg(long)]
    model: PathBuf,

    /// SeetaFace detector model (face crop for the dense-mesh backend)
    #[arg(long, default_value = "seeta_fd_frontal_v1.0.bin")]
    detector_model: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

impl BackendArgs {
    fn load(&self) -> frontal_triage::Result<(BackendConfig, TriageConfig)> {
        let config = match &self.config {
            Some(path) => TriageConfig::load(path)?,
            None => TriageConfig::default(),
        };
        let backend = BackendConfig::new(self.backend, &self.model)
            .with_detector_model(&self.detector_model);
        Ok((backend, config))
    }
}

#[derive(Serialize)]
struct ClassifyOutput {
    image: String,
    face_found: bool,
    is_frontal: bool,
    level: Option<String>,
    method: Backend,
    yaw: Option<f64>,
    pitch: Option<f64>,
    roll: Option<f64>,
    reprojection_error: Option<f64>,
    pose_error: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Command::Run { log_file, .. } => log_file.as_deref(),
        _ => None,
    };
    if let Err(e) = init_tracing(log_file) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(cli.command) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing(log_file: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match log_file {
        Some(path) => {
            let file = File::options().create(true).append(true).open(path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn run(command: Command) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Run {
            root,
            backend,
            dry_run,
            annotate_dir,
            log_file: _,
            json,
        } => {
            let (backend, mut config) = backend.load()?;
            config.dry_run |= dry_run;
            if annotate_dir.is_some() {
                config.annotate_dir = annotate_dir;
            }

            let extractor = open_extractor(&backend, &config)?;
            let mut pipeline = Pipeline::new(extractor, config)?;
            let summary = pipeline.run(&root)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Discovered: {}", summary.discovered);
                println!(
                    "Frontal:    {} (high {}, medium {}, low {})",
                    summary.accepted,
                    summary.levels.high,
                    summary.levels.medium,
                    summary.levels.low
                );
                println!("Rejected:   {}", summary.rejected);
                println!("No face:    {}", summary.no_face);
                println!("Failed:     {}", summary.failed);
            }
        }
        Command::Classify {
            image,
            backend,
            json,
        } => {
            let (backend, config) = backend.load()?;
            let method = backend.kind;
            let extractor = open_extractor(&backend, &config)?;
            let mut pipeline = Pipeline::new(extractor, config)?;

            let output = match pipeline.classify_file(&image)? {
                Some((analysis, result)) => {
                    classify_output(&image, &result, analysis.pose.err().map(|e| e.to_string()))
                }
                None => ClassifyOutput {
                    image: image.display().to_string(),
                    face_found: false,
                    is_frontal: false,
                    level: None,
                    method,
                    yaw: None,
                    pitch: None,
                    roll: None,
                    reprojection_error: None,
                    pose_error: None,
                },
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print!("{}", format_human_readable(&output));
            }
        }
        Command::ConvertModel { input, output } => {
            let model = load_dlib_model(&input)?;
            model.save(&output)?;
            info!(
                landmarks = model.num_landmarks(),
                stages = model.num_cascade_stages(),
                output = %output.display(),
                "model converted"
            );
        }
    }
    Ok(())
}

fn classify_output(
    image: &Path,
    result: &ClassificationResult,
    pose_error: Option<String>,
) -> ClassifyOutput {
    let angles = result.pose.angles();
    ClassifyOutput {
        image: image.display().to_string(),
        face_found: true,
        is_frontal: result.is_frontal,
        level: result.level.map(|t| t.to_string()),
        method: result.pose.method(),
        yaw: angles.map(|a| a.yaw),
        pitch: angles.map(|a| a.pitch),
        roll: angles.map(|a| a.roll),
        reprojection_error: angles.map(|a| a.reprojection_error),
        pose_error,
    }
}

fn format_human_readable(output: &ClassifyOutput) -> String {
    let mut s = String::new();

    s.push_str(&format!("Image: {} ({})\n", output.image, output.method));
    if !output.face_found {
        s.push_str("No face found.\n");
        return s;
    }

    match (output.yaw, output.pitch, output.roll) {
        (Some(yaw), Some(pitch), Some(roll)) => {
            s.push_str(&format!(
                "Pose:  yaw {:.2}, pitch {:.2}, roll {:.2} degrees\n",
                yaw, pitch, roll
            ));
            if let Some(err) = output.reprojection_error {
                s.push_str(&format!("Reprojection error: {:.2}px\n", err));
            }
        }
        _ => {
            let reason = output.pose_error.as_deref().unwrap_or("unknown");
            s.push_str(&format!("Pose unavailable: {}\n", reason));
        }
    }

    let verdict = if output.is_frontal { "frontal" } else { "not frontal" };
    match &output.level {
        Some(level) => s.push_str(&format!("Verdict: {} ({})\n", verdict, level)),
        None => s.push_str(&format!("Verdict: {}\n", verdict)),
    }
    s
}
