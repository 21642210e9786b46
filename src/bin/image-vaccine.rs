use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use image_vaccine::io::collect_images;
use image_vaccine::quality::{self, DEFAULT_TAMPER_THRESHOLD};
use image_vaccine::{
    default_output_path, save_image, BatchControl, DirectorySink, LinearSurrogate,
    ProtectionConfig, ProtectionPipeline, SecretKey, SurrogateClassifier,
    DEFAULT_DETECTION_THRESHOLD,
};

#[derive(Parser)]
#[command(
    name = "image-vaccine",
    about = "Watermark and poison images so that copies and trained models can be traced",
    version,
    after_help = "Simple usage: image-vaccine --key <secret> protect <image>\n\n\
                  NOTE: Keep the key secret. Anyone holding it can detect and strip the watermark."
)]
struct Cli {
    /// Owner secret (or set IMAGE_VACCINE_KEY)
    #[arg(short, long, env = "IMAGE_VACCINE_KEY", hide_env_values = true, global = true)]
    key: Option<String>,

    /// Read the owner secret from a file instead
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,

    /// Protection configuration (JSON); missing fields take defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Linear surrogate classifier (JSON) for the real_adversarial trigger
    #[arg(long, global = true)]
    surrogate: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watermark and poison a single image
    Protect {
        /// Input image file
        input: PathBuf,
        /// Output file (default: {name}_protected.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// True class label of the image
        #[arg(short, long, default_value_t = 0)]
        label: u32,
    },
    /// Check whether an image carries this key's watermark
    Detect {
        /// Suspect image file
        input: PathBuf,
        /// Correlation threshold (0.0-1.0)
        #[arg(short, long, default_value_t = DEFAULT_DETECTION_THRESHOLD)]
        threshold: f64,
    },
    /// Protect every image in a directory
    Batch {
        /// Input directory
        input: PathBuf,
        /// Output directory for images and metadata sidecars
        #[arg(short, long)]
        output: PathBuf,
        /// Class label recorded for every image
        #[arg(short, long, default_value_t = 0)]
        label: u32,
    },
    /// Compare an original image with its protected version
    Quality {
        /// Original image
        original: PathBuf,
        /// Protected image
        protected: PathBuf,
    },
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {message}");
    process::exit(1);
}

fn load_rgb(path: &Path) -> image::RgbImage {
    match image::open(path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => fail(format_args!("Failed to read {}: {e}", path.display())),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    )
}

impl Cli {
    fn secret(&self) -> SecretKey {
        let key = match (&self.key_file, &self.key) {
            (Some(path), _) => SecretKey::from_file(path),
            (None, Some(k)) => SecretKey::new(k.as_bytes()),
            (None, None) => SecretKey::from_env("IMAGE_VACCINE_KEY"),
        };
        key.unwrap_or_else(|e| fail(e))
    }

    fn pipeline(&self) -> ProtectionPipeline {
        let config = match &self.config {
            Some(path) => ProtectionConfig::from_json_file(path).unwrap_or_else(|e| fail(e)),
            None => ProtectionConfig::default(),
        };
        let surrogate = self.surrogate.as_ref().map(|path| {
            let model = LinearSurrogate::from_json_file(path).unwrap_or_else(|e| fail(e));
            Box::new(model) as Box<dyn SurrogateClassifier>
        });
        ProtectionPipeline::with_surrogate(&self.secret(), config, surrogate)
            .unwrap_or_else(|e| fail(format_args!("Failed to initialize pipeline: {e}")))
    }
}

fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Command::Protect {
            input,
            output,
            label,
        } => {
            let pipeline = cli.pipeline();
            let img = load_rgb(input);
            let protected = pipeline.protect(&img, *label).unwrap_or_else(|e| fail(e));
            let output = output.clone().unwrap_or_else(|| default_output_path(input));
            if let Err(e) = save_image(&protected.image, &output) {
                fail(format_args!("Failed to write {}: {e}", output.display()));
            }
            let sidecar = output.with_extension("json");
            let written = std::fs::File::create(&sidecar)
                .map_err(image_vaccine::Error::from)
                .and_then(|f| {
                    serde_json::to_writer_pretty(f, &protected.metadata)
                        .map_err(image_vaccine::Error::from)
                });
            if let Err(e) = written {
                fail(format_args!("Failed to write {}: {e}", sidecar.display()));
            }
            if !cli.quiet {
                eprintln!(
                    "[OK] {} -> {} (trigger: {})",
                    file_name(input),
                    output.display(),
                    protected.metadata.trigger_style
                );
                if cli.verbose {
                    if let Ok(db) = quality::psnr(&img, &protected.image) {
                        eprintln!("  -> PSNR {db:.2} dB");
                    }
                }
            }
        }
        Command::Detect { input, threshold } => {
            if !(0.0..=1.0).contains(threshold) {
                fail("Threshold must be between 0.0 and 1.0");
            }
            let pipeline = cli.pipeline();
            let img = load_rgb(input);
            let detection = pipeline.watermark().detect_own(&img, *threshold);
            if detection.detected {
                eprintln!(
                    "[DETECTED] {} (correlation {:.3})",
                    file_name(input),
                    detection.correlation
                );
            } else {
                eprintln!(
                    "[CLEAN] {} (correlation {:.3})",
                    file_name(input),
                    detection.correlation
                );
            }
            if cli.verbose {
                eprintln!("  -> {} blocks scored", detection.blocks);
            }
            if !detection.detected {
                process::exit(2);
            }
        }
        Command::Batch {
            input,
            output,
            label,
        } => {
            if !input.is_dir() {
                fail(format_args!("Input directory does not exist: {}", input.display()));
            }
            let pipeline = cli.pipeline();
            let paths = collect_images(input).unwrap_or_else(|e| fail(e));
            if paths.is_empty() {
                fail(format_args!("No supported images in {}", input.display()));
            }
            let sink = DirectorySink::new(output).unwrap_or_else(|e| fail(e));
            let items: Vec<(PathBuf, u32)> = paths.into_iter().map(|p| (p, *label)).collect();
            if !cli.quiet {
                eprintln!(
                    "Protecting {} images with {} threads (trigger: {})",
                    items.len(),
                    pipeline.config().concurrency,
                    pipeline.config().trigger
                );
                eprintln!();
            }

            let control = BatchControl::new();
            let report = pipeline
                .process_batch(&items, &sink, &control)
                .unwrap_or_else(|e| fail(e));

            for failure in &report.failures {
                let name = failure
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("#{}", failure.index));
                eprintln!("[FAIL] {name}: {}", failure.error);
            }
            if cli.verbose {
                for meta in &report.metadata {
                    if let Some(id) = &meta.image_id {
                        eprintln!("[OK] {id}");
                    }
                }
            }
            if !cli.quiet {
                eprintln!();
                eprint!("[Summary] Processed: {}", report.metadata.len());
                if !report.failures.is_empty() {
                    eprint!(", Failed: {}", report.failures.len());
                }
                eprintln!(" (Total: {})", items.len());
            }
            if !report.failures.is_empty() {
                process::exit(1);
            }
        }
        Command::Quality {
            original,
            protected,
        } => {
            let a = load_rgb(original);
            let b = load_rgb(protected);
            let psnr = quality::psnr(&a, &b).unwrap_or_else(|e| fail(e));
            let ssim = quality::ssim(&a, &b).unwrap_or_else(|e| fail(e));
            let tamper = quality::tamper_score(&a, &b).unwrap_or_else(|e| fail(e));
            eprintln!("PSNR:   {psnr:.2} dB");
            eprintln!("SSIM:   {ssim:.4}");
            eprintln!("Tamper: {tamper:.4}");
            if tamper > DEFAULT_TAMPER_THRESHOLD {
                eprintln!("WARNING: images differ by more than {DEFAULT_TAMPER_THRESHOLD}");
            }
        }
    }
}
