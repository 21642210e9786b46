//! Watermark-then-poison protection of single images and batches.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::Utc;
use image::RgbImage;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::adversarial::SurrogateClassifier;
use crate::config::{ProtectionConfig, SecretKey};
use crate::error::{Error, Result};
use crate::io::{ImageSource, ProtectedSink};
use crate::metadata::ProtectionMetadata;
use crate::trigger::PoisonTrigger;
use crate::watermark::{WatermarkEngine, WatermarkPattern};

/// A protected image and the record describing how it was protected.
#[derive(Debug, Clone)]
pub struct ProtectedImage {
    /// Watermarked and poisoned pixels.
    pub image: RgbImage,
    /// Protection record.
    pub metadata: ProtectionMetadata,
}

/// Shared progress and cancellation for a running batch.
#[derive(Debug, Default)]
pub struct BatchControl {
    processed: AtomicUsize,
    cancelled: AtomicBool,
}

impl BatchControl {
    /// A fresh control with no progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Units finished so far, successful or not.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Acquire)
    }

    /// Ask the batch to stop; units already running complete.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn record(&self) {
        self.processed.fetch_add(1, Ordering::AcqRel);
    }
}

/// One batch item that could not be protected.
#[derive(Debug)]
pub struct BatchFailure {
    /// Position of the item in the input.
    pub index: usize,
    /// Source identifier, if any.
    pub id: Option<String>,
    /// What went wrong.
    pub error: Error,
}

/// Outcome of a batch run.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Metadata of every protected item, in completion order.
    pub metadata: Vec<ProtectionMetadata>,
    /// Items that failed.
    pub failures: Vec<BatchFailure>,
    /// Items never started because the batch was cancelled.
    pub skipped: usize,
}

impl BatchReport {
    /// Whether every item was protected.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}

/// Applies the watermark and then the poison trigger.
///
/// Holds only key-derived state, so one pipeline can serve many threads.
#[derive(Debug)]
pub struct ProtectionPipeline {
    config: ProtectionConfig,
    watermark: WatermarkEngine,
    trigger: PoisonTrigger,
}

impl ProtectionPipeline {
    /// Create a pipeline without a surrogate classifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is unusable.
    pub fn new(key: &SecretKey, config: ProtectionConfig) -> Result<Self> {
        Self::with_surrogate(key, config, None)
    }

    /// Create a pipeline whose `real_adversarial` trigger attacks `surrogate`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is unusable.
    pub fn with_surrogate(
        key: &SecretKey,
        config: ProtectionConfig,
        surrogate: Option<Box<dyn SurrogateClassifier>>,
    ) -> Result<Self> {
        config.validate()?;
        let watermark = WatermarkEngine::new(key, config.alpha, config.redundancy)?;
        let trigger = PoisonTrigger::from_config(&config, watermark.seed(), surrogate);
        Ok(Self {
            config,
            watermark,
            trigger,
        })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ProtectionConfig {
        &self.config
    }

    /// The watermark engine, for detection.
    #[must_use]
    pub fn watermark(&self) -> &WatermarkEngine {
        &self.watermark
    }

    /// The poison trigger.
    #[must_use]
    pub fn trigger(&self) -> &PoisonTrigger {
        &self.trigger
    }

    /// The pattern embedded into images of the given shape.
    #[must_use]
    pub fn pattern_for(&self, height: u32, width: u32) -> WatermarkPattern {
        self.watermark.pattern_for(height, width)
    }

    /// Watermark and poison `image`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyImage`] if the image has no pixels.
    pub fn protect(&self, image: &RgbImage, original_label: u32) -> Result<ProtectedImage> {
        let watermarked = self.watermark.embed(image)?;
        let (poisoned, source) = self.trigger.inject_with_source(&watermarked.image)?;
        Ok(ProtectedImage {
            image: poisoned,
            metadata: self.metadata(original_label, source),
        })
    }

    /// Apply only the trigger, producing an audit probe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyImage`] if the image has no pixels.
    pub fn probe(&self, image: &RgbImage) -> Result<RgbImage> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::EmptyImage { width, height });
        }
        self.trigger.inject(image)
    }

    fn metadata(&self, original_label: u32, source: &str) -> ProtectionMetadata {
        ProtectionMetadata {
            original_label,
            target_label: self.config.target_label,
            watermark_seed: self.watermark.seed(),
            alpha: self.config.alpha,
            epsilon: self.config.epsilon,
            redundancy: self.config.redundancy,
            trigger_style: self.config.trigger,
            perturbation_source: source.to_string(),
            border_color: self.config.border_color,
            border_thickness: self.config.border_thickness,
            image_id: None,
            timestamp: Utc::now(),
        }
    }

    fn process_one<S: ImageSource>(
        &self,
        index: usize,
        source: &S,
        label: u32,
        sink: &dyn ProtectedSink,
    ) -> Result<ProtectionMetadata> {
        let image = source.load()?;
        let mut protected = self.protect(&image, label)?;
        protected.metadata.image_id = source.id();
        sink.store(index, &protected)?;
        Ok(protected.metadata)
    }

    /// Protect `(source, label)` pairs on a pool of `config.concurrency`
    /// threads, handing each result to `sink`.
    ///
    /// A failing item is logged and reported without stopping the others.
    /// Cancellation via `control` is checked before each item starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ThreadPool`] if the worker pool cannot be created.
    pub fn process_batch<S: ImageSource>(
        &self,
        items: &[(S, u32)],
        sink: &dyn ProtectedSink,
        control: &BatchControl,
    ) -> Result<BatchReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .build()?;

        let collected = Mutex::new(Vec::with_capacity(items.len()));
        let failures = Mutex::new(Vec::new());
        let skipped = AtomicUsize::new(0);

        pool.install(|| {
            items
                .par_iter()
                .enumerate()
                .for_each(|(index, (source, label))| {
                    if control.is_cancelled() {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    match self.process_one(index, source, *label, sink) {
                        Ok(meta) => {
                            tracing::debug!(index, id = ?meta.image_id, "protected");
                            collected.lock().push(meta);
                        }
                        Err(error) => {
                            let id = source.id();
                            tracing::warn!(index, ?id, %error, "failed to protect batch item");
                            failures.lock().push(BatchFailure { index, id, error });
                        }
                    }
                    control.record();
                });
        });

        let report = BatchReport {
            metadata: collected.into_inner(),
            failures: failures.into_inner(),
            skipped: skipped.into_inner(),
        };
        tracing::info!(
            protected = report.metadata.len(),
            failed = report.failures.len(),
            skipped = report.skipped,
            "batch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adversarial::{AdversarialEngine, LinearSurrogate, Normalization};
    use crate::io::MemorySink;
    use crate::trigger::TriggerStyle;

    fn key() -> SecretKey {
        SecretKey::new("k1").unwrap()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn gradient(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            image::Rgb([((x + y) % 256) as u8, (y % 256) as u8, (x % 256) as u8])
        })
    }

    #[test]
    fn invalid_config_fails_fast() {
        let config = ProtectionConfig {
            redundancy: 3,
            ..ProtectionConfig::default()
        };
        assert!(matches!(
            ProtectionPipeline::new(&key(), config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn protect_records_metadata() {
        let pipeline = ProtectionPipeline::new(&key(), ProtectionConfig::default()).unwrap();
        let protected = pipeline.protect(&gradient(32), 4).unwrap();
        let meta = &protected.metadata;
        assert_eq!(meta.original_label, 4);
        assert_eq!(meta.target_label, 999);
        assert_eq!(meta.watermark_seed, pipeline.watermark().seed());
        assert_eq!(meta.trigger_style, TriggerStyle::Border);
        assert_eq!(meta.perturbation_source, "border");
        assert_eq!(protected.image.get_pixel(0, 0), &image::Rgb([255, 0, 255]));
    }

    #[test]
    fn probe_applies_trigger_only() {
        let pipeline = ProtectionPipeline::new(&key(), ProtectionConfig::default()).unwrap();
        let img = gradient(32);
        let probe = pipeline.probe(&img).unwrap();
        assert_eq!(probe.get_pixel(15, 15), img.get_pixel(15, 15));
        assert_eq!(probe.get_pixel(31, 5), &image::Rgb([255, 0, 255]));
        assert!(pipeline.probe(&RgbImage::new(0, 0)).is_err());
    }

    /// Two classes on a 4x4 input: class 1 likes bright red, class 0 the opposite.
    fn red_detector() -> LinearSurrogate {
        let n = 3 * 4 * 4;
        let mut weights = vec![0.0; 2 * n];
        for i in 0..16 {
            weights[i] = -1.0;
            weights[n + i] = 1.0;
        }
        LinearSurrogate::new((4, 4), 2, weights, vec![0.0, 0.0], Normalization::IDENTITY).unwrap()
    }

    fn adversarial_config(target_label: u32) -> ProtectionConfig {
        ProtectionConfig {
            trigger: TriggerStyle::RealAdversarial,
            target_label,
            epsilon: 0.05,
            ..ProtectionConfig::default()
        }
    }

    fn mean_red(image: &RgbImage) -> f64 {
        let sum: f64 = image.pixels().map(|p| f64::from(p[0])).sum();
        sum / f64::from(image.width() * image.height())
    }

    #[test]
    fn real_adversarial_protection_pushes_toward_target() {
        let surrogate = red_detector();
        let pipeline = ProtectionPipeline::with_surrogate(
            &key(),
            adversarial_config(1),
            Some(Box::new(surrogate.clone())),
        )
        .unwrap();
        let img = RgbImage::from_pixel(16, 16, image::Rgb([100, 100, 100]));
        let protected = pipeline.protect(&img, 0).unwrap();
        assert_eq!(protected.metadata.perturbation_source, "adversarial");
        assert_eq!(protected.metadata.trigger_style, TriggerStyle::RealAdversarial);

        let engine = AdversarialEngine::new(Box::new(surrogate), 0);
        let margin = |image: &RgbImage| {
            let input = engine.prepare_input(image).unwrap();
            let logits = engine.surrogate().logits(&input).unwrap();
            logits[1] - logits[0]
        };
        assert!(margin(&protected.image) > margin(&img));

        let rise = mean_red(&protected.image) - mean_red(&img);
        assert!(rise > 10.0, "mean red rose by {rise:.2}");
    }

    #[test]
    fn unreachable_target_records_statistical_source() {
        let pipeline = ProtectionPipeline::with_surrogate(
            &key(),
            adversarial_config(999),
            Some(Box::new(red_detector())),
        )
        .unwrap();
        assert_eq!(pipeline.trigger().source_name(), "statistical");
        let protected = pipeline.protect(&gradient(32), 0).unwrap();
        assert_eq!(protected.metadata.perturbation_source, "statistical");
    }

    /// Reports a valid shape but never produces a gradient.
    struct BrokenSurrogate;

    impl SurrogateClassifier for BrokenSurrogate {
        fn input_size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn num_classes(&self) -> usize {
            2
        }

        fn logits(&self, _input: &[f32]) -> Result<Vec<f32>> {
            Ok(vec![0.0, 0.0])
        }

        fn loss_gradient(&self, _input: &[f32], _label: u32) -> Result<Vec<f32>> {
            Err(Error::Surrogate("gradient unavailable".into()))
        }
    }

    #[test]
    fn failing_surrogate_records_sign_noise_source() {
        let pipeline = ProtectionPipeline::with_surrogate(
            &key(),
            adversarial_config(1),
            Some(Box::new(BrokenSurrogate)),
        )
        .unwrap();
        assert_eq!(pipeline.trigger().source_name(), "adversarial");
        let protected = pipeline.protect(&gradient(32), 0).unwrap();
        assert_eq!(protected.metadata.perturbation_source, "sign_noise");
    }

    #[test]
    fn batch_reports_failures_and_progress() {
        let config = ProtectionConfig {
            trigger: TriggerStyle::Invisible,
            concurrency: 2,
            ..ProtectionConfig::default()
        };
        let pipeline = ProtectionPipeline::new(&key(), config).unwrap();
        let items = vec![
            (gradient(16), 0),
            (RgbImage::new(0, 5), 1),
            (gradient(24), 2),
        ];
        let sink = MemorySink::new();
        let control = BatchControl::new();
        let report = pipeline.process_batch(&items, &sink, &control).unwrap();

        assert_eq!(report.metadata.len(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].index, 1);
        assert!(matches!(report.failures[0].error, Error::EmptyImage { .. }));
        assert_eq!(control.processed(), 3);
        assert!(!report.is_complete());
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn cancelled_batch_processes_nothing() {
        let pipeline = ProtectionPipeline::new(&key(), ProtectionConfig::default()).unwrap();
        let items: Vec<_> = (0..5).map(|i| (gradient(16), i)).collect();
        let sink = MemorySink::new();
        let control = BatchControl::new();
        control.cancel();
        let report = pipeline.process_batch(&items, &sink, &control).unwrap();
        assert_eq!(report.skipped, 5);
        assert!(report.metadata.is_empty());
        assert_eq!(control.processed(), 0);
        assert!(sink.is_empty());
    }
}
