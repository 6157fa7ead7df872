//! birdclip core library
//!
//! Turns an audio clip into ranked bird-species predictions: decode, mix down
//! to mono, resample, cut a fixed window, score it with a classifier backend
//! and resolve the best classes against a label table.

pub mod audio;
pub mod backend;
pub mod error;
pub mod ranking;

pub use audio::{
    assemble_window, load_window, normalize_source, AudioFileReader, ChannelReducer,
    InterleavedSource, NormalizedBuffer, Resampler, SampleSource,
};
#[cfg(feature = "onnx")]
pub use backend::OnnxBackend;
#[cfg(feature = "tract")]
pub use backend::TractBackend;
pub use backend::{DummyBackend, ScoreBackend};
pub use error::{BirdclipError, Result, Stage};
pub use ranking::{top_k, LabelEntry, LabelTable, RankedScore, ScoreVector};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};
use walkdir::WalkDir;

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_DURATION_SECS: u32 = 3;
/// Class count of the BirdNET GLOBAL 6K V2.4 label set.
pub const DEFAULT_CLASS_COUNT: usize = 6522;

pub const SUPPORTED_EXTS: &[&str] = &[
    ".wav", ".mp3", ".flac", ".ogg", ".m4a", ".mp4", ".aac", ".webm",
];

// ---------------- Configuration ----------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub sample_rate: u32,
    pub duration_secs: u32,
    pub class_count: usize,
    pub top_k: usize,
    pub input_name: String,
    pub output_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            duration_secs: DEFAULT_DURATION_SECS,
            class_count: DEFAULT_CLASS_COUNT,
            top_k: 5,
            input_name: "input".into(),
            output_name: "output".into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(text).map_err(|e| BirdclipError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&text)
            .map_err(|e| BirdclipError::Config(format!("{}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.duration_secs == 0 {
            return Err(BirdclipError::Config(
                "sample_rate and duration_secs must be positive".into(),
            ));
        }
        if self.class_count == 0 {
            return Err(BirdclipError::Config("class_count must be positive".into()));
        }
        Ok(())
    }

    /// N, the number of samples the classifier consumes.
    pub fn window_len(&self) -> usize {
        self.sample_rate as usize * self.duration_secs as usize
    }
}

// ---------------- Output records ----------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub index: usize,
    pub common_name: String,
    pub scientific_name: String,
    /// Raw engine score.
    pub score: f32,
    /// `score` rounded to 3 decimals, as printed.
    pub score_text: String,
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.common_name, self.scientific_name, self.score_text
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClipPrediction {
    pub file: PathBuf,
    pub model: String,
    pub predictions: Vec<Prediction>,
}

// ---------------- Pipeline ----------------

pub struct BirdClassifier<B: ScoreBackend> {
    backend: B,
    labels: LabelTable,
    config: PipelineConfig,
}

impl<B: ScoreBackend> BirdClassifier<B> {
    /// Labels must already hold exactly `config.class_count` lines.
    pub fn new(backend: B, labels: LabelTable, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        if labels.len() != config.class_count {
            return Err(BirdclipError::Config(format!(
                "label table has {} entries, model expects {}",
                labels.len(),
                config.class_count
            )));
        }
        Ok(Self {
            backend,
            labels,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn normalize_file(&self, file: &Path) -> Result<NormalizedBuffer> {
        load_window(file, self.config.sample_rate, self.config.window_len())
    }

    /// Run the engine and check it produced one score per class.
    pub fn score(&self, window: &NormalizedBuffer) -> Result<ScoreVector> {
        let scores = self.backend.infer(window)?;
        if scores.len() != self.config.class_count {
            return Err(BirdclipError::Inference(format!(
                "engine returned {} scores, expected {}",
                scores.len(),
                self.config.class_count
            )));
        }
        Ok(ScoreVector::new(scores))
    }

    /// Rank and label scores. Fails as a whole if any of the top entries is unusable.
    pub fn predict(&self, scores: &ScoreVector) -> Result<Vec<Prediction>> {
        top_k(scores, self.config.top_k)?
            .into_iter()
            .map(|ranked| {
                let label = self.labels.resolve(ranked.index)?;
                Ok(Prediction {
                    index: ranked.index,
                    common_name: label.common_name,
                    scientific_name: label.scientific_name,
                    score: ranked.score,
                    score_text: format!("{:.3}", ranked.score),
                })
            })
            .collect()
    }

    pub fn classify_window(&self, window: &NormalizedBuffer) -> Result<Vec<Prediction>> {
        let scores = self.score(window)?;
        self.predict(&scores)
    }

    pub fn classify_file(&self, file: &Path) -> Result<ClipPrediction> {
        let started = Instant::now();
        let window = self.normalize_file(file)?;
        debug!(file = %file.display(), samples = window.len(), "window ready");
        let predictions = self.classify_window(&window)?;
        info!(
            file = %file.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "classified clip"
        );
        Ok(ClipPrediction {
            file: file.to_path_buf(),
            model: self.backend.model_name().to_string(),
            predictions,
        })
    }

    /// Classify every supported file under `paths`, one independent run per clip.
    pub fn classify_paths(&self, paths: Vec<PathBuf>) -> Result<Vec<ClipPrediction>> {
        let files = expand_audio_files(paths)?;
        files.iter().map(|f| self.classify_file(f)).collect()
    }
}

/// Recursively expand audio files from provided paths.
///
/// Files named directly are always kept and left for the decoder to probe;
/// the extension filter only applies inside directories.
pub fn expand_audio_files(inputs: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for p in inputs {
        if p.is_file() {
            out.push(p);
        } else if p.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(&p) {
                let e = entry.map_err(|e| BirdclipError::Io(e.into()))?;
                if e.file_type().is_file() && is_supported(e.path()) {
                    found.push(e.path().to_path_buf());
                }
            }
            found.sort();
            out.extend(found);
        } else {
            return Err(BirdclipError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("path not found: {}", p.display()),
            )));
        }
    }
    if out.is_empty() {
        return Err(BirdclipError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no audio clips found",
        )));
    }
    Ok(out)
}

fn is_supported(p: &Path) -> bool {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|ext| {
            let ext = format!(".{}", ext).to_lowercase();
            SUPPORTED_EXTS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> LabelTable {
        LabelTable::from_lines((0..n).map(|i| format!("Genus species{i}_Bird {i}")))
    }

    fn small_config() -> PipelineConfig {
        PipelineConfig {
            sample_rate: 8_000,
            duration_secs: 1,
            class_count: 12,
            top_k: 3,
            ..Default::default()
        }
    }

    struct FixedBackend(Vec<f32>);

    impl ScoreBackend for FixedBackend {
        fn infer(&self, _window: &NormalizedBuffer) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn default_window_is_three_seconds_at_48k() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.window_len(), 144_000);
        assert_eq!(cfg.class_count, 6522);
    }

    #[test]
    fn config_from_toml_fills_defaults() {
        let cfg = PipelineConfig::from_toml_str("top_k = 10\nclass_count = 100\n").unwrap();
        assert_eq!(cfg.top_k, 10);
        assert_eq!(cfg.class_count, 100);
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.output_name, "output");
        let err = PipelineConfig::from_toml_str("duration_secs = 0").unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn label_count_must_match_classes() {
        let err = BirdClassifier::new(DummyBackend::new(12), labels(11), small_config())
            .err()
            .unwrap();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[test]
    fn wrong_score_count_is_inference_error() {
        let clf = BirdClassifier::new(FixedBackend(vec![0.0; 11]), labels(12), small_config())
            .unwrap();
        let err = clf
            .classify_window(&NormalizedBuffer::silence(8_000, 8_000))
            .unwrap_err();
        assert_eq!(err.stage(), Stage::Infer);
    }

    #[test]
    fn predictions_follow_rank_order() {
        let mut scores = vec![0.0; 12];
        scores[5] = 0.8734;
        scores[2] = 0.5;
        scores[9] = 0.5;
        let clf = BirdClassifier::new(FixedBackend(scores), labels(12), small_config()).unwrap();
        let preds = clf
            .classify_window(&NormalizedBuffer::silence(8_000, 8_000))
            .unwrap();
        let idx: Vec<usize> = preds.iter().map(|p| p.index).collect();
        assert_eq!(idx, vec![5, 2, 9]);
        assert_eq!(preds[0].to_string(), "Bird 5 (Genus species5): 0.873");
    }

    #[test]
    fn json_record_carries_raw_and_rounded_score() {
        let mut scores = vec![0.0; 12];
        scores[1] = 0.8734;
        let clf = BirdClassifier::new(FixedBackend(scores), labels(12), small_config()).unwrap();
        let preds = clf
            .classify_window(&NormalizedBuffer::silence(8_000, 8_000))
            .unwrap();
        let json = serde_json::to_value(&preds[0]).unwrap();
        assert_eq!(json["score_text"], "0.873");
        assert!((json["score"].as_f64().unwrap() - 0.8734).abs() < 1e-6);
        assert_eq!(json["common_name"], "Bird 1");
    }

    #[test]
    fn named_files_are_kept_whatever_their_extension() {
        let dir = tempfile::tempdir().unwrap();
        let named = dir.path().join("recording");
        std::fs::write(&named, b"RIFF").unwrap();
        let files = expand_audio_files(vec![named.clone()]).unwrap();
        assert_eq!(files, vec![named]);
    }

    #[test]
    fn directory_without_clips_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "no audio").unwrap();
        let err = expand_audio_files(vec![dir.path().to_path_buf()]).unwrap_err();
        assert_eq!(err.stage(), Stage::Load);
        assert!(err.to_string().contains("no audio clips found"));
    }

    #[test]
    fn malformed_label_in_top_k_fails_run() {
        let mut lines: Vec<String> = (0..12).map(|i| format!("G s{i}_B {i}")).collect();
        lines[4] = "broken".into();
        let mut scores = vec![0.0; 12];
        scores[4] = 1.0;
        let clf = BirdClassifier::new(
            FixedBackend(scores.clone()),
            LabelTable::from_lines(lines.clone()),
            small_config(),
        )
        .unwrap();
        let err = clf.predict(&ScoreVector::new(scores)).unwrap_err();
        assert_eq!(err.stage(), Stage::Resolve);

        // Same table, but the broken entry never makes the top 3.
        let mut scores = vec![0.0; 12];
        scores[4] = -1.0;
        let clf = BirdClassifier::new(
            FixedBackend(scores.clone()),
            LabelTable::from_lines(lines),
            small_config(),
        )
        .unwrap();
        assert_eq!(clf.predict(&ScoreVector::new(scores)).unwrap().len(), 3);
    }

    #[test]
    fn top_k_above_class_count_is_rank_error() {
        let cfg = PipelineConfig {
            top_k: 13,
            ..small_config()
        };
        let clf = BirdClassifier::new(DummyBackend::new(12), labels(12), cfg).unwrap();
        let err = clf
            .classify_window(&NormalizedBuffer::silence(8_000, 8_000))
            .unwrap_err();
        assert_eq!(err.kind(), "RankError");
    }

    #[test]
    fn supported_extensions() {
        assert!(is_supported(Path::new("a/blue-jay.MP3")));
        assert!(is_supported(Path::new("clip.wav")));
        assert!(!is_supported(Path::new("Cargo.toml")));
    }
}
