use anyhow::{anyhow, bail, Context};
use birdclip::{
    BirdClassifier, BirdclipError, DummyBackend, LabelTable, PipelineConfig, ScoreBackend,
};
use clap::Parser;
use colored::*;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "birdclip", about = "Rank bird species for audio clips")]
struct Args {
    /// Files or directories
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Label file, one `Scientific name_Common name` line per class
    #[arg(long = "labels")]
    labels: PathBuf,

    /// TOML pipeline config; flags below override it
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Top-K species
    #[arg(long = "top-k")]
    top_k: Option<usize>,

    /// Number of classes the model scores
    #[arg(long = "class-count")]
    class_count: Option<usize>,

    /// Sample rate the model expects (Hz)
    #[arg(long = "sample-rate")]
    sample_rate: Option<u32>,

    /// Window length the model expects (seconds)
    #[arg(long = "duration")]
    duration: Option<u32>,

    /// Backend: dummy | tract (requires --features tract) | onnx (requires --features onnx)
    #[arg(long = "backend", default_value = "dummy")]
    backend: String,

    /// Path to the classifier ONNX file (tract / onnx backends)
    #[arg(long = "model")]
    model: Option<PathBuf>,

    /// Output JSON (array) to stdout only
    #[arg(long = "json", default_value_t = false)]
    json: bool,

    /// Show pretty table (stderr); disable with --show-table false
    #[arg(long = "show-table", default_value_t = true, action = clap::ArgAction::Set)]
    show_table: bool,

    /// Write the normalized window of a single input clip as a float WAV
    #[arg(long = "dump-window")]
    dump_window: Option<PathBuf>,

    /// Log filter (overridden by RUST_LOG)
    #[arg(long = "log-level", default_value = "warn")]
    log_level: String,
}

fn stage_error(e: BirdclipError) -> anyhow::Error {
    anyhow!("{} during {} stage: {e}", e.kind(), e.stage())
}

fn pipeline_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut cfg = match &args.config {
        Some(path) => PipelineConfig::from_toml_file(path).map_err(stage_error)?,
        None => PipelineConfig::default(),
    };
    if let Some(k) = args.top_k {
        cfg.top_k = k;
    }
    if let Some(c) = args.class_count {
        cfg.class_count = c;
    }
    if let Some(sr) = args.sample_rate {
        cfg.sample_rate = sr;
    }
    if let Some(d) = args.duration {
        cfg.duration_secs = d;
    }
    cfg.validate().map_err(stage_error)?;
    Ok(cfg)
}

fn make_backend(args: &Args, cfg: &PipelineConfig) -> anyhow::Result<Box<dyn ScoreBackend>> {
    let backend: Box<dyn ScoreBackend> = match args.backend.as_str() {
        "dummy" => Box::new(DummyBackend::new(cfg.class_count)),
        #[cfg(feature = "tract")]
        "tract" => {
            let model = args
                .model
                .as_ref()
                .context("--model required for tract")?;
            Box::new(
                birdclip::TractBackend::from_path(model, cfg.window_len(), &cfg.output_name)
                    .map_err(stage_error)?,
            )
        }
        #[cfg(feature = "onnx")]
        "onnx" => {
            let model = args.model.as_ref().context("--model required for onnx")?;
            Box::new(
                birdclip::OnnxBackend::from_path(model, &cfg.input_name, &cfg.output_name)
                    .map_err(stage_error)?,
            )
        }
        other => bail!("unknown or disabled backend: {other}"),
    };
    Ok(backend)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = pipeline_config(&args)?;
    let labels = LabelTable::load(&args.labels, cfg.class_count)
        .map_err(stage_error)
        .with_context(|| format!("failed to load labels from {}", args.labels.display()))?;
    let backend = make_backend(&args, &cfg)?;
    let classifier = BirdClassifier::new(backend, labels, cfg).map_err(stage_error)?;

    let results = classifier
        .classify_paths(args.paths.clone())
        .map_err(stage_error)?;

    // Only dump once the clip has classified cleanly.
    if let Some(out) = &args.dump_window {
        let [clip] = results.as_slice() else {
            bail!("--dump-window needs exactly one input clip, found {}", results.len());
        };
        let file = &clip.file;
        let window = classifier.normalize_file(file).map_err(stage_error)?;
        window
            .write_wav(out)
            .map_err(stage_error)
            .with_context(|| format!("failed to write {}", out.display()))?;
        tracing::info!(path = %out.display(), "wrote normalized window");
    }

    // Table to stderr if requested
    if args.show_table && !args.json {
        let mut table = comfy_table::Table::new();
        table.set_header(vec!["File", "Species", "Scientific name", "Score"]);
        for r in &results {
            let fname = r.file.file_name().and_then(|s| s.to_str()).unwrap_or("?");
            for p in &r.predictions {
                table.add_row(vec![
                    fname.to_string(),
                    p.common_name.clone(),
                    p.scientific_name.clone(),
                    p.score_text.clone(),
                ]);
            }
        }
        eprintln!("{}", "Predictions".green().bold());
        eprintln!("{}", table);
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for r in &results {
            if results.len() > 1 {
                println!("{}", r.file.display());
            }
            for p in &r.predictions {
                println!("{p}");
            }
        }
    }
    Ok(())
}
