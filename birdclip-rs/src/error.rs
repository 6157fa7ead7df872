use std::fmt;
use thiserror::Error;

/// Pipeline stage an error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Open,
    Decode,
    Normalize,
    Infer,
    Rank,
    Resolve,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Open => "open",
            Stage::Decode => "decode",
            Stage::Normalize => "normalize",
            Stage::Infer => "infer",
            Stage::Rank => "rank",
            Stage::Resolve => "resolve",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum BirdclipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error ({stage}): {message}")]
    Decode { stage: Stage, message: String },

    #[error("inference error: {0}")]
    Inference(String),

    #[error("rank error: requested top {k} of {classes} classes")]
    Rank { k: usize, classes: usize },

    #[error("lookup error for class {index}: {message}")]
    Lookup { index: usize, message: String },

    #[error("config error: {0}")]
    Config(String),
}

impl BirdclipError {
    pub(crate) fn open(message: impl Into<String>) -> Self {
        BirdclipError::Decode {
            stage: Stage::Open,
            message: message.into(),
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        BirdclipError::Decode {
            stage: Stage::Decode,
            message: message.into(),
        }
    }

    pub(crate) fn normalize(message: impl Into<String>) -> Self {
        BirdclipError::Decode {
            stage: Stage::Normalize,
            message: message.into(),
        }
    }

    /// Stage the run was in when this error aborted it.
    pub fn stage(&self) -> Stage {
        match self {
            BirdclipError::Io(_) | BirdclipError::Config(_) => Stage::Load,
            BirdclipError::Decode { stage, .. } => *stage,
            BirdclipError::Inference(_) => Stage::Infer,
            BirdclipError::Rank { .. } => Stage::Rank,
            BirdclipError::Lookup { .. } => Stage::Resolve,
        }
    }

    /// Short kind name as reported to users.
    pub fn kind(&self) -> &'static str {
        match self {
            BirdclipError::Io(_) => "IoError",
            BirdclipError::Decode { .. } => "DecodeError",
            BirdclipError::Inference(_) => "InferenceError",
            BirdclipError::Rank { .. } => "RankError",
            BirdclipError::Lookup { .. } => "LookupError",
            BirdclipError::Config(_) => "ConfigError",
        }
    }
}

pub type Result<T> = std::result::Result<T, BirdclipError>;
