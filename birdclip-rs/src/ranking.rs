//! Score ranking and label resolution.

use crate::error::{BirdclipError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

/// Separator between scientific and common name in a label line.
pub const LABEL_SEPARATOR: char = '_';

/// Raw per-class scores, index-aligned with the label table.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreVector(Vec<f32>);

impl ScoreVector {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RankedScore {
    pub index: usize,
    pub score: f32,
}

// Descending score, NaN last, equal scores by ascending index.
fn rank_order(a: &RankedScore, b: &RankedScore) -> Ordering {
    let by_score = match (a.score.is_nan(), b.score.is_nan()) {
        (false, false) => b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
    };
    by_score.then(a.index.cmp(&b.index))
}

/// The `k` best classes, best first.
pub fn top_k(scores: &ScoreVector, k: usize) -> Result<Vec<RankedScore>> {
    let classes = scores.len();
    if k > classes {
        return Err(BirdclipError::Rank { k, classes });
    }
    if k == 0 {
        return Ok(Vec::new());
    }
    let mut ranked: Vec<RankedScore> = scores
        .as_slice()
        .iter()
        .enumerate()
        .map(|(index, &score)| RankedScore { index, score })
        .collect();
    if k < classes {
        ranked.select_nth_unstable_by(k - 1, rank_order);
        ranked.truncate(k);
    }
    ranked.sort_unstable_by(rank_order);
    Ok(ranked)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub scientific_name: String,
    pub common_name: String,
}

/// Class labels, one raw `scientific_common` line per class.
///
/// Lines are only split when looked up, so one malformed entry fails just the
/// runs that rank it.
#[derive(Debug, Clone)]
pub struct LabelTable {
    lines: Vec<String>,
}

impl LabelTable {
    pub fn load(path: &Path, expected_classes: usize) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let table = Self::parse(&text);
        if table.len() != expected_classes {
            return Err(BirdclipError::Config(format!(
                "{} has {} labels, model expects {expected_classes}",
                path.display(),
                table.len()
            )));
        }
        Ok(table)
    }

    pub fn parse(text: &str) -> Self {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        Self::from_lines(text.lines())
    }

    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn resolve(&self, index: usize) -> Result<LabelEntry> {
        let raw = self.lines.get(index).ok_or_else(|| BirdclipError::Lookup {
            index,
            message: format!("out of range for {} labels", self.lines.len()),
        })?;
        let (scientific, common) = raw.split_once(LABEL_SEPARATOR).ok_or_else(|| {
            BirdclipError::Lookup {
                index,
                message: format!("malformed label {raw:?}"),
            }
        })?;
        Ok(LabelEntry {
            scientific_name: scientific.to_string(),
            common_name: common.to_string(),
        })
    }
}
