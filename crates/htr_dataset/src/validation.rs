//! Store validation and quality checks.

use crate::codec::LabelCodec;
use crate::source::{RecordStatus, SampleSource};
use crate::types::{DatasetError, DatasetResult};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSummary {
    /// Records checked.
    pub total: usize,
    pub ok: usize,
    /// Records with undecodable or unpaddable images, or non UTF-8 labels.
    pub corrupt: usize,
    /// Records with a missing label, file or image key.
    pub missing: usize,
    pub empty_labels: usize,
    /// Labels containing symbols outside the codec alphabet.
    pub unencodable: usize,
    /// Longest label in characters.
    pub max_label_len: usize,
    pub min_aspect: Option<f32>,
    pub max_aspect: Option<f32>,
}

impl StoreSummary {
    fn merge(mut self, other: StoreSummary) -> StoreSummary {
        self.total += other.total;
        self.ok += other.ok;
        self.corrupt += other.corrupt;
        self.missing += other.missing;
        self.empty_labels += other.empty_labels;
        self.unencodable += other.unencodable;
        self.max_label_len = self.max_label_len.max(other.max_label_len);
        self.min_aspect = merge_opt(self.min_aspect, other.min_aspect, f32::min);
        self.max_aspect = merge_opt(self.max_aspect, other.max_aspect, f32::max);
        self
    }
}

fn merge_opt(a: Option<f32>, b: Option<f32>, f: fn(f32, f32) -> f32) -> Option<f32> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Pass,
    Warn,
    Fail,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutcome::Pass => "pass",
            ValidationOutcome::Warn => "warn",
            ValidationOutcome::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationThresholds {
    pub max_corrupt: Option<usize>,
    pub max_missing: Option<usize>,
    pub max_unencodable: Option<usize>,
    pub max_corrupt_ratio: Option<f32>,
    pub max_missing_ratio: Option<f32>,
    pub max_unencodable_ratio: Option<f32>,
}

impl ValidationThresholds {
    pub fn from_env() -> Self {
        fn parse_usize(key: &str) -> Option<usize> {
            std::env::var(key).ok()?.trim().parse().ok()
        }
        fn parse_ratio(key: &str) -> Option<f32> {
            std::env::var(key).ok()?.trim().parse().ok()
        }
        ValidationThresholds {
            max_corrupt: parse_usize("HTR_DATASET_MAX_CORRUPT"),
            max_missing: parse_usize("HTR_DATASET_MAX_MISSING"),
            max_unencodable: parse_usize("HTR_DATASET_MAX_UNENCODABLE"),
            max_corrupt_ratio: parse_ratio("HTR_DATASET_MAX_CORRUPT_RATIO"),
            max_missing_ratio: parse_ratio("HTR_DATASET_MAX_MISSING_RATIO"),
            max_unencodable_ratio: parse_ratio("HTR_DATASET_MAX_UNENCODABLE_RATIO"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub reasons: Vec<String>,
    pub summary: StoreSummary,
}

/// Read every record of `source` without recovery and tally what was found.
///
/// Labels are checked against `codec` when given. Store-level failures abort;
/// per-record problems are counted.
pub fn summarize_source(
    source: &SampleSource,
    codec: Option<&LabelCodec>,
) -> DatasetResult<StoreSummary> {
    let test_mode = source.config().test_mode;
    (0..source.count())
        .into_par_iter()
        .map(|index| -> DatasetResult<StoreSummary> {
            let mut s = StoreSummary {
                total: 1,
                ..StoreSummary::default()
            };
            let raw = match source.inspect(index) {
                Ok(RecordStatus::Ok(raw)) => raw,
                Ok(RecordStatus::Corrupt(_)) | Err(DatasetError::LabelEncoding { .. }) => {
                    s.corrupt = 1;
                    return Ok(s);
                }
                Err(DatasetError::MissingKey { .. }) => {
                    s.missing = 1;
                    return Ok(s);
                }
                Err(e) => return Err(e),
            };
            s.ok = 1;
            let (w, h) = raw.primary.dimensions();
            let aspect = w as f32 / h.max(1) as f32;
            s.min_aspect = Some(aspect);
            s.max_aspect = Some(aspect);
            if !test_mode {
                let len = raw.label.chars().count();
                s.max_label_len = len;
                if len == 0 {
                    s.empty_labels = 1;
                }
                if let Some(codec) = codec {
                    if !codec.can_encode(&raw.label) {
                        s.unencodable = 1;
                    }
                }
            }
            Ok(s)
        })
        .try_reduce(StoreSummary::default, |a, b| Ok(a.merge(b)))
}

fn apply_thresholds(
    label: &str,
    count: usize,
    ratio: f32,
    max_count: Option<usize>,
    max_ratio: Option<f32>,
    outcome: &mut ValidationOutcome,
    reasons: &mut Vec<String>,
) {
    if let Some(max) = max_count {
        if count > max {
            *outcome = ValidationOutcome::Fail;
            reasons.push(format!("{label}: {count} exceeds max {max}"));
        }
    }
    if let Some(max_r) = max_ratio {
        if ratio > max_r {
            *outcome = ValidationOutcome::Fail;
            reasons.push(format!(
                "{label}: ratio {:.3} exceeds max {:.3}",
                ratio, max_r
            ));
        }
    }
    if count > 0 {
        if *outcome == ValidationOutcome::Pass {
            *outcome = ValidationOutcome::Warn;
        }
        reasons.push(format!("{label}: {count} observed"));
    }
}

pub fn validate_summary(
    summary: StoreSummary,
    thresholds: &ValidationThresholds,
) -> ValidationReport {
    let denom = summary.total.max(1) as f32;

    let mut outcome = ValidationOutcome::Pass;
    let mut reasons = Vec::new();

    apply_thresholds(
        "corrupt records",
        summary.corrupt,
        summary.corrupt as f32 / denom,
        thresholds.max_corrupt,
        thresholds.max_corrupt_ratio,
        &mut outcome,
        &mut reasons,
    );
    apply_thresholds(
        "missing keys",
        summary.missing,
        summary.missing as f32 / denom,
        thresholds.max_missing,
        thresholds.max_missing_ratio,
        &mut outcome,
        &mut reasons,
    );
    apply_thresholds(
        "unencodable labels",
        summary.unencodable,
        summary.unencodable as f32 / denom,
        thresholds.max_unencodable,
        thresholds.max_unencodable_ratio,
        &mut outcome,
        &mut reasons,
    );
    if summary.empty_labels > 0 {
        if outcome == ValidationOutcome::Pass {
            outcome = ValidationOutcome::Warn;
        }
        reasons.push(format!("empty labels: {} observed", summary.empty_labels));
    }

    ValidationReport {
        outcome,
        reasons,
        summary,
    }
}

pub fn summarize_with_thresholds(
    source: &SampleSource,
    codec: Option<&LabelCodec>,
    thresholds: &ValidationThresholds,
) -> DatasetResult<ValidationReport> {
    let summary = summarize_source(source, codec)?;
    Ok(validate_summary(summary, thresholds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(total: usize, corrupt: usize, unencodable: usize) -> StoreSummary {
        StoreSummary {
            total,
            ok: total - corrupt,
            corrupt,
            unencodable,
            ..StoreSummary::default()
        }
    }

    #[test]
    fn clean_summary_passes() {
        let report = validate_summary(summary(10, 0, 0), &ValidationThresholds::default());
        assert_eq!(report.outcome, ValidationOutcome::Pass);
        assert!(report.reasons.is_empty());
    }

    #[test]
    fn observed_problems_warn_without_thresholds() {
        let report = validate_summary(summary(10, 1, 0), &ValidationThresholds::default());
        assert_eq!(report.outcome, ValidationOutcome::Warn);
        assert_eq!(report.reasons, vec!["corrupt records: 1 observed".to_string()]);
    }

    #[test]
    fn ratio_threshold_fails() {
        let thresholds = ValidationThresholds {
            max_unencodable_ratio: Some(0.1),
            ..ValidationThresholds::default()
        };
        let report = validate_summary(summary(10, 0, 2), &thresholds);
        assert_eq!(report.outcome, ValidationOutcome::Fail);
        assert!(report.reasons[0].contains("ratio 0.200 exceeds max 0.100"));
    }

    #[test]
    fn merge_keeps_aspect_extremes() {
        let a = StoreSummary {
            min_aspect: Some(2.0),
            max_aspect: Some(2.0),
            max_label_len: 3,
            ..StoreSummary::default()
        };
        let b = StoreSummary {
            min_aspect: Some(5.0),
            max_aspect: Some(5.0),
            max_label_len: 9,
            ..StoreSummary::default()
        };
        let merged = a.merge(b).merge(StoreSummary::default());
        assert_eq!(merged.min_aspect, Some(2.0));
        assert_eq!(merged.max_aspect, Some(5.0));
        assert_eq!(merged.max_label_len, 9);
    }

    #[test]
    fn thresholds_from_env_parse_counts_and_ratios() {
        const VARS: [&str; 6] = [
            "HTR_DATASET_MAX_CORRUPT",
            "HTR_DATASET_MAX_MISSING",
            "HTR_DATASET_MAX_UNENCODABLE",
            "HTR_DATASET_MAX_CORRUPT_RATIO",
            "HTR_DATASET_MAX_MISSING_RATIO",
            "HTR_DATASET_MAX_UNENCODABLE_RATIO",
        ];
        for key in VARS {
            std::env::remove_var(key);
        }
        std::env::set_var("HTR_DATASET_MAX_CORRUPT", "3");
        std::env::set_var("HTR_DATASET_MAX_UNENCODABLE", "lots");
        std::env::set_var("HTR_DATASET_MAX_MISSING_RATIO", " 0.25 ");
        let thresholds = ValidationThresholds::from_env();
        for key in VARS {
            std::env::remove_var(key);
        }

        assert_eq!(thresholds.max_corrupt, Some(3));
        assert_eq!(thresholds.max_missing, None);
        assert_eq!(thresholds.max_unencodable, None);
        assert_eq!(thresholds.max_missing_ratio, Some(0.25));
        assert_eq!(thresholds.max_corrupt_ratio, None);

        let report = validate_summary(summary(10, 4, 0), &thresholds);
        assert_eq!(report.outcome, ValidationOutcome::Fail);
    }
}
