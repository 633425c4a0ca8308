//! Score Extractor - Trusted Result Parsing
//!
//! **Core Responsibility:**
//! Scan raw sandbox output for score records and keep only the authentic,
//! valid ones.
//!
//! **Critical Properties:**
//! - Knows nothing about Docker or how the output was produced
//! - Pure function: (raw output, secret, elapsed) → Results
//! - A record is authentic only if it carries this run's secret
//! - The secret never survives into the returned log
//!
//! **Line Rules:**
//! - a line that is exactly one score record with the wrong secret is dropped
//! - a record with the right secret but a broken invariant is dropped and
//!   reported as a per-record error
//! - every other line is kept, with any occurrence of the secret masked

use gradekit_common::types::{Results, Score};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Replacement for the secret inside ordinary log lines
const REDACTED: &str = "******";

/// Wire shape of a score record: exactly these five fields, one per line
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "PascalCase")]
struct ScoreRecord {
    secret: String,
    test_name: String,
    score: i64,
    max_score: i64,
    weight: i64,
}

/// Why a score record was rejected. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScoreError {
    #[error("score not found")]
    NotFound,
    #[error("secret mismatch")]
    Secret,
    #[error("{test_name}: empty test name")]
    EmptyTestName { test_name: String },
    #[error("{test_name}: weight must be positive, got {weight}")]
    Weight { test_name: String, weight: i64 },
    #[error("{test_name}: max score must be positive, got {max_score}")]
    MaxScore { test_name: String, max_score: i64 },
    #[error("{test_name}: score {score} outside [0, {max_score}]")]
    ScoreInterval {
        test_name: String,
        score: i64,
        max_score: i64,
    },
}

impl ScoreRecord {
    /// Check authenticity first, then the record's own invariants.
    fn validate(self, secret: &str) -> Result<Score, ScoreError> {
        if secret.is_empty() || self.secret != secret {
            return Err(ScoreError::Secret);
        }
        // the name ends up in errors, logs and Results; none may carry the secret
        let test_name = self.test_name.replace(secret, REDACTED);
        if test_name.trim().is_empty() {
            return Err(ScoreError::EmptyTestName { test_name });
        }
        let weight = positive(self.weight).ok_or_else(|| ScoreError::Weight {
            test_name: test_name.clone(),
            weight: self.weight,
        })?;
        let max_score = positive(self.max_score).ok_or_else(|| ScoreError::MaxScore {
            test_name: test_name.clone(),
            max_score: self.max_score,
        })?;
        if self.score < 0 || self.score > self.max_score {
            return Err(ScoreError::ScoreInterval {
                test_name,
                score: self.score,
                max_score: self.max_score,
            });
        }
        Ok(Score {
            test_name,
            // bounded by max_score, which already fits
            score: self.score as u32,
            max_score,
            weight,
        })
    }
}

fn positive(value: i64) -> Option<u32> {
    u32::try_from(value).ok().filter(|v| *v > 0)
}

fn record(line: &str) -> Option<ScoreRecord> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

/// Parse a single output line as an authentic score record.
///
/// Lines that are not records yield [`ScoreError::NotFound`]; records
/// carrying another secret yield [`ScoreError::Secret`].
pub fn parse(line: &str, secret: &str) -> Result<Score, ScoreError> {
    record(line)
        .ok_or(ScoreError::NotFound)
        .and_then(|r| r.validate(secret))
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no score records found in test output")]
    NotFound {
        results: Results,
        rejected: Vec<ScoreError>,
    },
    #[error("{} score record(s) rejected", .rejected.len())]
    Rejected {
        results: Results,
        rejected: Vec<ScoreError>,
    },
}

impl ExtractError {
    pub fn results(&self) -> &Results {
        match self {
            ExtractError::NotFound { results, .. } | ExtractError::Rejected { results, .. } => {
                results
            }
        }
    }

    pub fn rejected(&self) -> &[ScoreError] {
        match self {
            ExtractError::NotFound { rejected, .. } | ExtractError::Rejected { rejected, .. } => {
                rejected
            }
        }
    }

    /// Whatever was accepted; partial results are still results
    pub fn into_results(self) -> Results {
        match self {
            ExtractError::NotFound { results, .. } | ExtractError::Rejected { results, .. } => {
                results
            }
        }
    }
}

/// Extract all authentic score records from `out`.
///
/// ## Returns
/// - `Ok` when at least one record was accepted and none were rejected
/// - `Err(Rejected)` when some records were accepted and some rejected
/// - `Err(NotFound)` when nothing was accepted
///
/// Every variant carries the sanitized log and the elapsed time.
pub fn extract_results(out: &str, secret: &str, elapsed: Duration) -> Result<Results, ExtractError> {
    let mut scores = Vec::new();
    let mut rejected = Vec::new();
    let mut log = Vec::new();

    for line in out.lines() {
        match parse(line, secret) {
            Ok(score) => scores.push(score),
            // foreign or forged record: dropped without a trace
            Err(ScoreError::Secret) => {}
            Err(ScoreError::NotFound) if secret.is_empty() => log.push(line.to_string()),
            Err(ScoreError::NotFound) => log.push(line.replace(secret, REDACTED)),
            Err(err) => rejected.push(err),
        }
    }

    let results = Results::new(scores, log.join("\n"), elapsed);
    if results.is_empty() {
        Err(ExtractError::NotFound { results, rejected })
    } else if !rejected.is_empty() {
        Err(ExtractError::Rejected { results, rejected })
    } else {
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const THE_SECRET: &str = "my secret code";

    fn line(secret: &str, name: &str, score: i64, max: i64, weight: i64) -> String {
        format!(
            r#"{{"Secret":"{}","TestName":"{}","Score":{},"MaxScore":{},"Weight":{}}}"#,
            secret, name, score, max, weight
        )
    }

    #[test]
    fn test_parse_non_json_strings() {
        let non_json = [
            "here is some output",
            "some other output",
            "line contains my secret code",
            "my secret code should not be revealed",
            "{not json at all",
            r#"{"Secret":"my secret code","TestName":"X"}"#,
        ];
        for s in non_json {
            assert_eq!(parse(s, THE_SECRET), Err(ScoreError::NotFound), "{}", s);
        }
    }

    #[test]
    fn test_parse_json_strings() {
        let score = parse(&line(THE_SECRET, "TestParse", 0, 10, 10), THE_SECRET).unwrap();
        assert_eq!(
            score,
            Score {
                test_name: "TestParse".to_string(),
                score: 0,
                max_score: 10,
                weight: 10,
            }
        );

        let wrong = parse(&line("the wrong secret", "TestParse", 0, 10, 10), THE_SECRET);
        assert_eq!(wrong, Err(ScoreError::Secret));
        assert!(!ScoreError::Secret.to_string().contains(THE_SECRET));
    }

    #[test]
    fn test_parse_ignores_field_order_and_whitespace() {
        let s = r#"   {"Weight":2, "MaxScore":4, "Score":3, "TestName":"T", "Secret":"my secret code"}  "#;
        let score = parse(s, THE_SECRET).unwrap();
        assert_eq!(score.score, 3);
        assert_eq!(score.weight, 2);
    }

    #[test]
    fn test_parse_rejects_extra_fields() {
        let s = r#"{"Secret":"my secret code","TestName":"T","Score":1,"MaxScore":1,"Weight":1,"Bonus":5}"#;
        assert_eq!(parse(s, THE_SECRET), Err(ScoreError::NotFound));
    }

    #[test]
    fn test_secret_in_test_name_is_masked() {
        let name = format!("leak {}", THE_SECRET);

        let err = parse(&line(THE_SECRET, &name, 0, 10, 0), THE_SECRET).unwrap_err();
        assert_matches!(&err, ScoreError::Weight { test_name, .. } if test_name == "leak ******");
        assert!(!err.to_string().contains(THE_SECRET));

        let score = parse(&line(THE_SECRET, &name, 1, 10, 1), THE_SECRET).unwrap();
        assert_eq!(score.test_name, "leak ******");

        let out = format!("{}\n{}", line(THE_SECRET, &name, 0, 10, 0), line(THE_SECRET, "T1", 1, 1, 1));
        let err = extract_results(&out, THE_SECRET, Duration::ZERO).unwrap_err();
        for rejected in err.rejected() {
            assert!(!rejected.to_string().contains(THE_SECRET));
        }
    }

    #[test]
    fn test_score_invariants() {
        let cases = [
            (line(THE_SECRET, "", 0, 100, 10), "empty test name"),
            (line(THE_SECRET, "BadWeights", 0, 100, 0), "weight"),
            (line(THE_SECRET, "BadWeights", 0, 100, -10), "weight"),
            (line(THE_SECRET, "BadMaxScore", 0, 0, 10), "max score"),
            (line(THE_SECRET, "BadMaxScore", 0, -100, 10), "max score"),
            (line(THE_SECRET, "BadScore", -1, 100, 10), "outside"),
            (line(THE_SECRET, "BadScore", 101, 100, 10), "outside"),
        ];
        for (input, want) in cases {
            let err = parse(&input, THE_SECRET).unwrap_err();
            assert!(err.to_string().contains(want), "{}: {}", input, err);
            assert!(!err.to_string().contains(THE_SECRET));
        }
    }

    #[test]
    fn test_score_bounds_accepted() {
        for (score, max, weight) in [(0, 1, 1), (100, 100, 100), (50, 100, 10)] {
            assert!(parse(&line(THE_SECRET, "Good", score, max, weight), THE_SECRET).is_ok());
        }
    }

    #[test]
    fn test_extract_mixed_output() {
        let out = format!(
            "{}\nrandom log noise\n{}\n",
            line("S", "T1", 8, 10, 5),
            line("WRONG", "T2", 1, 1, 1)
        );

        let results = extract_results(&out, "S", Duration::from_millis(1234)).unwrap();

        assert_eq!(
            results.scores,
            vec![Score {
                test_name: "T1".to_string(),
                score: 8,
                max_score: 10,
                weight: 5,
            }]
        );
        assert!(results.build_info.build_log.contains("random log noise"));
        assert!(!results.build_info.build_log.contains('S'));
        assert_eq!(results.build_info.exec_time, Duration::from_millis(1234));
    }

    #[test]
    fn test_extract_keeps_order_of_appearance() {
        let out = [
            line(THE_SECRET, "Second", 1, 1, 1),
            "noise".to_string(),
            line(THE_SECRET, "First", 1, 1, 1),
            line(THE_SECRET, "Third", 0, 1, 1),
        ]
        .join("\n");

        let results = extract_results(&out, THE_SECRET, Duration::ZERO).unwrap();
        let names: Vec<_> = results.scores.iter().map(|s| s.test_name.as_str()).collect();
        assert_eq!(names, ["Second", "First", "Third"]);
        assert_eq!(results.build_info.build_log, "noise");
    }

    #[test]
    fn test_extract_redacts_secret_in_text_lines() {
        let out = format!(
            "line contains {s}\n{s} should not be revealed\n{rec}",
            s = THE_SECRET,
            rec = line(THE_SECRET, "T", 1, 1, 1)
        );

        let results = extract_results(&out, THE_SECRET, Duration::ZERO).unwrap();
        assert_eq!(
            results.build_info.build_log,
            "line contains ******\n****** should not be revealed"
        );
    }

    #[test]
    fn test_extract_preserves_non_record_json_verbatim() {
        let out = format!("{{\"level\":\"info\"}}\n\n  indented\n{}", line(THE_SECRET, "T", 1, 1, 1));

        let results = extract_results(&out, THE_SECRET, Duration::ZERO).unwrap();
        assert_eq!(results.build_info.build_log, "{\"level\":\"info\"}\n\n  indented");
    }

    #[test]
    fn test_extract_max_score_zero_is_rejected() {
        let out = format!(
            "{}\n{}",
            line(THE_SECRET, "Good", 3, 5, 1),
            line(THE_SECRET, "Broken", 0, 0, 1)
        );

        let err = extract_results(&out, THE_SECRET, Duration::ZERO).unwrap_err();
        assert_matches!(&err, ExtractError::Rejected { .. });
        assert_eq!(
            err.rejected(),
            [ScoreError::MaxScore {
                test_name: "Broken".to_string(),
                max_score: 0
            }]
        );
        let results = err.into_results();
        assert_eq!(results.scores.len(), 1);
        assert_eq!(results.scores[0].test_name, "Good");
        assert!(results.build_info.build_log.is_empty());
    }

    #[test]
    fn test_extract_partial_output_without_records() {
        let err = extract_results("partial: ok so far\n", THE_SECRET, Duration::from_secs(3))
            .unwrap_err();

        assert_matches!(&err, ExtractError::NotFound { rejected, .. } if rejected.is_empty());
        assert!(err.results().is_empty());
        assert_eq!(err.results().build_info.build_log, "partial: ok so far");
    }

    #[test]
    fn test_extract_only_forged_records() {
        let out = line("guessed", "TestAll", 100, 100, 1);

        let err = extract_results(&out, THE_SECRET, Duration::ZERO).unwrap_err();
        assert_matches!(&err, ExtractError::NotFound { rejected, .. } if rejected.is_empty());
        assert!(err.results().build_info.build_log.is_empty());
    }

    #[test]
    fn test_extract_rejects_record_from_another_run() {
        let secret_a = "run-a-secret";
        let secret_b = "run-b-secret";
        let forged = line(secret_a, "T1", 10, 10, 1);
        let out_b = format!("{}\n{}", forged, line(secret_b, "T1", 2, 10, 1));

        let results = extract_results(&out_b, secret_b, Duration::ZERO).unwrap();
        assert_eq!(results.scores.len(), 1);
        assert_eq!(results.scores[0].score, 2);
    }

    #[test]
    fn test_extract_with_empty_secret_accepts_nothing() {
        let out = format!("{}\nnoise", line("", "T", 1, 1, 1));

        let err = extract_results(&out, "", Duration::ZERO).unwrap_err();
        assert_matches!(err, ExtractError::NotFound { .. });
    }

    #[test]
    fn test_extract_is_deterministic() {
        let out = format!(
            "a\n{}\nb\n{}",
            line(THE_SECRET, "T1", 1, 2, 3),
            line(THE_SECRET, "T2", 0, 0, 1)
        );
        let first = extract_results(&out, THE_SECRET, Duration::from_millis(7)).unwrap_err();
        let second = extract_results(&out, THE_SECRET, Duration::from_millis(7)).unwrap_err();

        assert_eq!(first.results(), second.results());
        assert_eq!(first.rejected(), second.rejected());
    }
}
