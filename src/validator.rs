use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{ParameterCode, ParameterDefinition, ScoreResult};

/// Inclusive `[min, max]` bound for every numeric parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRanges {
    ranges: BTreeMap<ParameterCode, (f64, f64)>,
}

impl Default for ScoreRanges {
    fn default() -> Self {
        let ranges = ParameterCode::ALL
            .into_iter()
            .filter_map(|code| code.default_range().map(|range| (code, range)))
            .collect();
        Self { ranges }
    }
}

impl ScoreRanges {
    /// Builds ranges from the reference table. Every canonical code must have an
    /// active row; rows with both bounds override the built-in range.
    pub fn from_definitions(definitions: &[ParameterDefinition]) -> AnalysisResult<Self> {
        let mut ranges = Self::default();
        let mut seen = Vec::new();

        for definition in definitions.iter().filter(|d| d.is_active) {
            let Some(code) = ParameterCode::from_code(&definition.code) else {
                continue;
            };
            seen.push(code);
            if !code.is_numeric() {
                continue;
            }
            if let (Some(min), Some(max)) = (definition.min_score, definition.max_score) {
                if !(min.is_finite() && max.is_finite() && min <= max) {
                    return Err(AnalysisError::configuration(format!(
                        "parameter {code} has invalid range [{min}, {max}]"
                    )));
                }
                ranges.ranges.insert(code, (min, max));
            }
        }

        let missing: Vec<&str> = ParameterCode::ALL
            .iter()
            .filter(|code| !seen.contains(code))
            .map(|code| code.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(AnalysisError::configuration(format!(
                "missing active parameter definitions: {}",
                missing.join(",")
            )));
        }

        Ok(ranges)
    }

    pub fn range(&self, code: ParameterCode) -> Option<(f64, f64)> {
        self.ranges.get(&code).copied()
    }

    pub fn clamp(&self, code: ParameterCode, value: f64) -> f64 {
        match self.range(code) {
            Some((min, max)) => value.clamp(min, max),
            None => value,
        }
    }
}

/// Turns raw model text into a [`ScoreResult`].
#[derive(Debug, Clone, Default)]
pub struct ResultValidator {
    ranges: ScoreRanges,
}

impl ResultValidator {
    pub fn new(ranges: ScoreRanges) -> Self {
        Self { ranges }
    }

    pub fn parse(&self, raw_text: &str) -> AnalysisResult<ScoreResult> {
        let json = strip_code_fences(raw_text);
        if json.is_empty() {
            return Err(AnalysisError::EmptyResponse);
        }

        let root: Value =
            serde_json::from_str(json).map_err(|err| AnalysisError::format(err.to_string()))?;
        let Value::Object(fields) = root else {
            return Err(AnalysisError::format("expected a JSON object"));
        };

        let number =
            |key: &str, code: ParameterCode| self.ranges.clamp(code, read_number(&fields, key));

        Ok(ScoreResult {
            misunderstood_pct: number("misunderstood_pct", ParameterCode::MisunderstoodPct),
            empathy_ai: number("empathy_ai", ParameterCode::EmpathyAi),
            empathy_mentor: number("empathy_mentor", ParameterCode::EmpathyMentor),
            sentiment_student_start: read_text(&fields, "sentiment_student_start"),
            sentiment_student_end: read_text(&fields, "sentiment_student_end"),
            emotion_avg: number("emotion_avg", ParameterCode::EmotionAvg),
            warmth_ai: number("warmth_ai", ParameterCode::WarmthAi),
            warmth_mentor: number("warmth_mentor", ParameterCode::WarmthMentor),
            overall_comment: read_text(&fields, "overall_comment"),
            satisfied_user: read_text(&fields, "satisfiedUser"),
            issue: read_text(&fields, "issue"),
        })
    }
}

/// Removes a surrounding markdown fence (with or without a language tag).
/// Anything after the last closing fence is discarded.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = match inner.rfind("```") {
        Some(closing) => &inner[..closing],
        None => inner,
    };
    // Drop the language tag on the opening line, if any.
    let inner = match inner.find('\n') {
        Some(newline) if !inner[..newline].trim_start().starts_with(['{', '[']) => {
            &inner[newline + 1..]
        }
        _ => inner,
    };
    inner.trim()
}

/// Missing, non-numeric or non-finite values read as `0`.
fn read_number(fields: &Map<String, Value>, key: &str) -> f64 {
    let value = match fields.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    value.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn read_text(fields: &Map<String, Value>, key: &str) -> String {
    match fields.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "misunderstood_pct": 12.5,
        "empathy_ai": 7,
        "empathy_mentor": "8",
        "sentiment_student_start": "Ansioso",
        "sentiment_student_end": "Tranquilo",
        "emotion_avg": 6,
        "warmth_ai": 7,
        "warmth_mentor": 9,
        "overall_comment": "Mentor resolved the absence request.",
        "satisfiedUser": "true",
        "issue": "Justificación de inasistencia"
    }"#;

    fn definition(
        id: i32,
        code: ParameterCode,
        range: Option<(f64, f64)>,
    ) -> ParameterDefinition {
        ParameterDefinition {
            parameter_id: id,
            code: code.as_str().to_string(),
            min_score: range.map(|r| r.0),
            max_score: range.map(|r| r.1),
            is_active: true,
        }
    }

    #[test]
    fn parses_complete_payload() {
        let result = ResultValidator::default().parse(FULL).unwrap();
        assert_eq!(result.misunderstood_pct, 12.5);
        assert_eq!(result.empathy_mentor, 8.0);
        assert_eq!(result.sentiment_student_end, "Tranquilo");
        assert_eq!(result.satisfied_user, "true");
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let result = ResultValidator::default()
            .parse(r#"{"misunderstood_pct": 150, "warmth_ai": -3, "warmth_mentor": 42}"#)
            .unwrap();
        assert_eq!(result.misunderstood_pct, 100.0);
        assert_eq!(result.warmth_ai, 1.0);
        assert_eq!(result.warmth_mentor, 10.0);
    }

    #[test]
    fn unparsable_and_missing_numbers_clamp_from_zero() {
        let result = ResultValidator::default()
            .parse(r#"{"empathy_ai": "abc"}"#)
            .unwrap();
        assert_eq!(result.empathy_ai, 1.0);
        assert_eq!(result.emotion_avg, 1.0);
        assert_eq!(result.misunderstood_pct, 0.0);
    }

    #[test]
    fn missing_strings_default_to_empty() {
        let result = ResultValidator::default().parse("{}").unwrap();
        assert_eq!(result.sentiment_student_start, "");
        assert_eq!(result.overall_comment, "");
        assert_eq!(result.issue, "");
    }

    #[test]
    fn fenced_output_is_accepted() {
        let fenced = format!("```json\n{FULL}\n```");
        let result = ResultValidator::default().parse(&fenced).unwrap();
        assert_eq!(result.sentiment_student_start, "Ansioso");

        assert_eq!(strip_code_fences("```{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[test]
    fn chatter_after_closing_fence_is_ignored() {
        let result = ResultValidator::default()
            .parse("```json\n{\"misunderstood_pct\": 5}\n```\nLet me know if you need more.")
            .unwrap();
        assert_eq!(result.misunderstood_pct, 5.0);
        assert_eq!(strip_code_fences("```{\"a\":1}``` thanks"), "{\"a\":1}");
    }

    #[test]
    fn blank_input_is_an_empty_response() {
        let validator = ResultValidator::default();
        assert!(matches!(
            validator.parse(""),
            Err(AnalysisError::EmptyResponse)
        ));
        assert!(matches!(
            validator.parse("  \n"),
            Err(AnalysisError::EmptyResponse)
        ));
        assert!(matches!(
            validator.parse("```\n```"),
            Err(AnalysisError::EmptyResponse)
        ));
    }

    #[test]
    fn invalid_json_is_a_format_error() {
        let validator = ResultValidator::default();
        assert!(matches!(
            validator.parse("The student seemed happy."),
            Err(AnalysisError::ScoringFormat(_))
        ));
        assert!(matches!(
            validator.parse("[1, 2]"),
            Err(AnalysisError::ScoringFormat(_))
        ));
    }

    #[test]
    fn definitions_override_ranges() {
        let definitions: Vec<_> = ParameterCode::ALL
            .into_iter()
            .enumerate()
            .map(|(i, code)| {
                let range = match code {
                    ParameterCode::EmpathyAi => Some((0.0, 5.0)),
                    other => other.default_range(),
                };
                definition(i as i32 + 1, code, range)
            })
            .collect();
        let ranges = ScoreRanges::from_definitions(&definitions).unwrap();
        let result = ResultValidator::new(ranges)
            .parse(r#"{"empathy_ai": 9}"#)
            .unwrap();
        assert_eq!(result.empathy_ai, 5.0);
    }

    #[test]
    fn definitions_without_bounds_keep_defaults() {
        let definitions: Vec<_> = ParameterCode::ALL
            .into_iter()
            .enumerate()
            .map(|(i, code)| definition(i as i32 + 1, code, None))
            .collect();
        let ranges = ScoreRanges::from_definitions(&definitions).unwrap();
        assert_eq!(ranges, ScoreRanges::default());
    }

    #[test]
    fn missing_or_inactive_definitions_are_configuration_errors() {
        let mut definitions: Vec<_> = ParameterCode::ALL
            .into_iter()
            .enumerate()
            .map(|(i, code)| definition(i as i32 + 1, code, code.default_range()))
            .collect();
        definitions[2].is_active = false;
        let err = ScoreRanges::from_definitions(&definitions).unwrap_err();
        assert!(err.to_string().contains("EMPATHY_MENTOR"));
    }

    #[test]
    fn non_finite_bounds_are_configuration_errors() {
        let definitions: Vec<_> = ParameterCode::ALL
            .into_iter()
            .enumerate()
            .map(|(i, code)| {
                let range = match code {
                    ParameterCode::EmpathyAi => Some((1.0, f64::NAN)),
                    other => other.default_range(),
                };
                definition(i as i32 + 1, code, range)
            })
            .collect();
        let err = ScoreRanges::from_definitions(&definitions).unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
        assert!(err.to_string().contains("EMPATHY_AI"));
    }
}
