use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, AnalysisResult};

pub type RunId = i64;
pub type ChatId = i64;

/// Half-open UTC interval `[start, end)` analysed by one run. Only
/// [`Window::new`] builds one, so `start < end` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
}

impl Window {
    pub fn new(start_utc: DateTime<Utc>, end_utc: DateTime<Utc>) -> AnalysisResult<Self> {
        if start_utc >= end_utc {
            return Err(AnalysisError::InvalidWindow {
                start: start_utc.to_rfc3339(),
                end: end_utc.to_rfc3339(),
            });
        }
        Ok(Self { start_utc, end_utc })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start_utc
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end_utc
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start_utc.to_rfc3339(),
            self.end_utc.to_rfc3339()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SenderRole {
    Student,
    Mentor,
    #[serde(rename = "AI")]
    Ai,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderRole::Student => "Student",
            SenderRole::Mentor => "Mentor",
            SenderRole::Ai => "AI",
        }
    }
}

impl FromStr for SenderRole {
    type Err = AnalysisError;

    /// Accepts the English labels plus the Spanish ones the chat platform stores.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "student" | "estudiante" => Ok(SenderRole::Student),
            "mentor" => Ok(SenderRole::Mentor),
            "ai" | "ia" => Ok(SenderRole::Ai),
            other => Err(AnalysisError::configuration(format!(
                "unknown sender role '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub timestamp_utc: DateTime<Utc>,
    pub sender_role: SenderRole,
    pub ai_enabled: bool,
    pub text: String,
}

/// One chat's messages inside a window, already sanitized upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub chat_id: ChatId,
    pub mentor_id: Option<i64>,
    pub student_id: Option<i64>,
    pub turns: Vec<Turn>,
}

impl Transcript {
    pub fn is_chronological(&self) -> bool {
        self.turns
            .windows(2)
            .all(|pair| pair[0].timestamp_utc <= pair[1].timestamp_utc)
    }
}

/// Typed, range-clamped model output for one transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreResult {
    pub misunderstood_pct: f64,
    pub empathy_ai: f64,
    pub empathy_mentor: f64,
    pub sentiment_student_start: String,
    pub sentiment_student_end: String,
    pub emotion_avg: f64,
    pub warmth_ai: f64,
    pub warmth_mentor: f64,
    pub overall_comment: String,
    pub satisfied_user: String,
    pub issue: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "Running",
            RunStatus::Completed => "Completed",
            RunStatus::Failed => "Failed",
        }
    }

    pub fn terminal(success: bool) -> Self {
        if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        }
    }
}

impl FromStr for RunStatus {
    type Err = AnalysisError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "Running" => Ok(RunStatus::Running),
            "Completed" => Ok(RunStatus::Completed),
            "Failed" => Ok(RunStatus::Failed),
            other => Err(AnalysisError::configuration(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: RunId,
    pub window: Window,
    pub status: RunStatus,
    pub model_version: Option<String>,
    pub prompt_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Whose behaviour a parameter measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectRole {
    Student,
    Mentor,
    Ai,
    Conversation,
}

impl SubjectRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectRole::Student => "Student",
            SubjectRole::Mentor => "Mentor",
            SubjectRole::Ai => "AI",
            SubjectRole::Conversation => "Conversation",
        }
    }
}

/// The eight canonical scored dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterCode {
    MisunderstoodPct,
    EmpathyAi,
    EmpathyMentor,
    SentimentStudentStart,
    SentimentStudentEnd,
    EmotionAvg,
    WarmthAi,
    WarmthMentor,
}

impl ParameterCode {
    pub const ALL: [ParameterCode; 8] = [
        ParameterCode::MisunderstoodPct,
        ParameterCode::EmpathyAi,
        ParameterCode::EmpathyMentor,
        ParameterCode::SentimentStudentStart,
        ParameterCode::SentimentStudentEnd,
        ParameterCode::EmotionAvg,
        ParameterCode::WarmthAi,
        ParameterCode::WarmthMentor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterCode::MisunderstoodPct => "MISUNDERSTOOD_PCT",
            ParameterCode::EmpathyAi => "EMPATHY_AI",
            ParameterCode::EmpathyMentor => "EMPATHY_MENTOR",
            ParameterCode::SentimentStudentStart => "SENTIMENT_STUDENT_START",
            ParameterCode::SentimentStudentEnd => "SENTIMENT_STUDENT_END",
            ParameterCode::EmotionAvg => "EMOTION_AVG",
            ParameterCode::WarmthAi => "WARMTH_AI",
            ParameterCode::WarmthMentor => "WARMTH_MENTOR",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str().eq_ignore_ascii_case(code.trim()))
    }

    /// Numeric codes carry a score; sentiment codes carry free text.
    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            ParameterCode::SentimentStudentStart | ParameterCode::SentimentStudentEnd
        )
    }

    pub fn subject_role(&self) -> SubjectRole {
        match self {
            ParameterCode::MisunderstoodPct => SubjectRole::Conversation,
            ParameterCode::EmpathyAi | ParameterCode::WarmthAi => SubjectRole::Ai,
            ParameterCode::EmpathyMentor | ParameterCode::WarmthMentor => SubjectRole::Mentor,
            ParameterCode::SentimentStudentStart
            | ParameterCode::SentimentStudentEnd
            | ParameterCode::EmotionAvg => SubjectRole::Student,
        }
    }

    /// Range used when no definition row overrides it.
    pub fn default_range(&self) -> Option<(f64, f64)> {
        match self {
            ParameterCode::MisunderstoodPct => Some((0.0, 100.0)),
            ParameterCode::SentimentStudentStart | ParameterCode::SentimentStudentEnd => None,
            _ => Some((1.0, 10.0)),
        }
    }
}

impl fmt::Display for ParameterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A score or a text, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservationValue {
    Score(f64),
    Content(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub run_id: RunId,
    pub chat_id: ChatId,
    pub code: ParameterCode,
    pub window: Window,
    pub value: ObservationValue,
    pub mentor_id: Option<i64>,
    pub student_id: Option<i64>,
    pub subject_role: SubjectRole,
}

impl Observation {
    pub fn score(&self) -> Option<f64> {
        match &self.value {
            ObservationValue::Score(score) => Some(*score),
            ObservationValue::Content(_) => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match &self.value {
            ObservationValue::Score(_) => None,
            ObservationValue::Content(text) => Some(text),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParameterDefinition {
    pub parameter_id: i32,
    pub code: String,
    pub min_score: Option<f64>,
    pub max_score: Option<f64>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ParameterStat {
    pub code: String,
    pub count: i64,
    pub avg_score: f64,
    pub min_score: f64,
    pub max_score: f64,
}

#[derive(Debug, Clone)]
pub struct SentimentShift {
    pub start: String,
    pub end: String,
    pub chat_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_rejects_empty_interval() {
        let at = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        assert!(matches!(
            Window::new(at, at),
            Err(AnalysisError::InvalidWindow { .. })
        ));
    }

    #[test]
    fn window_displays_as_half_open_interval() {
        let start = Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 14, 0, 0, 0).unwrap();
        let window = Window::new(start, end).unwrap();
        assert_eq!(
            window.to_string(),
            "[2024-01-07T00:00:00+00:00, 2024-01-14T00:00:00+00:00)"
        );
    }

    #[test]
    fn sender_roles_accept_platform_labels() {
        assert_eq!("IA".parse::<SenderRole>().unwrap(), SenderRole::Ai);
        assert_eq!(
            " Estudiante ".parse::<SenderRole>().unwrap(),
            SenderRole::Student
        );
        assert!("robot".parse::<SenderRole>().is_err());
    }

    #[test]
    fn exactly_two_codes_are_textual() {
        let textual = ParameterCode::ALL
            .iter()
            .filter(|code| !code.is_numeric())
            .count();
        assert_eq!(textual, 2);
        assert_eq!(
            ParameterCode::from_code("empathy_mentor"),
            Some(ParameterCode::EmpathyMentor)
        );
    }
}
