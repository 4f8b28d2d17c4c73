use std::fmt::Write;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ScoringSettings;
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{Transcript, Turn};

const TEMPERATURE: f32 = 0.3;
const TOP_P: f32 = 0.9;
const MAX_OUTPUT_TOKENS: u32 = 800;

const SYSTEM_PROMPT: &str = "You are a strict, consistent auditor of educational mentoring chats. \
Lean towards the midpoint unless the evidence is strong. \
Reply with ONE compact JSON object that follows the given schema exactly, \
without markdown or commentary.";

const PROMPT_INSTRUCTIONS: &str = r#"Evaluate this week's chat between Student, Mentor and AI.
Rules:
- Always return one complete, parseable JSON object.
- Numbers you cannot infer are 0; sentiments you cannot infer are "Neutro".
- No markdown fences, no comments.

Schema:
{
  "misunderstood_pct": number 0-100, share of student messages that were misunderstood,
  "empathy_ai": number 1-10,
  "empathy_mentor": number 1-10,
  "sentiment_student_start": one of Ansioso, Confundido, Frustrado, Neutro, Motivado,
      Tranquilo, Alegre, Triste, Enojado,
  "sentiment_student_end": same options, for the end of the conversation,
  "emotion_avg": number 1-10,
  "warmth_ai": number 1-10,
  "warmth_mentor": number 1-10,
  "overall_comment": string,
  "satisfiedUser": "true" if the request was resolved, otherwise "false",
  "issue": "Pregunta frecuente" or "Justificación de inasistencia"
}

"#;

/// Sends one transcript to the judge model and returns its raw text.
///
/// Implementations must report transport problems as
/// [`AnalysisError::Transport`] and leave JSON validation to the caller.
#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn analyze(
        &self,
        transcript: &Transcript,
        cancel: &CancellationToken,
    ) -> AnalysisResult<String>;
}

/// Chat-completions client for OpenAI and Azure OpenAI deployments.
pub struct OpenAiScoringClient {
    client: reqwest::Client,
    settings: ScoringSettings,
    url: String,
}

impl OpenAiScoringClient {
    pub fn new(settings: ScoringSettings) -> AnalysisResult<Self> {
        settings.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| AnalysisError::configuration(format!("http client: {err}")))?;
        let url = settings.completions_url();
        Ok(Self {
            client,
            settings,
            url,
        })
    }

    fn request_body(&self, transcript: &Transcript) -> Value {
        let mut body = json!({
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(transcript) },
            ],
            "temperature": TEMPERATURE,
            "top_p": TOP_P,
            "max_tokens": MAX_OUTPUT_TOKENS,
        });
        if !self.settings.is_azure() {
            body["model"] = json!(self.settings.model);
        }
        body
    }

    async fn send(&self, transcript: &Transcript) -> AnalysisResult<String> {
        let request = self.client.post(&self.url).json(&self.request_body(transcript));
        let request = if self.settings.is_azure() {
            request.header("api-key", &self.settings.api_key)
        } else {
            request.bearer_auth(&self.settings.api_key)
        };

        let resp = request
            .send()
            .await
            .map_err(|err| AnalysisError::transport(err.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(AnalysisError::transport(format!(
                "chat completions returned {status}: {error_text}"
            )));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|err| AnalysisError::transport(format!("unreadable response body: {err}")))?;
        extract_content(&payload)
    }
}

#[async_trait]
impl ScoringClient for OpenAiScoringClient {
    async fn analyze(
        &self,
        transcript: &Transcript,
        cancel: &CancellationToken,
    ) -> AnalysisResult<String> {
        debug!(
            chat_id = transcript.chat_id,
            turns = transcript.turns.len(),
            "scoring transcript"
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(AnalysisError::Cancelled),
            text = self.send(transcript) => text,
        }
    }
}

/// Pulls `choices[0].message.content`, which is either a string or a list of text parts.
fn extract_content(payload: &Value) -> AnalysisResult<String> {
    match payload.pointer("/choices/0/message/content") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(parts)) => Ok(parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect()),
        Some(Value::Null) => Ok(String::new()),
        _ => Err(AnalysisError::format(
            "response is missing choices[0].message.content",
        )),
    }
}

/// User message for one transcript. Turns are listed oldest first.
pub fn build_prompt(transcript: &Transcript) -> String {
    let mut prompt = String::from(PROMPT_INSTRUCTIONS);
    let _ = writeln!(prompt, "Transcript (chronological):");

    let mut turns: Vec<&Turn> = transcript.turns.iter().collect();
    turns.sort_by_key(|turn| turn.timestamp_utc);
    for turn in turns {
        let marker = if turn.ai_enabled { " (AI on)" } else { "" };
        let _ = writeln!(
            prompt,
            "[{}] {}{}: {}",
            turn.timestamp_utc.to_rfc3339(),
            turn.sender_role.as_str(),
            marker,
            turn.text
        );
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderRole;
    use chrono::{TimeZone, Utc};

    fn turn(minute: u32, role: SenderRole, ai_enabled: bool, text: &str) -> Turn {
        Turn {
            timestamp_utc: Utc.with_ymd_and_hms(2024, 1, 8, 15, minute, 0).unwrap(),
            sender_role: role,
            ai_enabled,
            text: text.to_string(),
        }
    }

    #[test]
    fn prompt_lists_turns_oldest_first() {
        let transcript = Transcript {
            chat_id: 9,
            mentor_id: Some(1),
            student_id: Some(2),
            turns: vec![
                turn(5, SenderRole::Ai, true, "second"),
                turn(1, SenderRole::Student, false, "first"),
            ],
        };
        let prompt = build_prompt(&transcript);
        let first = prompt.find("Student: first").unwrap();
        let second = prompt.find("AI (AI on): second").unwrap();
        assert!(first < second);
    }

    #[test]
    fn content_can_be_a_string_or_parts() {
        let plain = json!({ "choices": [{ "message": { "content": "{\"a\":1}" } }] });
        assert_eq!(extract_content(&plain).unwrap(), "{\"a\":1}");

        let parts = json!({ "choices": [{ "message": { "content": [
            { "type": "text", "text": "{\"a\":" },
            { "type": "text", "text": "1}" }
        ] } }] });
        assert_eq!(extract_content(&parts).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn missing_content_is_a_format_error() {
        let payload = json!({ "choices": [] });
        assert!(matches!(
            extract_content(&payload),
            Err(AnalysisError::ScoringFormat(_))
        ));
    }

    #[test]
    fn client_requires_an_api_key() {
        let settings = ScoringSettings {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            deployment: None,
            api_version: "2024-06-01".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
        };
        assert!(matches!(
            OpenAiScoringClient::new(settings),
            Err(AnalysisError::Configuration(_))
        ));
    }
}
