use clap::Args;

use crate::coordinator::FailurePolicy;
use crate::error::{AnalysisError, AnalysisResult};

pub const DEFAULT_TIMEZONE: &str = "America/Bogota";
pub const DEFAULT_MAX_PARALLEL: usize = 3;

/// Run-level settings; every flag can also come from the environment.
#[derive(Debug, Clone, Args)]
pub struct AnalysisSettings {
    /// IANA timezone used to find the previous calendar week
    #[arg(long, env = "ANALYSIS_TIMEZONE", default_value = DEFAULT_TIMEZONE)]
    pub timezone: String,
    /// Model label recorded on the run for audit
    #[arg(long, env = "ANALYSIS_MODEL_VERSION", default_value = "gpt-4o-mini")]
    pub model_version: String,
    /// Prompt label recorded on the run for audit
    #[arg(long, env = "ANALYSIS_PROMPT_VERSION", default_value = "v1")]
    pub prompt_version: String,
    /// Scoring calls allowed in flight at once
    #[arg(long, env = "ANALYSIS_MAX_PARALLEL", default_value_t = DEFAULT_MAX_PARALLEL)]
    pub max_parallel: usize,
    /// Mark the run failed when any single chat fails
    #[arg(long, env = "ANALYSIS_STRICT")]
    pub strict: bool,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE.to_string(),
            model_version: "gpt-4o-mini".to_string(),
            prompt_version: "v1".to_string(),
            max_parallel: DEFAULT_MAX_PARALLEL,
            strict: false,
        }
    }
}

impl AnalysisSettings {
    pub fn effective_max_parallel(&self) -> usize {
        if self.max_parallel == 0 {
            DEFAULT_MAX_PARALLEL
        } else {
            self.max_parallel
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        if self.strict {
            FailurePolicy::Strict
        } else {
            FailurePolicy::Lenient
        }
    }

    pub fn validate(&self) -> AnalysisResult<()> {
        if self.model_version.trim().is_empty() || self.prompt_version.trim().is_empty() {
            return Err(AnalysisError::configuration(
                "model and prompt version labels must not be empty",
            ));
        }
        crate::window::parse_timezone(&self.timezone).map(|_| ())
    }
}

/// Where and how to reach the chat-completions endpoint.
#[derive(Debug, Clone, Args)]
pub struct ScoringSettings {
    /// Base URL, e.g. https://api.openai.com/v1 or https://<resource>.openai.azure.com
    #[arg(
        long = "scoring-endpoint",
        env = "SCORING_ENDPOINT",
        default_value = "https://api.openai.com/v1"
    )]
    pub endpoint: String,
    #[arg(
        long = "scoring-api-key",
        env = "SCORING_API_KEY",
        hide_env_values = true,
        default_value = ""
    )]
    pub api_key: String,
    /// Azure deployment name; switches to Azure routing and the api-key header
    #[arg(long = "scoring-deployment", env = "SCORING_DEPLOYMENT")]
    pub deployment: Option<String>,
    #[arg(
        long = "scoring-api-version",
        env = "SCORING_API_VERSION",
        default_value = "2024-06-01"
    )]
    pub api_version: String,
    #[arg(long = "scoring-model", env = "SCORING_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,
    #[arg(long = "scoring-timeout-secs", env = "SCORING_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,
}

impl ScoringSettings {
    pub fn validate(&self) -> AnalysisResult<()> {
        if self.endpoint.trim().is_empty() {
            return Err(AnalysisError::configuration("SCORING_ENDPOINT is empty"));
        }
        if self.api_key.trim().is_empty() {
            return Err(AnalysisError::configuration("SCORING_API_KEY is empty"));
        }
        if self.timeout_secs == 0 {
            return Err(AnalysisError::configuration(
                "SCORING_TIMEOUT_SECS must be positive",
            ));
        }
        Ok(())
    }

    pub fn is_azure(&self) -> bool {
        self.deployment
            .as_deref()
            .is_some_and(|deployment| !deployment.trim().is_empty())
    }

    pub fn completions_url(&self) -> String {
        let base = self.endpoint.trim().trim_end_matches('/');
        match self.deployment.as_deref().map(str::trim) {
            Some(deployment) if !deployment.is_empty() => format!(
                "{base}/openai/deployments/{deployment}/chat/completions?api-version={}",
                self.api_version
            ),
            _ => format!("{base}/chat/completions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoring() -> ScoringSettings {
        ScoringSettings {
            endpoint: "https://api.openai.com/v1/".to_string(),
            api_key: "sk-test".to_string(),
            deployment: None,
            api_version: "2024-06-01".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
        }
    }

    #[test]
    fn zero_parallelism_falls_back_to_default() {
        let settings = AnalysisSettings {
            max_parallel: 0,
            ..AnalysisSettings::default()
        };
        assert_eq!(settings.effective_max_parallel(), 3);
    }

    #[test]
    fn bad_timezone_fails_validation() {
        let settings = AnalysisSettings {
            timezone: "Not/AZone".to_string(),
            ..AnalysisSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(AnalysisError::Configuration(_))
        ));
        assert!(AnalysisSettings::default().validate().is_ok());
    }

    #[test]
    fn completions_url_follows_routing() {
        assert_eq!(
            scoring().completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );

        let azure = ScoringSettings {
            endpoint: "https://mentors.openai.azure.com".to_string(),
            deployment: Some("judge".to_string()),
            ..scoring()
        };
        assert!(azure.is_azure());
        assert_eq!(
            azure.completions_url(),
            "https://mentors.openai.azure.com/openai/deployments/judge/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let settings = ScoringSettings {
            api_key: " ".to_string(),
            ..scoring()
        };
        assert!(settings.validate().is_err());
        assert!(scoring().validate().is_ok());
    }
}
