use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AnalysisSettings;
use crate::db::{Persistence, ScoredChat, TranscriptSource};
use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{ChatId, RunId, Transcript, Window};
use crate::observations::to_observations;
use crate::scoring::ScoringClient;
use crate::validator::{strip_code_fences, ResultValidator};
use crate::window;

/// Decides whether per-chat scoring failures fail the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Only infrastructure failures and cancellation fail the run.
    #[default]
    Lenient,
    /// Any failed chat fails the run.
    Strict,
}

/// Aggregate result of one run, as recorded in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub window: Window,
    pub total: usize,
    pub scored: usize,
    pub failed: usize,
    pub infrastructure_failed: usize,
    pub cancelled: bool,
    pub success: bool,
}

#[derive(Debug)]
enum ChatOutcome {
    Saved,
    DryRun,
    ScoringFailed(AnalysisError),
    InfrastructureFailed(AnalysisError),
    Cancelled,
}

#[derive(Debug, Default)]
struct Tally {
    total: usize,
    scored: usize,
    failed: usize,
    infrastructure_failed: usize,
    cancelled: bool,
}

impl Tally {
    fn record(&mut self, chat_id: ChatId, outcome: ChatOutcome) {
        match outcome {
            ChatOutcome::Saved => {
                self.scored += 1;
                debug!(chat_id, "chat analyzed and saved");
            }
            ChatOutcome::DryRun => {
                self.scored += 1;
                debug!(chat_id, "chat analyzed (dry run, not saved)");
            }
            ChatOutcome::ScoringFailed(err) => {
                self.failed += 1;
                error!(chat_id, error = %err, "chat scoring failed");
            }
            ChatOutcome::InfrastructureFailed(err) => {
                self.infrastructure_failed += 1;
                error!(chat_id, error = %err, "chat lost to an infrastructure failure");
            }
            ChatOutcome::Cancelled => {
                self.cancelled = true;
                warn!(chat_id, "chat abandoned after cancellation");
            }
        }
    }

    fn success(&self, policy: FailurePolicy) -> bool {
        if self.cancelled || self.infrastructure_failed > 0 {
            return false;
        }
        match policy {
            FailurePolicy::Lenient => true,
            FailurePolicy::Strict => self.failed == 0,
        }
    }
}

/// One unit of work: score, validate, map and save a single transcript.
#[derive(Clone)]
struct ChatUnit {
    store: Arc<dyn Persistence>,
    client: Arc<dyn ScoringClient>,
    validator: Arc<ResultValidator>,
    run_id: RunId,
    window: Window,
    dry_run: bool,
}

impl ChatUnit {
    async fn process(&self, transcript: Transcript, cancel: &CancellationToken) -> ChatOutcome {
        if cancel.is_cancelled() {
            return ChatOutcome::Cancelled;
        }
        if !transcript.is_chronological() {
            warn!(
                chat_id = transcript.chat_id,
                "transcript turns are not in chronological order"
            );
        }

        let raw = match self.client.analyze(&transcript, cancel).await {
            Ok(raw) => raw,
            Err(AnalysisError::Cancelled) => return ChatOutcome::Cancelled,
            Err(err) if err.is_per_chat() => return ChatOutcome::ScoringFailed(err),
            Err(err) => return ChatOutcome::InfrastructureFailed(err),
        };
        let result = match self.validator.parse(&raw) {
            Ok(result) => result,
            Err(err) => return ChatOutcome::ScoringFailed(err),
        };
        if self.dry_run {
            return ChatOutcome::DryRun;
        }

        let observations = to_observations(
            &result,
            self.run_id,
            transcript.chat_id,
            self.window,
            transcript.mentor_id,
            transcript.student_id,
        );
        let chat = ScoredChat {
            run_id: self.run_id,
            chat_id: transcript.chat_id,
            window: self.window,
            result,
            raw_json: strip_code_fences(&raw).to_string(),
            observations,
        };

        tokio::select! {
            _ = cancel.cancelled() => ChatOutcome::Cancelled,
            saved = self.store.save_result(&chat) => match saved {
                Ok(()) => ChatOutcome::Saved,
                Err(err) => ChatOutcome::InfrastructureFailed(err),
            },
        }
    }
}

pub struct RunCoordinator {
    source: Arc<dyn TranscriptSource>,
    store: Arc<dyn Persistence>,
    client: Arc<dyn ScoringClient>,
    validator: Arc<ResultValidator>,
    settings: AnalysisSettings,
}

impl RunCoordinator {
    pub fn new(
        source: Arc<dyn TranscriptSource>,
        store: Arc<dyn Persistence>,
        client: Arc<dyn ScoringClient>,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            source,
            store,
            client,
            validator: Arc::new(ResultValidator::default()),
            settings,
        }
    }

    pub fn with_validator(mut self, validator: ResultValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    /// Runs the pipeline once and returns the run id.
    pub async fn run(
        &self,
        window: Option<Window>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> AnalysisResult<RunId> {
        self.run_detailed(window, dry_run, cancel)
            .await
            .map(|outcome| outcome.run_id)
    }

    /// Like [`run`](Self::run) but also reports the per-chat counts.
    ///
    /// Errors only for configuration problems, a run that cannot start, a
    /// transcript fetch that fails, or a run that cannot be completed. Once a
    /// run has started it is always completed before returning, cancelled or not.
    pub async fn run_detailed(
        &self,
        window: Option<Window>,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> AnalysisResult<RunOutcome> {
        self.settings.validate()?;
        let window = window::resolve(window, &self.settings.timezone)?;
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        info!(
            window_start = %window.start(),
            window_end = %window.end(),
            timezone = %self.settings.timezone,
            dry_run,
            "weekly analysis starting"
        );

        let run_id = self
            .store
            .start_run(
                window,
                &self.settings.model_version,
                &self.settings.prompt_version,
            )
            .await?;

        let (tally, fatal) = match self.dispatch(run_id, window, dry_run, cancel).await {
            Ok(tally) => (tally, None),
            Err(err) => (Tally::default(), Some(err)),
        };
        let success = fatal.is_none() && tally.success(self.settings.failure_policy());

        if let Err(err) = self.store.complete_run(run_id, success).await {
            error!(run_id, error = %err, "run could not be completed and may remain Running");
            return Err(err);
        }
        if let Some(err) = fatal {
            error!(run_id, error = %err, "weekly analysis aborted");
            return Err(err);
        }

        let outcome = RunOutcome {
            run_id,
            window,
            total: tally.total,
            scored: tally.scored,
            failed: tally.failed,
            infrastructure_failed: tally.infrastructure_failed,
            cancelled: tally.cancelled,
            success,
        };
        if outcome.failed > 0 || outcome.infrastructure_failed > 0 || outcome.cancelled {
            warn!(
                run_id,
                failed = outcome.failed,
                infrastructure_failed = outcome.infrastructure_failed,
                cancelled = outcome.cancelled,
                success = outcome.success,
                window = %outcome.window,
                "weekly analysis finished with failures"
            );
        } else {
            info!(
                run_id,
                total = outcome.total,
                scored = outcome.scored,
                window = %outcome.window,
                dry_run,
                "weekly analysis completed"
            );
        }
        Ok(outcome)
    }

    /// Fetches transcripts and fans them out over at most `max_parallel` units.
    async fn dispatch(
        &self,
        run_id: RunId,
        window: Window,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> AnalysisResult<Tally> {
        let mut tally = Tally::default();

        let transcripts = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tally.cancelled = true;
                return Ok(tally);
            }
            fetched = self.source.fetch(window) => fetched?,
        };
        tally.total = transcripts.len();
        info!(run_id, count = tally.total, "chat transcripts to analyze");
        if transcripts.is_empty() {
            warn!(run_id, "no transcripts found for window");
            return Ok(tally);
        }

        let unit = ChatUnit {
            store: Arc::clone(&self.store),
            client: Arc::clone(&self.client),
            validator: Arc::clone(&self.validator),
            run_id,
            window,
            dry_run,
        };
        let semaphore = Arc::new(Semaphore::new(self.settings.effective_max_parallel()));
        let mut units = JoinSet::new();

        for transcript in transcripts {
            // Blocks here while every worker is busy.
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tally.cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let unit = unit.clone();
            let cancel = cancel.clone();
            units.spawn(async move {
                let _permit = permit;
                let chat_id = transcript.chat_id;
                (chat_id, unit.process(transcript, &cancel).await)
            });
        }

        while let Some(joined) = units.join_next().await {
            match joined {
                Ok((chat_id, outcome)) => tally.record(chat_id, outcome),
                Err(err) => {
                    tally.failed += 1;
                    error!(run_id, error = %err, "chat worker panicked");
                }
            }
        }
        Ok(tally)
    }
}
