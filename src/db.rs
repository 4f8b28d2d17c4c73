use std::collections::{BTreeMap, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AnalysisError, AnalysisResult};
use crate::models::{
    ChatId, Observation, ParameterCode, ParameterDefinition, ParameterStat, RunId, RunRecord,
    RunStatus, ScoreResult, SenderRole, SentimentShift, Transcript, Turn, Window,
};

/// Supplies the sanitized transcripts for a window, turns oldest first.
#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch(&self, window: Window) -> AnalysisResult<Vec<Transcript>>;
}

/// Everything a successfully scored chat writes.
#[derive(Debug, Clone)]
pub struct ScoredChat {
    pub run_id: RunId,
    pub chat_id: ChatId,
    pub window: Window,
    pub result: ScoreResult,
    pub raw_json: String,
    pub observations: Vec<Observation>,
}

/// Run bookkeeping and result storage.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn start_run(
        &self,
        window: Window,
        model_version: &str,
        prompt_version: &str,
    ) -> AnalysisResult<RunId>;

    /// Writes one summary and its observations atomically.
    async fn save_result(&self, chat: &ScoredChat) -> AnalysisResult<()>;

    /// Sets the terminal status. Fails if the run is unknown or already terminal.
    async fn complete_run(&self, run_id: RunId, success: bool) -> AnalysisResult<()>;
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
    parameter_ids: OnceCell<HashMap<ParameterCode, i32>>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            parameter_ids: OnceCell::new(),
        }
    }

    pub async fn load_parameter_definitions(&self) -> AnalysisResult<Vec<ParameterDefinition>> {
        let rows = sqlx::query(
            "SELECT parameter_id, code, min_score, max_score, is_active \
             FROM mentor_analysis.parameter_definitions ORDER BY parameter_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ParameterDefinition {
                parameter_id: row.get("parameter_id"),
                code: row.get("code"),
                min_score: row.get("min_score"),
                max_score: row.get("max_score"),
                is_active: row.get("is_active"),
            })
            .collect())
    }

    /// Code to id map, loaded once per process.
    async fn parameter_ids(&self) -> AnalysisResult<&HashMap<ParameterCode, i32>> {
        self.parameter_ids
            .get_or_try_init(|| async {
                let definitions = self.load_parameter_definitions().await?;
                let ids: HashMap<ParameterCode, i32> = definitions
                    .iter()
                    .filter(|d| d.is_active)
                    .filter_map(|d| {
                        ParameterCode::from_code(&d.code).map(|code| (code, d.parameter_id))
                    })
                    .collect();
                let missing: Vec<&str> = ParameterCode::ALL
                    .iter()
                    .filter(|code| !ids.contains_key(code))
                    .map(|code| code.as_str())
                    .collect();
                if !missing.is_empty() {
                    return Err(AnalysisError::configuration(format!(
                        "missing active parameter definitions: {}",
                        missing.join(",")
                    )));
                }
                Ok::<_, AnalysisError>(ids)
            })
            .await
    }
}

#[async_trait]
impl TranscriptSource for PgStore {
    async fn fetch(&self, window: Window) -> AnalysisResult<Vec<Transcript>> {
        let rows = sqlx::query(
            r#"
            WITH ai_intervals AS (
                SELECT chat_id,
                       ai_enabled,
                       changed_at AS from_at,
                       LEAD(changed_at, 1, $2)
                           OVER (PARTITION BY chat_id ORDER BY changed_at) AS to_at
                FROM mentor_analysis.chat_ai_state_log
                WHERE changed_at < $2
            )
            SELECT m.chat_id, c.mentor_id, c.student_id, m.sender_role, m.body, m.created_at,
                   COALESCE(ai.ai_enabled, FALSE) AS ai_enabled
            FROM mentor_analysis.chat_messages m
            JOIN mentor_analysis.chats c ON c.chat_id = m.chat_id
            LEFT JOIN ai_intervals ai
              ON ai.chat_id = m.chat_id
             AND m.created_at >= ai.from_at AND m.created_at < ai.to_at
            WHERE m.created_at >= $1 AND m.created_at < $2
            ORDER BY m.chat_id, m.created_at, m.message_id
            "#,
        )
        .bind(window.start())
        .bind(window.end())
        .fetch_all(&self.pool)
        .await?;

        let mut chats: BTreeMap<ChatId, Transcript> = BTreeMap::new();
        for row in rows {
            let chat_id: i64 = row.get("chat_id");
            let raw_role: String = row.get("sender_role");
            let sender_role = match raw_role.parse::<SenderRole>() {
                Ok(role) => role,
                Err(_) => {
                    warn!(chat_id, role = %raw_role, "skipping message with unknown sender role");
                    continue;
                }
            };

            let transcript = chats.entry(chat_id).or_insert_with(|| Transcript {
                chat_id,
                mentor_id: row.get("mentor_id"),
                student_id: row.get("student_id"),
                turns: Vec::new(),
            });
            transcript.turns.push(Turn {
                timestamp_utc: row.get("created_at"),
                sender_role,
                ai_enabled: row.get("ai_enabled"),
                text: row.get("body"),
            });
        }

        info!(count = chats.len(), "built transcripts from chat messages");
        Ok(chats.into_values().collect())
    }
}

#[async_trait]
impl Persistence for PgStore {
    async fn start_run(
        &self,
        window: Window,
        model_version: &str,
        prompt_version: &str,
    ) -> AnalysisResult<RunId> {
        let run_id: RunId = sqlx::query(
            r#"
            INSERT INTO mentor_analysis.runs
            (week_start_utc, week_end_utc, status, model_version, prompt_version)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING run_id
            "#,
        )
        .bind(window.start())
        .bind(window.end())
        .bind(RunStatus::Running.as_str())
        .bind(model_version)
        .bind(prompt_version)
        .fetch_one(&self.pool)
        .await?
        .get("run_id");

        info!(run_id, "analysis run started");
        Ok(run_id)
    }

    async fn save_result(&self, chat: &ScoredChat) -> AnalysisResult<()> {
        debug!(
            run_id = chat.run_id,
            chat_id = chat.chat_id,
            issue = %chat.result.issue,
            satisfied_user = %chat.result.satisfied_user,
            "saving chat result"
        );
        let parameter_ids = self.parameter_ids().await?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO mentor_analysis.summaries
            (run_id, chat_id, week_start_utc, week_end_utc, raw_json)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(chat.run_id)
        .bind(chat.chat_id)
        .bind(chat.window.start())
        .bind(chat.window.end())
        .bind(&chat.raw_json)
        .execute(&mut *tx)
        .await?;

        for observation in &chat.observations {
            let parameter_id = parameter_ids
                .get(&observation.code)
                .copied()
                .ok_or_else(|| {
                    AnalysisError::configuration(format!(
                        "no parameter id for {}",
                        observation.code
                    ))
                })?;

            sqlx::query(
                r#"
                INSERT INTO mentor_analysis.observations
                (run_id, chat_id, parameter_id, week_start_utc, week_end_utc,
                 parameter_score, parameter_content, mentor_id, student_id, subject_role)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(observation.run_id)
            .bind(observation.chat_id)
            .bind(parameter_id)
            .bind(observation.window.start())
            .bind(observation.window.end())
            .bind(observation.score())
            .bind(observation.content())
            .bind(observation.mentor_id)
            .bind(observation.student_id)
            .bind(observation.subject_role.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn complete_run(&self, run_id: RunId, success: bool) -> AnalysisResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE mentor_analysis.runs
            SET status = $2, completed_at = now()
            WHERE run_id = $1 AND status = $3
            "#,
        )
        .bind(run_id)
        .bind(RunStatus::terminal(success).as_str())
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AnalysisError::Persistence(sqlx::Error::RowNotFound));
        }
        Ok(())
    }
}

/// Upserts the canonical parameter definitions and a couple of demo chats
/// dated inside `window`.
pub async fn seed(pool: &PgPool, window: Window) -> anyhow::Result<()> {
    let definitions = [
        (ParameterCode::MisunderstoodPct, "Misunderstood messages (%)"),
        (ParameterCode::EmpathyAi, "AI empathy"),
        (ParameterCode::EmpathyMentor, "Mentor empathy"),
        (ParameterCode::SentimentStudentStart, "Student sentiment at start"),
        (ParameterCode::SentimentStudentEnd, "Student sentiment at end"),
        (ParameterCode::EmotionAvg, "Average student emotion"),
        (ParameterCode::WarmthAi, "AI warmth"),
        (ParameterCode::WarmthMentor, "Mentor warmth"),
    ];

    for (code, name) in definitions {
        let range = code.default_range();
        sqlx::query(
            r#"
            INSERT INTO mentor_analysis.parameter_definitions (code, name, min_score, max_score)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (code) DO UPDATE
            SET name = EXCLUDED.name, min_score = EXCLUDED.min_score,
                max_score = EXCLUDED.max_score, is_active = TRUE
            "#,
        )
        .bind(code.as_str())
        .bind(name)
        .bind(range.map(|r| r.0))
        .bind(range.map(|r| r.1))
        .execute(pool)
        .await?;
    }

    let chats = [(1001_i64, Some(501_i64), Some(9001_i64)), (1002, Some(502), Some(9002))];
    for (chat_id, mentor_id, student_id) in chats {
        upsert_chat(pool, chat_id, mentor_id, student_id).await?;
    }

    let monday = window.start() + Duration::days(1);
    let messages = [
        ("seed-001", 1001_i64, "Estudiante", "Hola, no pude asistir a la clase del lunes.", 0),
        ("seed-002", 1001, "IA", "Gracias por avisar. ¿Cuál fue el motivo?", 2),
        ("seed-003", 1001, "Mentor", "Envíame el certificado médico y lo registramos.", 30),
        ("seed-004", 1002, "Estudiante", "¿Dónde veo mis notas?", 60),
        ("seed-005", 1002, "IA", "En el portal, sección Calificaciones.", 61),
    ];
    for (source_key, chat_id, role, body, minutes) in messages {
        sqlx::query(
            r#"
            INSERT INTO mentor_analysis.chat_messages
            (chat_id, sender_role, body, created_at, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(chat_id)
        .bind(role)
        .bind(body)
        .bind(monday + Duration::minutes(minutes))
        .bind(source_key)
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO mentor_analysis.chat_ai_state_log (chat_id, ai_enabled, changed_at)
        VALUES ($1, TRUE, $2)
        ON CONFLICT (chat_id, changed_at) DO NOTHING
        "#,
    )
    .bind(1002_i64)
    .bind(window.start())
    .execute(pool)
    .await?;

    Ok(())
}

async fn upsert_chat(
    pool: &PgPool,
    chat_id: i64,
    mentor_id: Option<i64>,
    student_id: Option<i64>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO mentor_analysis.chats (chat_id, mentor_id, student_id)
        VALUES ($1, $2, $3)
        ON CONFLICT (chat_id) DO UPDATE
        SET mentor_id = EXCLUDED.mentor_id, student_id = EXCLUDED.student_id
        "#,
    )
    .bind(chat_id)
    .bind(mentor_id)
    .bind(student_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Loads already-sanitized chat messages. Returns how many new messages were stored.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        chat_id: i64,
        mentor_id: Option<i64>,
        student_id: Option<i64>,
        sender_role: String,
        body: String,
        created_at: DateTime<Utc>,
        ai_enabled: Option<bool>,
        source_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        row.sender_role
            .parse::<SenderRole>()
            .with_context(|| format!("chat {}: bad sender role", row.chat_id))?;

        upsert_chat(pool, row.chat_id, row.mentor_id, row.student_id).await?;

        if let Some(ai_enabled) = row.ai_enabled {
            sqlx::query(
                r#"
                INSERT INTO mentor_analysis.chat_ai_state_log (chat_id, ai_enabled, changed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (chat_id, changed_at) DO NOTHING
                "#,
            )
            .bind(row.chat_id)
            .bind(ai_enabled)
            .bind(row.created_at)
            .execute(pool)
            .await?;
        }

        let source_key = row
            .source_key
            .unwrap_or_else(|| format!("import-{}", Uuid::new_v4()));

        let result = sqlx::query(
            r#"
            INSERT INTO mentor_analysis.chat_messages
            (chat_id, sender_role, body, created_at, source_key)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (source_key) DO NOTHING
            "#,
        )
        .bind(row.chat_id)
        .bind(&row.sender_role)
        .bind(&row.body)
        .bind(row.created_at)
        .bind(source_key)
        .execute(pool)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

pub async fn fetch_run(pool: &PgPool, run_id: RunId) -> anyhow::Result<RunRecord> {
    let row = sqlx::query(
        r#"
        SELECT run_id, week_start_utc, week_end_utc, status, model_version, prompt_version,
               created_at
        FROM mentor_analysis.runs
        WHERE run_id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("run {run_id} not found"))?;

    let status: String = row.get("status");
    Ok(RunRecord {
        run_id: row.get("run_id"),
        window: Window::new(row.get("week_start_utc"), row.get("week_end_utc"))?,
        status: status.parse()?,
        model_version: row.get("model_version"),
        prompt_version: row.get("prompt_version"),
        created_at: row.get("created_at"),
    })
}

pub async fn count_summaries(pool: &PgPool, run_id: RunId) -> anyhow::Result<i64> {
    let count: i64 = sqlx::query(
        "SELECT COUNT(*) AS chat_count FROM mentor_analysis.summaries WHERE run_id = $1",
    )
    .bind(run_id)
    .fetch_one(pool)
    .await?
    .get("chat_count");
    Ok(count)
}

pub async fn fetch_parameter_stats(
    pool: &PgPool,
    run_id: RunId,
) -> anyhow::Result<Vec<ParameterStat>> {
    let rows = sqlx::query(
        r#"
        SELECT d.code,
               COUNT(o.parameter_score) AS score_count,
               AVG(o.parameter_score) AS avg_score,
               MIN(o.parameter_score) AS min_score,
               MAX(o.parameter_score) AS max_score
        FROM mentor_analysis.observations o
        JOIN mentor_analysis.parameter_definitions d ON d.parameter_id = o.parameter_id
        WHERE o.run_id = $1 AND o.parameter_score IS NOT NULL
        GROUP BY d.code
        ORDER BY d.code
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ParameterStat {
            code: row.get("code"),
            count: row.get("score_count"),
            avg_score: row.get("avg_score"),
            min_score: row.get("min_score"),
            max_score: row.get("max_score"),
        })
        .collect())
}

pub async fn fetch_sentiment_shifts(
    pool: &PgPool,
    run_id: RunId,
) -> anyhow::Result<Vec<SentimentShift>> {
    let rows = sqlx::query(
        r#"
        SELECT COALESCE(s.parameter_content, '') AS start_label,
               COALESCE(e.parameter_content, '') AS end_label,
               COUNT(*) AS chat_count
        FROM mentor_analysis.observations s
        JOIN mentor_analysis.parameter_definitions ds
          ON ds.parameter_id = s.parameter_id AND ds.code = $2
        JOIN mentor_analysis.observations e
          ON e.run_id = s.run_id AND e.chat_id = s.chat_id
        JOIN mentor_analysis.parameter_definitions de
          ON de.parameter_id = e.parameter_id AND de.code = $3
        WHERE s.run_id = $1
        GROUP BY 1, 2
        ORDER BY chat_count DESC, start_label, end_label
        "#,
    )
    .bind(run_id)
    .bind(ParameterCode::SentimentStudentStart.as_str())
    .bind(ParameterCode::SentimentStudentEnd.as_str())
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| SentimentShift {
            start: row.get("start_label"),
            end: row.get("end_label"),
            chat_count: row.get("chat_count"),
        })
        .collect())
}
