use crate::models::{
    ChatId, Observation, ObservationValue, ParameterCode, RunId, ScoreResult, Window,
};

/// Expands one scored chat into its eight observation rows, in canonical code order.
pub fn to_observations(
    result: &ScoreResult,
    run_id: RunId,
    chat_id: ChatId,
    window: Window,
    mentor_id: Option<i64>,
    student_id: Option<i64>,
) -> Vec<Observation> {
    ParameterCode::ALL
        .into_iter()
        .map(|code| Observation {
            run_id,
            chat_id,
            code,
            window,
            value: value_for(result, code),
            mentor_id,
            student_id,
            subject_role: code.subject_role(),
        })
        .collect()
}

fn value_for(result: &ScoreResult, code: ParameterCode) -> ObservationValue {
    match code {
        ParameterCode::MisunderstoodPct => ObservationValue::Score(result.misunderstood_pct),
        ParameterCode::EmpathyAi => ObservationValue::Score(result.empathy_ai),
        ParameterCode::EmpathyMentor => ObservationValue::Score(result.empathy_mentor),
        ParameterCode::SentimentStudentStart => {
            ObservationValue::Content(result.sentiment_student_start.clone())
        }
        ParameterCode::SentimentStudentEnd => {
            ObservationValue::Content(result.sentiment_student_end.clone())
        }
        ParameterCode::EmotionAvg => ObservationValue::Score(result.emotion_avg),
        ParameterCode::WarmthAi => ObservationValue::Score(result.warmth_ai),
        ParameterCode::WarmthMentor => ObservationValue::Score(result.warmth_mentor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubjectRole;
    use chrono::{TimeZone, Utc};

    fn sample_result() -> ScoreResult {
        ScoreResult {
            misunderstood_pct: 20.0,
            empathy_ai: 6.0,
            empathy_mentor: 8.0,
            sentiment_student_start: "Frustrado".to_string(),
            sentiment_student_end: "Motivado".to_string(),
            emotion_avg: 5.0,
            warmth_ai: 7.0,
            warmth_mentor: 9.0,
            overall_comment: "ok".to_string(),
            satisfied_user: "true".to_string(),
            issue: "Pregunta frecuente".to_string(),
        }
    }

    fn sample_window() -> Window {
        Window::new(
            Utc.with_ymd_and_hms(2024, 1, 7, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 14, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn yields_one_row_per_code() {
        let rows = to_observations(&sample_result(), 7, 42, sample_window(), Some(3), None);
        assert_eq!(rows.len(), 8);
        let codes: Vec<_> = rows.iter().map(|row| row.code).collect();
        assert_eq!(codes, ParameterCode::ALL.to_vec());
        assert!(rows.iter().all(|row| row.run_id == 7 && row.chat_id == 42));
        assert!(rows.iter().all(|row| row.window == sample_window()));
        assert!(rows
            .iter()
            .all(|row| row.mentor_id == Some(3) && row.student_id.is_none()));
    }

    #[test]
    fn score_and_content_are_exclusive() {
        let rows = to_observations(&sample_result(), 1, 1, sample_window(), None, None);
        for row in &rows {
            if row.code.is_numeric() {
                assert!(row.score().is_some());
                assert!(row.content().is_none());
            } else {
                assert!(row.score().is_none());
                assert!(row.content().is_some());
            }
        }
        let start = rows
            .iter()
            .find(|row| row.code == ParameterCode::SentimentStudentStart)
            .unwrap();
        assert_eq!(start.content(), Some("Frustrado"));
    }

    #[test]
    fn subject_roles_follow_the_code() {
        let rows = to_observations(&sample_result(), 1, 1, sample_window(), None, None);
        let role_of = |code: ParameterCode| {
            rows.iter()
                .find(|row| row.code == code)
                .map(|row| row.subject_role)
                .unwrap()
        };
        assert_eq!(role_of(ParameterCode::EmpathyMentor), SubjectRole::Mentor);
        assert_eq!(role_of(ParameterCode::WarmthAi), SubjectRole::Ai);
        assert_eq!(role_of(ParameterCode::EmotionAvg), SubjectRole::Student);
        assert_eq!(role_of(ParameterCode::MisunderstoodPct), SubjectRole::Conversation);
    }
}
