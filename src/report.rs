use std::collections::HashMap;
use std::fmt::Write;

use crate::models::{ParameterCode, ParameterStat, RunRecord, SentimentShift};

const BLANK_LABEL: &str = "(blank)";

/// Chats per ending sentiment, most common first.
pub fn summarize_end_sentiments(shifts: &[SentimentShift]) -> Vec<(String, i64)> {
    let mut map: HashMap<&str, i64> = HashMap::new();
    for shift in shifts {
        *map.entry(label(&shift.end)).or_insert(0) += shift.chat_count;
    }

    let mut summary: Vec<(String, i64)> = map
        .into_iter()
        .map(|(end, count)| (end.to_string(), count))
        .collect();
    summary.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    summary
}

fn label(text: &str) -> &str {
    if text.trim().is_empty() {
        BLANK_LABEL
    } else {
        text
    }
}

fn describe(code: &str) -> &'static str {
    match ParameterCode::from_code(code) {
        Some(ParameterCode::MisunderstoodPct) => "misunderstood student messages (%)",
        Some(ParameterCode::EmpathyAi) => "AI empathy",
        Some(ParameterCode::EmpathyMentor) => "mentor empathy",
        Some(ParameterCode::EmotionAvg) => "average student emotion",
        Some(ParameterCode::WarmthAi) => "AI warmth",
        Some(ParameterCode::WarmthMentor) => "mentor warmth",
        _ => "other",
    }
}

pub fn build_report(
    run: &RunRecord,
    chats_scored: i64,
    stats: &[ParameterStat],
    shifts: &[SentimentShift],
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Mentor Chat Analysis Report");
    let _ = writeln!(
        output,
        "Run {} ({}) covering {} to {}",
        run.run_id,
        run.status.as_str(),
        run.window.start().to_rfc3339(),
        run.window.end().to_rfc3339()
    );
    let _ = writeln!(
        output,
        "Model {} / prompt {}, started {}",
        run.model_version.as_deref().unwrap_or("unknown"),
        run.prompt_version.as_deref().unwrap_or("unknown"),
        run.created_at.to_rfc3339()
    );
    let _ = writeln!(output, "Chats scored: {chats_scored}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Parameter Averages");

    if stats.is_empty() {
        let _ = writeln!(output, "No scored observations recorded for this run.");
    } else {
        for stat in stats {
            let _ = writeln!(
                output,
                "- {} ({}): avg {:.2}, range {:.1}-{:.1} across {} chats",
                stat.code,
                describe(&stat.code),
                stat.avg_score,
                stat.min_score,
                stat.max_score,
                stat.count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Student Sentiment Shifts");

    if shifts.is_empty() {
        let _ = writeln!(output, "No sentiment observations recorded for this run.");
    } else {
        for shift in shifts.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} -> {}: {} chats",
                label(&shift.start),
                label(&shift.end),
                shift.chat_count
            );
        }

        let _ = writeln!(output);
        let _ = writeln!(output, "## Ending Sentiment Mix");
        for (end, count) in summarize_end_sentiments(shifts) {
            let _ = writeln!(output, "- {end}: {count} chats");
        }
    }

    output
}
