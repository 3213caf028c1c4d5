//! Parsing for the plain-text usage report printed by `ratelimit_check.sh`.
//!
//! The report is loosely structured, so every field is optional and a field
//! that cannot be found is simply left empty.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub struct UsageWindow {
    pub percent: f32,
    pub reset_label: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerUsage {
    pub id: u32,
    /// `None` when the report lists the worker as `<id>:?`.
    pub percent: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageReport {
    pub window_5h: Option<UsageWindow>,
    pub window_7d: Option<UsageWindow>,
    /// Seven-day percentages keyed by model family (`sonnet`, `opus`).
    pub model_percents: BTreeMap<String, f32>,
    pub today_tokens: Option<String>,
    pub session_count: Option<u32>,
    pub message_count: Option<u32>,
    pub worker_entries: Vec<WorkerUsage>,
}

impl UsageReport {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLevel {
    Ok,
    Warning,
    Critical,
}

impl UsageLevel {
    pub fn from_percent(percent: f32) -> Self {
        if percent >= 80.0 {
            UsageLevel::Critical
        } else if percent >= 50.0 {
            UsageLevel::Warning
        } else {
            UsageLevel::Ok
        }
    }
}

struct ReportPatterns {
    window_5h: Regex,
    window_7d: Regex,
    sonnet_7d: Regex,
    opus_7d: Regex,
    today: Regex,
    sessions: Regex,
    messages: Regex,
    worker_percent: Regex,
    worker_unknown: Regex,
}

fn patterns() -> &'static ReportPatterns {
    static PATTERNS: OnceLock<ReportPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| ReportPatterns {
        window_5h: Regex::new(r"5h window:\s+([\d.]+)%.*\(resets ([^)]+)\)").expect("valid regex"),
        window_7d: Regex::new(r"7d window:\s+([\d.]+)%.*\(resets ([^)]+)\)").expect("valid regex"),
        sonnet_7d: Regex::new(r"sonnet 7d:\s+([\d.]+)%").expect("valid regex"),
        opus_7d: Regex::new(r"opus 7d:\s+([\d.]+)%").expect("valid regex"),
        today: Regex::new(r"Today:\s+([\d,]+) tokens").expect("valid regex"),
        sessions: Regex::new(r"Sessions:\s+(\d+)").expect("valid regex"),
        messages: Regex::new(r"Messages:\s+(\d+)").expect("valid regex"),
        worker_percent: Regex::new(r"\b(\d+):(\d+(?:\.\d+)?)%").expect("valid regex"),
        worker_unknown: Regex::new(r"\b(\d+):\?").expect("valid regex"),
    })
}

pub fn parse_usage_report(text: &str) -> UsageReport {
    let patterns = patterns();

    let mut model_percents = BTreeMap::new();
    if let Some(percent) = capture_f32(&patterns.sonnet_7d, text) {
        model_percents.insert("sonnet".to_string(), percent);
    }
    if let Some(percent) = capture_f32(&patterns.opus_7d, text) {
        model_percents.insert("opus".to_string(), percent);
    }

    UsageReport {
        window_5h: capture_window(&patterns.window_5h, text),
        window_7d: capture_window(&patterns.window_7d, text),
        model_percents,
        today_tokens: capture_str(&patterns.today, text).map(str::to_string),
        session_count: capture_str(&patterns.sessions, text).and_then(|v| v.parse().ok()),
        message_count: capture_str(&patterns.messages, text).and_then(|v| v.parse().ok()),
        worker_entries: parse_worker_entries(text),
    }
}

/// Collects `<id>:<pct>%` and `<id>:?` tokens, one entry per id, sorted by id.
///
/// A percentage wins over `?` for the same id.
pub fn parse_worker_entries(text: &str) -> Vec<WorkerUsage> {
    let patterns = patterns();
    let mut entries: BTreeMap<u32, Option<f32>> = BTreeMap::new();

    for caps in patterns.worker_percent.captures_iter(text) {
        let Ok(id) = caps[1].parse::<u32>() else {
            continue;
        };
        let percent = caps[2].parse::<f32>().ok();
        if percent.is_some() {
            entries.insert(id, percent);
        }
    }
    for caps in patterns.worker_unknown.captures_iter(text) {
        let Ok(id) = caps[1].parse::<u32>() else {
            continue;
        };
        entries.entry(id).or_insert(None);
    }

    entries
        .into_iter()
        .map(|(id, percent)| WorkerUsage { id, percent })
        .collect()
}

fn capture_str<'t>(regex: &Regex, text: &'t str) -> Option<&'t str> {
    regex
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

fn capture_f32(regex: &Regex, text: &str) -> Option<f32> {
    capture_str(regex, text).and_then(|value| value.parse().ok())
}

fn capture_window(regex: &Regex, text: &str) -> Option<UsageWindow> {
    let caps = regex.captures(text)?;
    Some(UsageWindow {
        percent: caps[1].parse().unwrap_or(0.0),
        reset_label: caps[2].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Claude Max
  5h window: 42.5% used (resets 2025-01-01T10:00)
  7d window: 61% used (resets 2025-01-05T00:00)
  sonnet 7d: 12.5%
  opus 7d: 48%
  Today: 1,234,567 tokens
  Sessions: 14
  Messages: 321
Codex
  3:75% 5:? 1:10%
";

    #[test]
    fn parses_all_fields() {
        let report = parse_usage_report(SAMPLE);

        let window_5h = report.window_5h.expect("5h window");
        assert_eq!(window_5h.percent, 42.5);
        assert_eq!(window_5h.reset_label, "2025-01-01T10:00");
        let window_7d = report.window_7d.expect("7d window");
        assert_eq!(window_7d.percent, 61.0);
        assert_eq!(window_7d.reset_label, "2025-01-05T00:00");
        assert_eq!(report.model_percents.get("sonnet"), Some(&12.5));
        assert_eq!(report.model_percents.get("opus"), Some(&48.0));
        assert_eq!(report.today_tokens.as_deref(), Some("1,234,567"));
        assert_eq!(report.session_count, Some(14));
        assert_eq!(report.message_count, Some(321));
        assert_eq!(
            report.worker_entries,
            vec![
                WorkerUsage { id: 1, percent: Some(10.0) },
                WorkerUsage { id: 3, percent: Some(75.0) },
                WorkerUsage { id: 5, percent: None },
            ]
        );
    }

    #[test]
    fn worker_tokens_are_sorted_and_unknown_is_kept() {
        let report = parse_usage_report(
            "5h window: 42.5% ... (resets 2025-01-01T10:00)\n5:? 3:75%",
        );
        assert_eq!(report.window_5h.map(|w| w.percent), Some(42.5));
        assert_eq!(
            report.worker_entries,
            vec![
                WorkerUsage { id: 3, percent: Some(75.0) },
                WorkerUsage { id: 5, percent: None },
            ]
        );
    }

    #[test]
    fn percent_wins_over_unknown_for_same_worker() {
        let entries = parse_worker_entries("2:? 2:40%");
        assert_eq!(entries, vec![WorkerUsage { id: 2, percent: Some(40.0) }]);
    }

    #[test]
    fn reset_timestamps_are_not_worker_tokens() {
        let entries = parse_worker_entries("(resets 2025-01-01T10:00)");
        assert!(entries.is_empty());
    }

    #[test]
    fn missing_fields_stay_empty() {
        let report = parse_usage_report("nothing useful here");
        assert!(report.is_empty());
    }

    #[test]
    fn usage_levels() {
        assert_eq!(UsageLevel::from_percent(10.0), UsageLevel::Ok);
        assert_eq!(UsageLevel::from_percent(50.0), UsageLevel::Warning);
        assert_eq!(UsageLevel::from_percent(80.0), UsageLevel::Critical);
    }
}
