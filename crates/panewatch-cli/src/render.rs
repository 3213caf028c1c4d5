use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::{Attribute, Color, Print, ResetColor, SetAttribute, SetForegroundColor};
use crossterm::terminal::{Clear, ClearType};
use panewatch_core::{decode_ansi, PaneBatch, UsageLevel, UsageReport, UsageWindow};
use std::io::{self, Write};

/// Writes `text` with its SGR colors re-expressed as crossterm commands.
pub fn write_styled(out: &mut impl Write, text: &str) -> io::Result<()> {
    for run in decode_ansi(text) {
        if run.is_plain() {
            queue!(out, Print(&run.text))?;
            continue;
        }
        if run.bold {
            queue!(out, SetAttribute(Attribute::Bold))?;
        }
        if let Some(rgb) = run.foreground {
            queue!(
                out,
                SetForegroundColor(Color::Rgb {
                    r: rgb.r,
                    g: rgb.g,
                    b: rgb.b
                })
            )?;
        }
        queue!(
            out,
            Print(&run.text),
            ResetColor,
            SetAttribute(Attribute::Reset)
        )?;
    }
    Ok(())
}

/// Last `count` lines of `text`, ignoring trailing blank lines.
pub fn tail_lines(text: &str, count: usize) -> &str {
    let trimmed = text.trim_end();
    if count == 0 {
        return "";
    }
    match trimmed.rmatch_indices('\n').nth(count - 1) {
        Some((pos, _)) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

pub fn write_batch(out: &mut impl Write, batch: &PaneBatch, lines_per_pane: usize) -> io::Result<()> {
    for pane in &batch.panes {
        queue!(
            out,
            SetAttribute(Attribute::Bold),
            Print(format!("── [{}] {} ", pane.index, pane.agent_id)),
            SetAttribute(Attribute::Reset),
            Print("\n")
        )?;
        write_styled(out, tail_lines(&pane.content, lines_per_pane))?;
        queue!(out, Print("\n"))?;
    }
    out.flush()
}

pub fn clear_screen(out: &mut impl Write) -> io::Result<()> {
    queue!(out, Clear(ClearType::All), MoveTo(0, 0))
}

fn level_color(level: UsageLevel) -> Color {
    match level {
        UsageLevel::Ok => Color::Green,
        UsageLevel::Warning => Color::Yellow,
        UsageLevel::Critical => Color::Red,
    }
}

fn write_percent(out: &mut impl Write, percent: f32) -> io::Result<()> {
    queue!(
        out,
        SetForegroundColor(level_color(UsageLevel::from_percent(percent))),
        Print(format!("{percent:>5.1}%")),
        ResetColor
    )
}

fn write_window(out: &mut impl Write, label: &str, window: &UsageWindow) -> io::Result<()> {
    queue!(out, Print(format!("{label:<10}")))?;
    write_percent(out, window.percent)?;
    queue!(out, Print(format!("  resets {}\n", window.reset_label)))
}

pub fn write_usage(out: &mut impl Write, report: &UsageReport) -> io::Result<()> {
    if report.is_empty() {
        queue!(out, Print("no usage data\n"))?;
        return out.flush();
    }
    if let Some(window) = &report.window_5h {
        write_window(out, "5h", window)?;
    }
    if let Some(window) = &report.window_7d {
        write_window(out, "7d", window)?;
    }
    for (model, percent) in &report.model_percents {
        queue!(out, Print(format!("{model:<10}")))?;
        write_percent(out, *percent)?;
        queue!(out, Print("\n"))?;
    }
    if let Some(tokens) = &report.today_tokens {
        queue!(out, Print(format!("today     {tokens} tokens\n")))?;
    }
    if let Some(sessions) = report.session_count {
        queue!(out, Print(format!("sessions  {sessions}\n")))?;
    }
    if let Some(messages) = report.message_count {
        queue!(out, Print(format!("messages  {messages}\n")))?;
    }
    for worker in &report.worker_entries {
        queue!(out, Print(format!("worker {:<3}", worker.id)))?;
        match worker.percent {
            Some(percent) => write_percent(out, percent)?,
            None => queue!(out, Print("    ?"))?,
        }
        queue!(out, Print("\n"))?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use panewatch_core::{parse_usage_report, PaneRecord};

    fn rendered(text: &str) -> String {
        let mut out = Vec::new();
        write_styled(&mut out, text).expect("render");
        String::from_utf8(out).expect("utf8")
    }

    #[test]
    fn plain_text_is_written_unchanged() {
        assert_eq!(rendered("hello\nworld"), "hello\nworld");
    }

    #[test]
    fn colored_run_becomes_truecolor_sequence() {
        let out = rendered("\u{1b}[38;5;21mblue\u{1b}[0m tail");
        assert!(out.contains("\u{1b}[38;2;0;0;255m"));
        assert!(out.contains("blue"));
        assert!(out.ends_with(" tail"));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc\n\n", 2), "b\nc");
        assert_eq!(tail_lines("only", 5), "only");
        assert_eq!(tail_lines("x\ny", 0), "");
    }

    #[test]
    fn batch_lists_every_pane() {
        let batch = PaneBatch {
            panes: vec![
                PaneRecord {
                    index: 0,
                    agent_id: "karo".to_string(),
                    content: "ready".to_string(),
                },
                PaneRecord::placeholder(1),
            ],
            fallback_indices: vec![1],
        };
        let mut out = Vec::new();
        write_batch(&mut out, &batch, 10).expect("render");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("[0] karo"));
        assert!(text.contains("[1] pane1"));
        assert!(text.contains("ready"));
    }

    #[test]
    fn usage_report_lists_workers() {
        let report = parse_usage_report("5h window: 85% used (resets 10:00)\n3:75% 5:?");
        let mut out = Vec::new();
        write_usage(&mut out, &report).expect("render");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("resets 10:00"));
        assert!(text.contains("worker 3"));
        assert!(text.contains("?"));
    }
}
