//! Batched tmux pane polling over a single exec round trip.
//!
//! For every requested pane index `i` the generated script prints
//! `===ID<i>===`, the pane identity, `===CONTENT<i>===`, then the captured pane
//! content. [`parse_pane_batch`] splits the combined output back into one
//! [`PaneRecord`] per requested index.

pub const DEFAULT_TMUX_BIN: &str = "/usr/bin/tmux";
pub const DEFAULT_AGENTS_SESSION: &str = "multiagent";
pub const DEFAULT_CAPTURE_LINES: u32 = 500;
pub const DEFAULT_PANE_COUNT: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneRecord {
    pub index: usize,
    pub agent_id: String,
    /// Raw captured content; may contain escape sequences.
    pub content: String,
}

impl PaneRecord {
    pub fn placeholder(index: usize) -> Self {
        Self {
            index,
            agent_id: default_label(index),
            content: String::new(),
        }
    }
}

/// One parsed poll generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneBatch {
    pub panes: Vec<PaneRecord>,
    /// Indices whose markers were missing and were filled with placeholders.
    pub fallback_indices: Vec<usize>,
}

pub fn id_marker(index: usize) -> String {
    format!("===ID{index}===")
}

pub fn content_marker(index: usize) -> String {
    format!("===CONTENT{index}===")
}

pub fn default_label(index: usize) -> String {
    format!("pane{index}")
}

/// Single-quotes `text` for a POSIX shell, escaping embedded `'` as `'\''`.
pub fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Describes where the agent panes live and how they are captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneQuery {
    pub tmux_bin: String,
    pub session: String,
    pub window: u32,
    pub capture_lines: u32,
}

impl Default for PaneQuery {
    fn default() -> Self {
        Self {
            tmux_bin: DEFAULT_TMUX_BIN.to_string(),
            session: DEFAULT_AGENTS_SESSION.to_string(),
            window: 0,
            capture_lines: DEFAULT_CAPTURE_LINES,
        }
    }
}

impl PaneQuery {
    pub fn target(&self, index: usize) -> String {
        format!("{}:{}.{}", self.session, self.window, index)
    }

    pub fn identity_command(&self, index: usize) -> String {
        format!(
            "{} display-message -t {} -p '#{{@agent_id}}'",
            self.tmux_bin,
            shell_quote(&self.target(index))
        )
    }

    pub fn capture_command(&self, index: usize) -> String {
        capture_command(&self.tmux_bin, &self.target(index), self.capture_lines)
    }

    /// Builds the composite script for `indices` in the given order.
    pub fn batch_script(&self, indices: &[usize]) -> String {
        indices
            .iter()
            .map(|&index| {
                format!(
                    "echo '{id}'; {identity} 2>/dev/null || echo '{label}'; echo '{content}'; {capture} 2>/dev/null || true",
                    id = id_marker(index),
                    identity = self.identity_command(index),
                    label = default_label(index),
                    content = content_marker(index),
                    capture = self.capture_command(index),
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub fn capture_command(tmux_bin: &str, target: &str, capture_lines: u32) -> String {
    format!(
        "{tmux_bin} capture-pane -t {} -p -e -S -{capture_lines}",
        shell_quote(target)
    )
}

/// First half of paced input: the literal text, without Enter.
pub fn send_text_command(tmux_bin: &str, target: &str, text: &str) -> String {
    format!(
        "{tmux_bin} send-keys -t {} -l {}",
        shell_quote(target),
        shell_quote(text)
    )
}

/// Second half of paced input.
pub fn send_enter_command(tmux_bin: &str, target: &str) -> String {
    format!("{tmux_bin} send-keys -t {} Enter", shell_quote(target))
}

/// Splits a batch response into one record per requested index.
///
/// Content for index `i` runs from its content marker to the identity marker of
/// the next requested index, or to the end of the output. Missing markers never
/// fail the batch; the index gets a placeholder instead.
pub fn parse_pane_batch(output: &str, indices: &[usize]) -> PaneBatch {
    let mut batch = PaneBatch::default();

    for (position, &index) in indices.iter().enumerate() {
        let next_index = indices.get(position + 1).copied();
        match extract_pane(output, index, next_index) {
            Some(record) => batch.panes.push(record),
            None => {
                batch.panes.push(PaneRecord::placeholder(index));
                batch.fallback_indices.push(index);
            }
        }
    }

    batch
}

fn extract_pane(output: &str, index: usize, next_index: Option<usize>) -> Option<PaneRecord> {
    let id_tag = id_marker(index);
    let content_tag = content_marker(index);

    let id_start = output.find(&id_tag)? + id_tag.len();
    let content_pos = id_start + output[id_start..].find(&content_tag)?;
    let content_start = content_pos + content_tag.len();

    let content_end = next_index
        .and_then(|next| output[content_start..].find(&id_marker(next)))
        .map(|offset| content_start + offset)
        .unwrap_or(output.len());

    let agent_id = output[id_start..content_pos].trim();
    let agent_id = if agent_id.is_empty() {
        default_label(index)
    } else {
        agent_id.to_string()
    };

    Some(PaneRecord {
        index,
        agent_id,
        content: output[content_start..content_end].trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_response(count: usize, skip_content: Option<usize>) -> String {
        let mut out = String::new();
        for i in 0..count {
            out.push_str(&format!("{}\nagent-{i}\n", id_marker(i)));
            if skip_content != Some(i) {
                out.push_str(&format!("{}\n", content_marker(i)));
            }
            out.push_str(&format!("line one of {i}\n\u{1b}[32mline two\u{1b}[0m\n\n"));
        }
        out
    }

    #[test]
    fn parses_every_requested_pane() {
        let indices: Vec<usize> = (0..8).collect();
        let batch = parse_pane_batch(&synthetic_response(8, None), &indices);

        assert!(batch.fallback_indices.is_empty());
        assert_eq!(batch.panes.len(), 8);
        for (i, pane) in batch.panes.iter().enumerate() {
            assert_eq!(pane.index, i);
            assert_eq!(pane.agent_id, format!("agent-{i}"));
            assert_eq!(
                pane.content,
                format!("line one of {i}\n\u{1b}[32mline two\u{1b}[0m")
            );
        }
    }

    #[test]
    fn missing_content_marker_yields_placeholder() {
        let indices: Vec<usize> = (0..8).collect();
        let batch = parse_pane_batch(&synthetic_response(8, Some(3)), &indices);

        assert_eq!(batch.panes.len(), 8);
        assert_eq!(batch.panes[3], PaneRecord::placeholder(3));
        assert_eq!(batch.panes[3].agent_id, "pane3");
        assert_eq!(batch.panes[3].content, "");
        assert_eq!(batch.fallback_indices, vec![3]);
        assert_eq!(batch.panes[2].agent_id, "agent-2");
        assert_eq!(batch.panes[4].agent_id, "agent-4");
        assert_eq!(
            batch.panes[2].content,
            "line one of 2\n\u{1b}[32mline two\u{1b}[0m"
        );
    }

    #[test]
    fn truncated_output_fills_tail_with_placeholders() {
        let full = synthetic_response(4, None);
        let cut = full.find(&id_marker(2)).expect("marker present") + 4;
        let batch = parse_pane_batch(&full[..cut], &[0, 1, 2, 3]);

        assert_eq!(batch.fallback_indices, vec![2, 3]);
        assert_eq!(batch.panes[1].agent_id, "agent-1");
        assert!(batch.panes[1].content.starts_with("line one of 1"));
        assert!(batch.panes[1].content.ends_with("===I"));
        assert_eq!(batch.panes[3], PaneRecord::placeholder(3));
    }

    #[test]
    fn empty_identity_falls_back_to_label() {
        let output = format!("{}\n\n{}\nhello", id_marker(0), content_marker(0));
        let batch = parse_pane_batch(&output, &[0]);
        assert_eq!(batch.panes[0].agent_id, "pane0");
        assert_eq!(batch.panes[0].content, "hello");
    }

    #[test]
    fn two_digit_indices_do_not_collide() {
        let indices = [1, 10];
        let output = format!(
            "{}a\n{}one\n{}b\n{}ten",
            id_marker(1),
            content_marker(1),
            id_marker(10),
            content_marker(10)
        );
        let batch = parse_pane_batch(&output, &indices);
        assert_eq!(batch.panes[0].content, "one");
        assert_eq!(batch.panes[1].agent_id, "b");
        assert_eq!(batch.panes[1].content, "ten");
    }

    #[test]
    fn empty_output_is_all_placeholders() {
        let batch = parse_pane_batch("", &[0, 1]);
        assert_eq!(
            batch.panes,
            vec![PaneRecord::placeholder(0), PaneRecord::placeholder(1)]
        );
    }

    #[test]
    fn batch_script_emits_markers_in_order() {
        let query = PaneQuery::default();
        let script = query.batch_script(&[0, 1]);

        let id0 = script.find("echo '===ID0==='").expect("id0");
        let content0 = script.find("echo '===CONTENT0==='").expect("content0");
        let id1 = script.find("echo '===ID1==='").expect("id1");
        assert!(id0 < content0 && content0 < id1);
        assert!(script.contains(
            "/usr/bin/tmux display-message -t 'multiagent:0.0' -p '#{@agent_id}' 2>/dev/null || echo 'pane0'"
        ));
        assert!(script.contains("/usr/bin/tmux capture-pane -t 'multiagent:0.1' -p -e -S -500 2>/dev/null || true"));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(
            send_text_command("tmux", "s:0.2", "don't stop"),
            "tmux send-keys -t 's:0.2' -l 'don'\\''t stop'"
        );
        assert_eq!(send_enter_command("tmux", "s:0.2"), "tmux send-keys -t 's:0.2' Enter");
    }
}
