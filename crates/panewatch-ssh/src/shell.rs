use crate::events::SessionEvent;
use crate::transport::ShellStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};

const INPUT_QUEUE: usize = 64;

/// A live interactive shell with its reader task.
///
/// Dropping the handle cancels the reader; [`ShellHandle::shutdown`] also waits
/// for it to finish.
pub struct ShellHandle {
    input: mpsc::Sender<Vec<u8>>,
    task: JoinHandle<()>,
    generation: u64,
    _cancel_on_drop: DropGuard,
}

impl ShellHandle {
    /// Starts draining `stream`.
    ///
    /// Output goes to `events`. When the stream ends or fails, one
    /// `Disconnected` event is broadcast and `generation` is sent on `loss_tx`.
    /// Nothing is reported when the reader is cancelled locally.
    pub fn spawn(
        stream: Box<dyn ShellStream>,
        generation: u64,
        events: broadcast::Sender<SessionEvent>,
        loss_tx: mpsc::UnboundedSender<u64>,
    ) -> Self {
        let (input, input_rx) = mpsc::channel(INPUT_QUEUE);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_reader(
            stream,
            input_rx,
            cancel.clone(),
            generation,
            events,
            loss_tx,
        ));
        Self {
            input,
            task,
            generation,
            _cancel_on_drop: cancel.drop_guard(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Queues `text` plus a newline. A dead shell swallows the write; loss is
    /// reported by the reader alone.
    pub async fn send_command(&self, text: &str) {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        if self.input.send(line).await.is_err() {
            debug!(generation = self.generation, "shell_input_dropped");
        }
    }

    /// Cancels the reader and waits for it to close the channel.
    pub async fn shutdown(self) {
        let ShellHandle {
            task,
            generation,
            _cancel_on_drop,
            ..
        } = self;
        drop(_cancel_on_drop);
        if let Err(err) = task.await {
            debug!(generation, "shell_reader_join_error: {err}");
        }
    }
}

async fn run_reader(
    mut stream: Box<dyn ShellStream>,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    generation: u64,
    events: broadcast::Sender<SessionEvent>,
    loss_tx: mpsc::UnboundedSender<u64>,
) {
    let mut carry = Utf8Carry::default();

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                stream.close().await;
                debug!(generation, "shell_reader_cancelled");
                return;
            }
            Some(bytes) = input_rx.recv() => {
                if let Err(err) = stream.write_all(&bytes).await {
                    debug!(generation, "shell_write_error: {err}");
                }
            }
            chunk = stream.read_chunk() => match chunk {
                Ok(Some(bytes)) => {
                    let text = carry.push(&bytes);
                    if !text.is_empty() {
                        let _ = events.send(SessionEvent::Output(text));
                    }
                }
                Ok(None) => break "remote closed the shell".to_string(),
                Err(err) => break err.to_string(),
            }
        }
    };

    let tail = carry.finish();
    if !tail.is_empty() {
        let _ = events.send(SessionEvent::Output(tail));
    }
    info!(generation, reason = %reason, "shell_disconnected");
    let _ = events.send(SessionEvent::Disconnected { generation, reason });
    let _ = loss_tx.send(generation);
}

/// Decodes UTF-8 across chunk boundaries, holding back an incomplete trailing
/// sequence until the next chunk arrives.
#[derive(Debug, Default)]
pub(crate) struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail_len(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    pub(crate) fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(3) {
        let byte = bytes[len - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = if byte >= 0xF0 {
            4
        } else if byte >= 0xE0 {
            3
        } else if byte >= 0xC0 {
            2
        } else {
            1
        };
        return if needed > back { back } else { 0 };
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_multibyte_sequence_is_carried() {
        let bytes = "日本".as_bytes();
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&bytes[..2]), "");
        assert_eq!(carry.push(&bytes[2..4]), "日");
        assert_eq!(carry.push(&bytes[4..]), "本");
        assert_eq!(carry.finish(), "");
    }

    #[test]
    fn ascii_passes_straight_through() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(b"ls -la\r\n"), "ls -la\r\n");
    }

    #[test]
    fn invalid_bytes_are_replaced() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn dangling_lead_byte_is_flushed_lossily() {
        let mut carry = Utf8Carry::default();
        assert_eq!(carry.push(&[b'x', 0xE6]), "x");
        assert_eq!(carry.finish(), "\u{FFFD}");
    }
}
