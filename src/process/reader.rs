//! Output reader task
//!
//! Owns one child process for its whole lifetime. Pushes stdout/stderr chunks
//! onto the run's queue as soon as they are read, and pushes exactly one
//! [`OutputEvent::End`] after the process has exited and its pipes have been
//! flushed.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Bytes requested per pipe read
const READ_CHUNK_SIZE: usize = 8192;

/// How long the final flush may wait on a pipe after the process exited.
/// Background grandchildren can keep a pipe open forever.
const FLUSH_GRACE: Duration = Duration::from_millis(100);

/// Which pipe a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A decoded piece of process output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Source pipe
    pub stream: OutputStream,
    /// Decoded text (complete UTF-8 sequences only)
    pub data: String,
}

/// Item pushed onto a run's queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// Output read from one of the pipes
    Output(OutputChunk),
    /// The process terminated and no more output will follow
    End {
        /// Exit code, `None` when killed by a signal
        exit_code: Option<i32>,
    },
}

/// Incremental UTF-8 decoder that holds back incomplete trailing sequences
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Decode `bytes`, keeping an incomplete multi-byte tail for the next call
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is left, replacing a truncated sequence
    pub(crate) fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Background drain of one child process
pub struct OutputReader {
    run_id: Uuid,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    output_tx: mpsc::UnboundedSender<OutputEvent>,
    kill_rx: broadcast::Receiver<()>,
    exited: Arc<AtomicBool>,
}

impl OutputReader {
    /// Take ownership of `child` and its pipes
    pub fn new(
        run_id: Uuid,
        mut child: Child,
        output_tx: mpsc::UnboundedSender<OutputEvent>,
        kill_rx: broadcast::Receiver<()>,
        exited: Arc<AtomicBool>,
    ) -> Self {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        Self {
            run_id,
            child,
            stdout,
            stderr,
            output_tx,
            kill_rx,
            exited,
        }
    }

    /// Start the reader on the tokio runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let OutputReader {
            run_id,
            mut child,
            mut stdout,
            mut stderr,
            output_tx,
            mut kill_rx,
            exited,
        } = self;

        let mut stdout_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stderr_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stdout_decoder = Utf8Decoder::default();
        let mut stderr_decoder = Utf8Decoder::default();
        let mut kill_requested = false;

        let status: Option<ExitStatus> = loop {
            tokio::select! {
                read = read_chunk(&mut stdout, &mut stdout_buf) => match read {
                    Ok(n) if n > 0 => {
                        push(&output_tx, OutputStream::Stdout, stdout_decoder.decode(&stdout_buf[..n]));
                    }
                    _ => stdout = None,
                },
                read = read_chunk(&mut stderr, &mut stderr_buf) => match read {
                    Ok(n) if n > 0 => {
                        push(&output_tx, OutputStream::Stderr, stderr_decoder.decode(&stderr_buf[..n]));
                    }
                    _ => stderr = None,
                },
                status = child.wait() => match status {
                    Ok(status) => break Some(status),
                    Err(e) => {
                        warn!("Run {} failed to wait on child: {}", run_id, e);
                        break None;
                    }
                },
                _ = kill_rx.recv(), if !kill_requested => {
                    // A closed channel means the run handle was dropped, which also terminates.
                    kill_requested = true;
                    debug!("Run {} termination requested", run_id);
                    if let Err(e) = child.start_kill() {
                        warn!("Run {} failed to kill child: {}", run_id, e);
                    }
                },
            }
        };

        let rest = flush_pipe(&mut stdout).await;
        push(&output_tx, OutputStream::Stdout, stdout_decoder.decode(&rest));
        push(&output_tx, OutputStream::Stdout, stdout_decoder.finish());

        let rest = flush_pipe(&mut stderr).await;
        push(&output_tx, OutputStream::Stderr, stderr_decoder.decode(&rest));
        push(&output_tx, OutputStream::Stderr, stderr_decoder.finish());

        let exit_code = status.and_then(|s| s.code());
        debug!("Run {} exited with code {:?}", run_id, exit_code);

        exited.store(true, Ordering::SeqCst);
        let _ = output_tx.send(OutputEvent::End { exit_code });
    }
}

fn push(tx: &mpsc::UnboundedSender<OutputEvent>, stream: OutputStream, data: String) {
    if data.is_empty() {
        return;
    }
    // The consumer may be gone (shell closed); keep draining so the child is reaped.
    let _ = tx.send(OutputEvent::Output(OutputChunk { stream, data }));
}

/// Read from an optional pipe; a closed pipe never resolves
async fn read_chunk<R: AsyncRead + Unpin>(
    pipe: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => std::future::pending().await,
    }
}

/// Collect what is left in a pipe after process exit
async fn flush_pipe<R: AsyncRead + Unpin>(pipe: &mut Option<R>) -> Vec<u8> {
    let mut rest = Vec::new();
    if let Some(mut reader) = pipe.take() {
        let _ = tokio::time::timeout(FLUSH_GRACE, reader.read_to_end(&mut rest)).await;
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_sh(script: &str) -> (JoinHandle<()>, mpsc::UnboundedReceiver<OutputEvent>, broadcast::Sender<()>, Arc<AtomicBool>) {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = broadcast::channel(1);
        let exited = Arc::new(AtomicBool::new(false));
        let handle = OutputReader::new(Uuid::new_v4(), child, tx, kill_rx, Arc::clone(&exited)).spawn();
        (handle, rx, kill_tx, exited)
    }

    async fn collect(rx: &mut mpsc::UnboundedReceiver<OutputEvent>) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_decoder_passes_ascii() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_holds_split_sequence() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "café".as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 1);
        assert_eq!(decoder.decode(head), "caf");
        assert_eq!(decoder.decode(tail), "é");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_decoder_finish_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xC3]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[tokio::test]
    async fn test_end_marker_is_last_and_unique() {
        let (handle, mut rx, _kill_tx, exited) = spawn_sh("echo one; echo two >&2; exit 3");
        let events = collect(&mut rx).await;
        handle.await.unwrap();

        let ends: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, OutputEvent::End { .. }))
            .collect();
        assert_eq!(ends.len(), 1);
        assert_eq!(events.last(), Some(&OutputEvent::End { exit_code: Some(3) }));
        assert!(exited.load(Ordering::SeqCst));

        let mut stdout = String::new();
        let mut stderr = String::new();
        for event in &events {
            if let OutputEvent::Output(chunk) = event {
                match chunk.stream {
                    OutputStream::Stdout => stdout.push_str(&chunk.data),
                    OutputStream::Stderr => stderr.push_str(&chunk.data),
                }
            }
        }
        assert_eq!(stdout, "one\n");
        assert_eq!(stderr, "two\n");
    }

    #[tokio::test]
    async fn test_preserves_stream_order() {
        let (_handle, mut rx, _kill_tx, _exited) = spawn_sh("for i in 1 2 3 4 5; do echo $i; done");
        let text: String = collect(&mut rx)
            .await
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Output(chunk) => Some(chunk.data),
                OutputEvent::End { .. } => None,
            })
            .collect();
        assert_eq!(text, "1\n2\n3\n4\n5\n");
    }

    #[tokio::test]
    async fn test_kill_request_terminates_child() {
        let (handle, mut rx, kill_tx, _exited) = spawn_sh("sleep 30");
        kill_tx.send(()).unwrap();

        let events = tokio::time::timeout(Duration::from_secs(5), collect(&mut rx))
            .await
            .expect("reader should finish after kill");
        handle.await.unwrap();
        assert_eq!(events.last(), Some(&OutputEvent::End { exit_code: None }));
    }

    #[tokio::test]
    async fn test_background_grandchild_does_not_stall_end() {
        let (_handle, mut rx, _kill_tx, _exited) = spawn_sh("sleep 5 & echo started");
        let events = tokio::time::timeout(Duration::from_secs(3), collect(&mut rx))
            .await
            .expect("end marker should not wait for the grandchild");
        assert!(matches!(events.last(), Some(OutputEvent::End { exit_code: Some(0) })));
    }
}
