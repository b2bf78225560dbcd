//! Line-oriented transport over a child's standard streams.
//!
//! [`PipeChannel`] owns the stdin writer and buffered stdout/stderr readers.
//! It performs no retries and holds no policy: a failed write is reported
//! as [`AppError::ChannelClosed`] and the session decides what to do.
//!
//! Reads are cancellation-safe. When a deadline elapses mid-line, the bytes
//! received so far stay in the reader's buffer and complete on the next
//! call; nothing is discarded unless [`PipeChannel::discard_pending`] is
//! called.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::pipe::codec::{Frame, LineCodec};
use crate::{AppError, Result};

const READ_CHUNK: usize = 8 * 1024;

/// Stand-in for "no deadline" when `start + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `timeout` after `start`, saturating instead of overflowing.
#[must_use]
pub fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Outcome of a deadline-bounded line read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line arrived.
    Line(String),
    /// The deadline elapsed first; partial data stays buffered.
    TimedOut,
    /// The stream reached EOF or failed.
    Closed,
}

/// Buffered line reader over one output stream.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    codec: LineCodec,
    eof: bool,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap `inner` with a codec enforcing `max_line_bytes`.
    #[must_use]
    pub fn new(inner: R, max_line_bytes: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(READ_CHUNK),
            codec: LineCodec::with_max_length(max_line_bytes),
            eof: false,
        }
    }

    /// Read the next complete line; `Ok(None)` at EOF.
    ///
    /// Oversized and non-UTF-8 lines are skipped with a warning. Dropping
    /// the returned future keeps every byte already read.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on an underlying read failure.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            let decoded = if self.eof {
                self.codec.decode_eof(&mut self.buf)?
            } else {
                self.codec.decode(&mut self.buf)?
            };

            match decoded {
                Some(Frame::Line(line)) => return Ok(Some(line)),
                Some(Frame::Oversized) => {
                    warn!(
                        max_line_bytes = self.codec.max_length(),
                        "dropping oversized output line"
                    );
                    continue;
                }
                Some(Frame::Malformed) => {
                    warn!("dropping output line that is not valid UTF-8");
                    continue;
                }
                None if self.eof => return Ok(None),
                None => {}
            }

            self.buf.reserve(READ_CHUNK);
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                self.eof = true;
            }
        }
    }

    /// Whether EOF has been observed.
    #[must_use]
    pub fn at_eof(&self) -> bool {
        self.eof
    }
}

/// Transport over a child's stdin, stdout and stderr.
#[derive(Debug)]
pub struct PipeChannel {
    stdin: Option<ChildStdin>,
    stdout: LineReader<ChildStdout>,
    stderr: LineReader<ChildStderr>,
    codec: LineCodec,
}

impl PipeChannel {
    /// Wrap the three pipes of a spawned child.
    #[must_use]
    pub fn new(
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        max_line_bytes: usize,
    ) -> Self {
        Self {
            stdin: Some(stdin),
            stdout: LineReader::new(stdout, max_line_bytes),
            stderr: LineReader::new(stderr, max_line_bytes),
            codec: LineCodec::with_max_length(max_line_bytes),
        }
    }

    /// Whether this side has closed stdin or the peer closed stdout.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.stdin.is_none() || self.stdout.at_eof()
    }

    /// Append a newline to `text`, write it and flush.
    ///
    /// # Errors
    ///
    /// - `AppError::ChannelClosed` if stdin was already closed, or the peer
    ///   closed its end (broken pipe).
    /// - `AppError::Io` for any other write failure.
    pub async fn write_line(&mut self, text: &str) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(AppError::ChannelClosed("stdin already closed".into()));
        };

        let mut bytes = BytesMut::with_capacity(text.len() + 1);
        self.codec.encode(text, &mut bytes)?;

        let written = match stdin.write_all(&bytes).await {
            Ok(()) => stdin.flush().await,
            Err(err) => Err(err),
        };

        written.map_err(|err| {
            if is_closed_error(err.kind()) {
                self.stdin = None;
                AppError::ChannelClosed(format!("write failed: {err}"))
            } else {
                AppError::Io(format!("write failed: {err}"))
            }
        })
    }

    /// Read one stdout line, giving up at `deadline`.
    pub async fn read_line(&mut self, deadline: Instant) -> ReadOutcome {
        match tokio::time::timeout_at(deadline, self.stdout.next_line()).await {
            Ok(Ok(Some(line))) => ReadOutcome::Line(line),
            Ok(Ok(None)) => ReadOutcome::Closed,
            Ok(Err(err)) => {
                warn!(%err, "stdout read failed");
                ReadOutcome::Closed
            }
            Err(_elapsed) => ReadOutcome::TimedOut,
        }
    }

    /// Collect stderr lines for at most `grace`, or until stderr closes.
    pub async fn drain_stderr(&mut self, grace: Duration) -> Vec<String> {
        let deadline = deadline_after(Instant::now(), grace);
        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, self.stderr.next_line()).await {
                Ok(Ok(Some(line))) => lines.push(line),
                Ok(Ok(None)) | Err(_) => break,
                Ok(Err(err)) => {
                    warn!(%err, "stderr read failed");
                    break;
                }
            }
        }
        lines
    }

    /// Drop every stdout line that is readable without waiting.
    ///
    /// Returns the number of lines dropped.
    pub async fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(Ok(Some(line))) =
            tokio::time::timeout(Duration::ZERO, self.stdout.next_line()).await
        {
            debug!(line = %line, "discarding stale output");
            dropped += 1;
        }
        dropped
    }

    /// Close stdin so the child sees EOF. Idempotent.
    pub async fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(err) = stdin.shutdown().await {
                debug!(%err, "stdin shutdown failed");
            }
        }
    }

    /// Read and drop both output streams until they close.
    ///
    /// Keeps stdin open for as long as the future runs, so a detached child
    /// neither blocks on a full pipe nor sees EOF.
    pub async fn drain_until_closed(&mut self) {
        let stdout = &mut self.stdout;
        let stderr = &mut self.stderr;
        tokio::join!(drain(stdout), drain(stderr));
    }
}

async fn drain<R>(reader: &mut LineReader<R>)
where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(_)) = reader.next_line().await {}
}

fn is_closed_error(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
    )
}
