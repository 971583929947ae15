//! Owns the byte stream and multiplexes request/reply traffic over it.
//!
//! A [`StreamTransport`] wraps any `AsyncRead + AsyncWrite` byte stream: a
//! real serial port (see [`serial`]), or an in-memory duplex pipe in tests.
//! A background reader task drains the stream into a [`FrameAssembler`] and
//! publishes each decoded frame to a single-slot mailbox holding the most
//! recent unread frame. [`Transport::send_and_await`] serves one
//! outstanding request at a time against that mailbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, trace, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::event::EventSender;
use crate::frame::{CommandKind, EncodeError, Frame, FRAME_HEADER, FRAME_OVERHEAD};

#[cfg(feature = "serial")]
pub mod serial;

/// How often the receive mailbox is polled while awaiting a reply.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pause between transport-level retry attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Shown in device-error events when the error payload is empty or not
/// valid UTF-8.
const NO_ERROR_DETAIL: &str = "(no error detail)";

/// Timing and framing knobs for outbound commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long one attempt waits for the expected or error reply.
    pub timeout: Duration,
    /// Attempts including the first; floored at one.
    pub retry_count: usize,
    /// Raw bytes appended after every outbound frame, for targets whose
    /// UART parser wants a terminator. Usually empty.
    pub line_ending: Vec<u8>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            retry_count: 3,
            line_ending: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// The effective config for one command, with any per-command
    /// overrides applied. Returns a value; the base config is never
    /// mutated.
    pub fn with_overrides(&self, timeout: Option<Duration>, retry_count: Option<usize>) -> Self {
        Self {
            timeout: timeout.unwrap_or(self.timeout),
            retry_count: retry_count.unwrap_or(self.retry_count),
            line_ending: self.line_ending.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out waiting for a {0} reply")]
    Timeout(CommandKind),
    #[error("transport is closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encoding error: {0}")]
    Encode(#[from] EncodeError),
    #[cfg(feature = "serial")]
    #[error("serialport error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

/// A request/reply transport for bootloader frames.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// The transport's base configuration.
    fn config(&self) -> &TransferConfig;

    /// Sends `frame` and waits for a reply whose kind is `expected` or
    /// [`CommandKind::ErrorResponse`], under `config`'s timeout and retry
    /// budget. Replies of any other kind are logged and skipped. Error
    /// responses are returned to the caller like any reply; deciding what
    /// they mean is the caller's job.
    async fn send_and_await(
        &self,
        frame: Frame,
        expected: CommandKind,
        config: &TransferConfig,
    ) -> Result<Frame, TransportError>;

    /// The payload text of the most recent error response, if any.
    fn last_device_error(&self) -> Option<String>;
}

/// Assembles complete frames from an unreliable byte stream.
///
/// Bytes are appended as they arrive; [`next_frame`](Self::next_frame)
/// extracts frames in order, skipping noise ahead of a header and
/// resynchronizing one byte at a time past buffers that fail to decode.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let Some(start) = self
                .buf
                .windows(2)
                .position(|window| window == FRAME_HEADER)
            else {
                // No header in sight. Keep the final byte in case it is
                // the first half of one.
                let keep = usize::from(self.buf.last() == Some(&FRAME_HEADER[0]));
                if self.buf.len() > keep {
                    trace!("dropped {} noise bytes", self.buf.len() - keep);
                    self.buf.drain(..self.buf.len() - keep);
                }
                return None;
            };

            if start > 0 {
                trace!("dropped {start} noise bytes before frame header");
                self.buf.drain(..start);
            }

            // Header + command + length before the size is known.
            if self.buf.len() < 5 {
                return None;
            }
            let declared = u16::from_le_bytes([self.buf[3], self.buf[4]]) as usize;
            let total = FRAME_OVERHEAD + declared;
            if self.buf.len() < total {
                return None;
            }

            match Frame::decode(&self.buf[..total]) {
                Ok(frame) => {
                    self.buf.drain(..total);
                    return Some(frame);
                }
                Err(e) => {
                    // The header bytes may have been payload of something
                    // else; slide past one byte and rescan.
                    warn!("discarding undecodable frame: {e}");
                    self.buf.drain(..1);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    /// Most recent unread frame; publishing overwrites.
    mailbox: StdMutex<Option<Frame>>,
    closed: AtomicBool,
    last_device_error: StdMutex<Option<String>>,
}

/// [`Transport`] over any async byte stream.
#[derive(Debug)]
pub struct StreamTransport<S> {
    shared: Arc<Shared>,
    /// Write half of the stream. Held across the whole of
    /// `send_and_await`, which also serializes callers.
    writer: Mutex<WriteHalf<S>>,
    reader: JoinHandle<()>,
    config: TransferConfig,
    events: EventSender,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, config: TransferConfig, events: EventSender) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared::default());
        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));

        Self {
            shared,
            writer: Mutex::new(write_half),
            reader,
            config,
            events,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stops the reader task. Subsequent sends fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.reader.abort();
        debug!("transport closed");
    }

    fn take_mailbox(&self) -> Option<Frame> {
        self.shared.mailbox.lock().unwrap().take()
    }

    fn note_device_error(&self, frame: &Frame) {
        let text = match std::str::from_utf8(&frame.payload) {
            Ok(text) if !text.is_empty() => text.to_string(),
            _ => NO_ERROR_DETAIL.to_string(),
        };
        *self.shared.last_device_error.lock().unwrap() = Some(text.clone());
        self.events.device_error(text);
    }
}

impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn config(&self) -> &TransferConfig {
        &self.config
    }

    async fn send_and_await(
        &self,
        frame: Frame,
        expected: CommandKind,
        config: &TransferConfig,
    ) -> Result<Frame, TransportError> {
        // One outstanding request at a time.
        let mut writer = self.writer.lock().await;

        let mut wire = frame.encode()?;
        wire.extend_from_slice(&config.line_ending);

        let attempts = config.retry_count.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                debug!(
                    "resending {} (attempt {}/{attempts})",
                    frame.kind,
                    attempt + 1,
                );
                sleep(RETRY_PAUSE).await;
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            self.take_mailbox();

            trace!("sent frame: {wire:02x?}");
            let written = match writer.write_all(&wire).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                if self.is_closed() {
                    return Err(TransportError::Closed);
                }
                if attempt + 1 == attempts {
                    return Err(TransportError::Io(e));
                }
                warn!("write failed, will retry: {e}");
                continue;
            }

            let deadline = Instant::now() + config.timeout;
            loop {
                if let Some(reply) = self.take_mailbox() {
                    if reply.kind == expected || reply.kind == CommandKind::ErrorResponse {
                        if reply.kind == CommandKind::ErrorResponse {
                            self.note_device_error(&reply);
                        }
                        return Ok(reply);
                    }
                    debug!(
                        "ignoring unexpected {} frame while waiting for {expected}",
                        reply.kind,
                    );
                    continue;
                }
                if Instant::now() >= deadline {
                    break;
                }
                sleep(POLL_INTERVAL).await;
            }
            warn!("no {expected} reply within {:?}", config.timeout);
        }

        Err(TransportError::Timeout(expected))
    }

    fn last_device_error(&self) -> Option<String> {
        self.shared.last_device_error.lock().unwrap().clone()
    }
}

impl<S> Drop for StreamTransport<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<S>(mut reader: ReadHalf<S>, shared: Arc<Shared>)
where
    S: AsyncRead + Send + 'static,
{
    let mut assembler = FrameAssembler::new();
    let mut buf = [0u8; 1024];

    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("stream closed by peer");
                break;
            }
            Ok(read) => read,
            Err(e) => {
                warn!("stream read failed: {e}");
                break;
            }
        };

        assembler.push(&buf[..read]);
        while let Some(frame) = assembler.next_frame() {
            trace!(
                "received {} frame ({} byte payload)",
                frame.kind,
                frame.payload.len(),
            );
            if let Some(stale) = shared.mailbox.lock().unwrap().replace(frame) {
                debug!("overwrote unread {} frame", stale.kind);
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
}

#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use tokio::io::DuplexStream;

    /// Scripted far end of a duplex link: decodes request frames and sends
    /// one scripted reply per request. `None` entries stay silent, as does
    /// running off the end of the script. Resolves to the requests it saw
    /// once the link closes.
    pub(crate) fn spawn_device(
        stream: DuplexStream,
        script: Vec<Option<Frame>>,
    ) -> JoinHandle<Vec<Frame>> {
        tokio::spawn(async move {
            let (mut rx, mut tx) = tokio::io::split(stream);
            let mut assembler = FrameAssembler::new();
            let mut script = script.into_iter();
            let mut requests = Vec::new();
            let mut buf = [0u8; 4096];

            loop {
                let read = match rx.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => read,
                };
                assembler.push(&buf[..read]);
                while let Some(frame) = assembler.next_frame() {
                    requests.push(frame);
                    if let Some(Some(reply)) = script.next() {
                        tx.write_all(&reply.encode().unwrap()).await.unwrap();
                        tx.flush().await.unwrap();
                    }
                }
            }

            requests
        })
    }
}
