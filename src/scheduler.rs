//! Sequencing multi-step firmware workflows.
//!
//! A [`Scheduler`] owns a FIFO queue of [`CommandItem`]s. Running the
//! queue dispatches each item through the transport, hands the reply to
//! the item's [`ResponsePolicy`], and reacts: keep going, requeue the item
//! for another try, skip the response, or halt the run. All terminal
//! conditions collapse into the returned [`CommandResult`]; nothing
//! escapes the run entry point.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use crate::device::DeviceInfo;
use crate::event::EventSender;
use crate::frame::{CommandKind, Frame};
use crate::transport::Transport;

/// Times a command may be requeued after a `Retry` decision, when the
/// item does not say otherwise.
pub const DEFAULT_SCHEDULE_RETRIES: usize = 3;

/// A response policy's verdict on a received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Record the response and move on.
    Continue,
    /// Requeue the command at the tail, spending one unit of its
    /// schedule-retry budget. With the budget exhausted this degrades to
    /// [`Skip`](Self::Skip).
    Retry,
    /// Halt the run and fail the result.
    Stop,
    /// Move on without recording the response.
    Skip,
}

/// Pure decision function from a received frame to a [`ResponseAction`].
#[derive(Clone)]
pub struct ResponsePolicy(Arc<dyn Fn(&Frame) -> ResponseAction + Send + Sync>);

impl ResponsePolicy {
    pub fn new(policy: impl Fn(&Frame) -> ResponseAction + Send + Sync + 'static) -> Self {
        Self(Arc::new(policy))
    }

    pub fn apply(&self, frame: &Frame) -> ResponseAction {
        (self.0)(frame)
    }
}

impl fmt::Debug for ResponsePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResponsePolicy")
    }
}

/// One scheduled send-and-wait step.
#[derive(Debug, Clone)]
pub struct CommandItem {
    /// Outbound command.
    pub kind: CommandKind,
    pub payload: Vec<u8>,
    /// Reply kind the transport waits for.
    pub expected: CommandKind,
    /// Operator-facing description, carried in progress events.
    pub label: String,
    /// Overrides the transport's timeout for this item only.
    pub timeout_override: Option<Duration>,
    /// Overrides the transport's retry count for this item only.
    pub retry_override: Option<usize>,
    /// Remaining schedule-level requeues a `Retry` decision may spend.
    pub schedule_retries: usize,
    /// Absent means every reply is treated as [`ResponseAction::Continue`].
    pub policy: Option<ResponsePolicy>,
}

impl CommandItem {
    pub fn new(
        kind: CommandKind,
        payload: Vec<u8>,
        expected: CommandKind,
        label: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload,
            expected,
            label: label.into(),
            timeout_override: None,
            retry_override: None,
            schedule_retries: DEFAULT_SCHEDULE_RETRIES,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    pub fn with_transport_retries(mut self, retry_count: usize) -> Self {
        self.retry_override = Some(retry_count);
        self
    }

    pub fn with_schedule_retries(mut self, retries: usize) -> Self {
        self.schedule_retries = retries;
        self
    }

    /// The copy requeued after a `Retry` decision: same command, one less
    /// unit of budget, label marked.
    fn retry_copy(&self) -> Self {
        let label = if self.label.ends_with("(retry)") {
            self.label.clone()
        } else {
            format!("{} (retry)", self.label)
        };

        Self {
            label,
            schedule_retries: self.schedule_retries - 1,
            ..self.clone()
        }
    }
}

/// Outcome of one scheduler run.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub success: bool,
    /// Empty on success.
    pub error: String,
    /// Replies recorded by `Continue` and `Stop` dispatches, in FIFO order.
    pub responses: Vec<Frame>,
    /// Items dispatched, whatever their policy outcome.
    pub executed: usize,
    /// Items submitted plus requeues; grows while retries enqueue copies.
    pub total: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("a command run is already in progress")]
    QueueBusy,
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: VecDeque<CommandItem>,
    running: bool,
    stop_requested: bool,
}

/// FIFO command queue with policy dispatch. Not re-entrant: one run at a
/// time, and the queue cannot be refilled while a run is in progress.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    events: EventSender,
}

impl Scheduler {
    pub fn new(events: EventSender) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            events,
        }
    }

    /// Queues one command behind any already waiting.
    pub fn push(&self, item: CommandItem) -> Result<(), SchedulerError> {
        self.push_all([item])
    }

    /// Queues several commands in order.
    pub fn push_all(
        &self,
        items: impl IntoIterator<Item = CommandItem>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().unwrap();
        if state.running {
            return Err(SchedulerError::QueueBusy);
        }
        state.queue.extend(items);
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// Requests a cooperative stop. The queue is cleared immediately; the
    /// run returns with a failed result after the in-flight command
    /// completes or times out.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        if state.running {
            state.stop_requested = true;
            info!("stop requested, queue cleared");
        }
    }

    /// Dispatches the queue until it drains, a policy halts it, the
    /// transport gives up, or a stop is requested.
    pub async fn run<T: Transport>(&self, transport: &T) -> Result<CommandResult, SchedulerError> {
        let total = {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Err(SchedulerError::QueueBusy);
            }
            state.running = true;
            state.stop_requested = false;
            state.queue.len()
        };

        let mut result = CommandResult {
            total,
            ..CommandResult::default()
        };

        loop {
            let Some(item) = self.state.lock().unwrap().queue.pop_front() else {
                result.success = true;
                break;
            };

            self.events
                .progress(result.executed, result.total, item.label.clone());
            debug!("dispatching {}: {}", item.kind, item.label);

            let config = transport
                .config()
                .with_overrides(item.timeout_override, item.retry_override);
            let outbound = Frame::new(item.kind, item.payload.clone());

            let reply = match transport.send_and_await(outbound, item.expected, &config).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("{}: {e}", item.label);
                    result.error = format!("communication lost: {e}");
                    self.state.lock().unwrap().queue.clear();
                    break;
                }
            };

            result.executed += 1;

            let action = item
                .policy
                .as_ref()
                .map(|policy| policy.apply(&reply))
                .unwrap_or(ResponseAction::Continue);

            match action {
                ResponseAction::Continue => {
                    if reply.kind == CommandKind::EnterBoot {
                        match DeviceInfo::decode(&reply.payload) {
                            Ok(info) => self.events.log(format!("target device: {info}")),
                            Err(e) => warn!("undecodable device info: {e}"),
                        }
                    }
                    result.responses.push(reply);
                }
                ResponseAction::Retry => {
                    if item.schedule_retries > 0 {
                        let retry = item.retry_copy();
                        info!(
                            "requeueing {} ({} requeues left)",
                            retry.label, retry.schedule_retries,
                        );
                        self.state.lock().unwrap().queue.push_back(retry);
                        result.total += 1;
                    } else {
                        warn!("{}: retry budget exhausted, skipping", item.label);
                        self.events
                            .log(format!("{}: retry budget exhausted", item.label));
                    }
                }
                ResponseAction::Stop => {
                    result.error = transport
                        .last_device_error()
                        .unwrap_or_else(|| format!("device rejected {}", item.label));
                    result.responses.push(reply);
                    self.state.lock().unwrap().queue.clear();
                    break;
                }
                ResponseAction::Skip => {
                    debug!("{}: response skipped", item.label);
                }
            }

            let stopped = {
                let mut state = self.state.lock().unwrap();
                if state.stop_requested {
                    state.queue.clear();
                    true
                } else {
                    false
                }
            };
            if stopped {
                result.error = "stopped by operator".to_string();
                break;
            }
        }

        self.state.lock().unwrap().running = false;
        Ok(result)
    }
}
