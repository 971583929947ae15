//! The outward-facing event channel.
//!
//! Every publisher in the crate (firmware store, transport, scheduler,
//! updater) holds a clone of one [`EventSender`]; subscribers drain the
//! matching receiver. Events are tagged variants so a test can observe the
//! whole stream deterministically. Everything sent here is also mirrored
//! into the `log` facade.

use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::firmware::FirmwareMeta;
use crate::updater::BootStatus;

#[derive(Debug, Clone)]
pub enum Event {
    /// A human-readable progress note.
    Log(String),
    /// A terminal failure of a workflow.
    Error(String),
    /// The orchestrator's lifecycle variable changed.
    Status(BootStatus),
    /// One scheduled command is about to be dispatched.
    Progress {
        current: usize,
        total: usize,
        label: String,
        percent: f32,
    },
    /// A firmware image finished loading.
    FirmwareLoaded(FirmwareMeta),
    /// The target answered with an error response; the string is its
    /// decoded payload.
    DeviceError(String),
}

/// Creates a connected sender/receiver pair.
pub fn channel() -> (EventSender, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, rx)
}

/// Cloneable handle publishing [`Event`]s.
///
/// Sends never fail: events outliving their subscriber are dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    /// A sender with no subscriber, for callers that only want the `log`
    /// mirror.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { tx }
    }

    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{message}");
        self.send(Event::Log(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.send(Event::Error(message));
    }

    pub fn device_error(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("device error: {message}");
        self.send(Event::DeviceError(message));
    }

    pub fn status(&self, status: BootStatus) {
        self.send(Event::Status(status));
    }

    pub fn progress(&self, current: usize, total: usize, label: impl Into<String>) {
        let percent = if total == 0 {
            100.0
        } else {
            current as f32 / total as f32 * 100.0
        };
        self.send(Event::Progress {
            current,
            total,
            label: label.into(),
            percent,
        });
    }

    pub fn firmware_loaded(&self, meta: FirmwareMeta) {
        self.send(Event::FirmwareLoaded(meta));
    }
}
