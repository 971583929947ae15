//! Crate for flashing firmware to microcontrollers that run a resident
//! serial bootloader.
//!
//! The host side of the protocol is split into three layers. The
//! [`transport`] owns the byte stream, reassembles inbound [`frame`]s, and
//! serves one send-and-await request at a time. The [`scheduler`] turns a
//! queue of [`scheduler::CommandItem`]s into a policy-driven workflow with
//! per-command timeouts and retries. The [`updater`] composes both with the
//! [`firmware`] store into the complete flows: enter boot mode, stream the
//! image fragment by fragment, verify it, and start the application.
//!
//! Everything observable flows out of one [`event`] channel, so an
//! operator surface (or a test) sees logs, progress, status changes, and
//! device errors as a single stream.

pub mod commands;
pub mod crc;
pub mod device;
pub mod event;
pub mod firmware;
pub mod frame;
pub mod scheduler;
pub mod transport;
pub mod updater;

pub use event::{Event, EventSender};
pub use frame::{CommandKind, Frame};
pub use transport::{StreamTransport, TransferConfig, Transport};
pub use updater::{BootStatus, Updater};
