//! Composes the firmware store, scheduler, and transport into complete
//! update workflows.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use thiserror::Error;

use crate::commands;
use crate::event::EventSender;
use crate::firmware::{FirmwareError, FirmwareImage, FirmwareStore};
use crate::scheduler::{CommandResult, Scheduler, SchedulerError};
use crate::transport::Transport;

/// Coarse lifecycle of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStatus {
    Disconnected,
    Connected,
    InBootMode,
    Transfer,
    Verifying,
    Completed,
    Error,
}

impl fmt::Display for BootStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::InBootMode => "in boot mode",
            Self::Transfer => "transferring",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error(transparent)]
    Firmware(#[from] FirmwareError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Drives one target over one transport.
///
/// Workflow methods return the scheduler's [`CommandResult`]; a run that
/// the device or the link failed comes back as `Ok` with
/// `success == false` and the status moved to [`BootStatus::Error`].
/// `Err` is reserved for preconditions: no loaded image, or a run already
/// in progress.
pub struct Updater<T> {
    transport: T,
    scheduler: Scheduler,
    store: FirmwareStore,
    status: Mutex<BootStatus>,
    events: EventSender,
}

impl<T: Transport> Updater<T> {
    pub fn new(transport: T, events: EventSender) -> Self {
        let updater = Self {
            transport,
            scheduler: Scheduler::new(events.clone()),
            store: FirmwareStore::new(),
            status: Mutex::new(BootStatus::Disconnected),
            events,
        };
        updater.set_status(BootStatus::Connected);
        updater
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn firmware(&self) -> Option<&FirmwareImage> {
        self.store.image()
    }

    pub fn status(&self) -> BootStatus {
        *self.status.lock().unwrap()
    }

    /// Loads the image that subsequent uploads will stream.
    pub fn load_firmware(
        &mut self,
        path: impl AsRef<Path>,
        fragment_size: usize,
        app_address: u32,
    ) -> Result<(), FirmwareError> {
        let image = self.store.load(path, fragment_size, app_address)?;
        self.events.log(format!(
            "firmware {} loaded: {} bytes in {} fragments, digest {}",
            image.file_name(),
            image.len(),
            image.fragment_count(),
            image.digest(),
        ));
        let meta = image.meta();
        self.events.firmware_loaded(meta);
        Ok(())
    }

    pub fn clear_firmware(&mut self) {
        self.store.clear();
    }

    /// Asks the target for boot mode and reads its device report.
    pub async fn enter_boot(&self) -> Result<CommandResult, UpdaterError> {
        self.scheduler.push(commands::enter_boot_item())?;
        self.run_queue(BootStatus::Transfer, BootStatus::InBootMode)
            .await
    }

    /// Streams every fragment of the loaded image.
    pub async fn upload_all(&self) -> Result<CommandResult, UpdaterError> {
        let image = self.store.image().ok_or(FirmwareError::NoImage)?;
        self.scheduler.push_all(commands::upload_items(image)?)?;
        self.run_queue(BootStatus::Transfer, BootStatus::Completed)
            .await
    }

    /// Has the target check the delivered image.
    pub async fn verify(&self) -> Result<CommandResult, UpdaterError> {
        let image = self.store.image().ok_or(FirmwareError::NoImage)?;
        self.scheduler.push(commands::verify_item(image))?;
        self.run_queue(BootStatus::Verifying, BootStatus::Completed)
            .await
    }

    /// Commands the jump into the flashed application.
    pub async fn run_app(&self) -> Result<CommandResult, UpdaterError> {
        self.scheduler.push(commands::run_app_item())?;
        self.run_queue(BootStatus::Transfer, BootStatus::Completed)
            .await
    }

    /// The one-shot upgrade: enter boot, upload, verify, run. Returns the
    /// result of the first failing stage, or of the final one.
    pub async fn update(&self) -> Result<CommandResult, UpdaterError> {
        let result = self.enter_boot().await?;
        if !result.success {
            return Ok(result);
        }
        let result = self.upload_all().await?;
        if !result.success {
            return Ok(result);
        }
        let result = self.verify().await?;
        if !result.success {
            return Ok(result);
        }
        self.run_app().await
    }

    /// Requests a cooperative stop of the running workflow.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Releases the transport, leaving the session disconnected.
    pub fn detach(self) -> T {
        self.set_status(BootStatus::Disconnected);
        self.transport
    }

    async fn run_queue(
        &self,
        active: BootStatus,
        on_success: BootStatus,
    ) -> Result<CommandResult, UpdaterError> {
        self.set_status(active);
        let result = self.scheduler.run(&self.transport).await?;

        if result.success {
            self.set_status(on_success);
        } else {
            self.events.error(result.error.as_str());
            self.set_status(BootStatus::Error);
        }

        Ok(result)
    }

    fn set_status(&self, next: BootStatus) {
        let mut status = self.status.lock().unwrap();
        // Same-state writes are dropped.
        if *status == next {
            return;
        }
        debug!("status: {} -> {next}", *status);
        *status = next;
        self.events.status(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;
    use crate::event::{self, Event};
    use crate::frame::{CommandKind, Frame};
    use crate::transport::testkit::spawn_device;
    use crate::transport::{StreamTransport, TransferConfig};
    use std::time::Duration;

    fn boot_report() -> Frame {
        let info = DeviceInfo {
            model: "DEV-X".to_string(),
            flash_size: 128 * 1024,
            app_address: 0x0800_0000,
            fragment_size: 1024,
            boot_version: "v1.2.3".to_string(),
        };
        Frame::new(CommandKind::EnterBoot, info.encode().unwrap())
    }

    fn ack() -> Option<Frame> {
        Some(Frame::empty(CommandKind::Ack))
    }

    fn rig(
        script: Vec<Option<Frame>>,
    ) -> (
        Updater<StreamTransport<tokio::io::DuplexStream>>,
        tokio::task::JoinHandle<Vec<Frame>>,
        tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) {
        let (near, far) = tokio::io::duplex(16384);
        let (events, rx) = event::channel();
        let config = TransferConfig {
            timeout: Duration::from_millis(300),
            retry_count: 1,
            line_ending: Vec::new(),
        };
        let transport = StreamTransport::new(near, config, events.clone());
        let device = spawn_device(far, script);
        (Updater::new(transport, events), device, rx)
    }

    fn write_image(name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "bootlink-updater-{}-{name}",
            std::process::id(),
        ));
        std::fs::write(&path, data).unwrap();
        path
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn enter_boot_reports_the_device() {
        let (updater, _device, mut rx) = rig(vec![Some(boot_report())]);

        let result = updater.enter_boot().await.unwrap();

        assert!(result.success);
        assert_eq!(result.responses.len(), 1);
        assert_eq!(result.responses[0].kind, CommandKind::EnterBoot);
        assert_eq!(updater.status(), BootStatus::InBootMode);

        let events = drain(&mut rx);
        let log_line = events
            .iter()
            .find_map(|event| match event {
                Event::Log(line) if line.contains("target device") => Some(line.clone()),
                _ => None,
            })
            .expect("device info log line");
        assert!(log_line.contains("DEV-X"));
        assert!(log_line.contains("0x08000000"));
        assert!(log_line.contains("1024"));
    }

    #[tokio::test]
    async fn full_update_walks_every_stage() {
        // 10-byte image in 4-byte fragments: enter boot, 3 uploads,
        // verify, run.
        let mut script = vec![Some(boot_report())];
        script.extend(std::iter::repeat_with(ack).take(5));
        let (mut updater, device, mut rx) = rig(script);

        let path = write_image("full.bin", &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        updater.load_firmware(&path, 4, 0x0800_0000).unwrap();
        std::fs::remove_file(&path).ok();

        let result = updater.update().await.unwrap();

        assert!(result.success);
        assert_eq!(updater.status(), BootStatus::Completed);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|event| matches!(event, Event::FirmwareLoaded(meta) if meta.fragment_count == 3)));

        let statuses: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Status(status) => Some(*status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![
                BootStatus::Connected,
                BootStatus::Transfer,
                BootStatus::InBootMode,
                BootStatus::Transfer,
                BootStatus::Completed,
                BootStatus::Verifying,
                BootStatus::Completed,
                BootStatus::Transfer,
                BootStatus::Completed,
            ],
        );

        drop(updater);
        let requests = device.await.unwrap();
        let kinds: Vec<_> = requests.iter().map(|frame| frame.kind).collect();
        assert_eq!(
            kinds,
            vec![
                CommandKind::EnterBoot,
                CommandKind::Upload,
                CommandKind::Upload,
                CommandKind::Upload,
                CommandKind::Verify,
                CommandKind::RunApp,
            ],
        );
    }

    #[tokio::test]
    async fn silent_device_times_out_after_every_retry() {
        let (near, far) = tokio::io::duplex(4096);
        let (events, _rx) = event::channel();
        let config = TransferConfig {
            timeout: Duration::from_millis(200),
            retry_count: 3,
            line_ending: Vec::new(),
        };
        let transport = StreamTransport::new(near, config, events.clone());
        let _device = spawn_device(far, Vec::new());
        let updater = Updater::new(transport, events);

        let started = std::time::Instant::now();
        let result = updater.enter_boot().await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(600));
        assert!(!result.success);
        assert!(result.error.contains("communication lost"));
        assert_eq!(updater.status(), BootStatus::Error);
    }

    #[tokio::test]
    async fn upload_without_an_image_is_refused() {
        let (updater, _device, _rx) = rig(Vec::new());

        assert!(matches!(
            updater.upload_all().await,
            Err(UpdaterError::Firmware(FirmwareError::NoImage)),
        ));
    }

    #[tokio::test]
    async fn failed_stage_moves_status_to_error() {
        // The device refuses boot mode outright.
        let (updater, _device, mut rx) = rig(vec![Some(Frame::new(
            CommandKind::ErrorResponse,
            b"flash locked".to_vec(),
        ))]);

        let result = updater.enter_boot().await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error, "flash locked");
        assert_eq!(updater.status(), BootStatus::Error);
        assert!(drain(&mut rx)
            .iter()
            .any(|event| matches!(event, Event::Error(message) if message == "flash locked")));
    }

    #[tokio::test]
    async fn update_stops_at_the_first_failed_stage() {
        // Boot succeeds, first upload times out (silent device).
        let (mut updater, device, _rx) = rig(vec![Some(boot_report())]);

        let path = write_image("stall.bin", &[0xAB; 8]);
        updater.load_firmware(&path, 4, 0).unwrap();
        std::fs::remove_file(&path).ok();

        let result = updater.update().await.unwrap();

        assert!(!result.success);
        assert!(result.error.contains("communication lost"));
        assert_eq!(updater.status(), BootStatus::Error);

        drop(updater);
        let requests = device.await.unwrap();
        // Enter-boot plus the one upload that went unanswered.
        assert_eq!(requests[0].kind, CommandKind::EnterBoot);
        assert!(requests[1..].iter().all(|f| f.kind == CommandKind::Upload));
    }
}
