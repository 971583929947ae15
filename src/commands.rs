//! Canonical command items and response policies for the bootloader
//! workflows.

use crate::firmware::{FirmwareError, FirmwareImage};
use crate::frame::CommandKind;
use crate::scheduler::{CommandItem, ResponseAction, ResponsePolicy};

/// Accepts the boot report; anything else aborts the workflow.
pub fn enter_boot_policy() -> ResponsePolicy {
    ResponsePolicy::new(|frame| match frame.kind {
        CommandKind::EnterBoot => ResponseAction::Continue,
        _ => ResponseAction::Stop,
    })
}

/// Fragments rejected by the device are retried; protocol breakdowns
/// abort.
pub fn upload_policy() -> ResponsePolicy {
    ResponsePolicy::new(|frame| match frame.kind {
        CommandKind::Ack => ResponseAction::Continue,
        CommandKind::ErrorResponse => ResponseAction::Retry,
        _ => ResponseAction::Stop,
    })
}

pub fn verify_policy() -> ResponsePolicy {
    ResponsePolicy::new(|frame| match frame.kind {
        CommandKind::Ack => ResponseAction::Continue,
        _ => ResponseAction::Stop,
    })
}

pub fn run_app_policy() -> ResponsePolicy {
    ResponsePolicy::new(|frame| match frame.kind {
        CommandKind::Ack => ResponseAction::Continue,
        _ => ResponseAction::Stop,
    })
}

/// The boot-mode handshake. The reply echoes the command kind with a
/// device report payload.
pub fn enter_boot_item() -> CommandItem {
    CommandItem::new(
        CommandKind::EnterBoot,
        Vec::new(),
        CommandKind::EnterBoot,
        "enter boot mode",
    )
    .with_policy(enter_boot_policy())
}

/// One upload item per fragment of `image`, in order.
///
/// Transport-level resends are disabled for uploads; a device-reported
/// failure comes back as an error response and is handled by the
/// schedule-level retry budget instead.
pub fn upload_items(image: &FirmwareImage) -> Result<Vec<CommandItem>, FirmwareError> {
    let total = image.fragment_count();

    (0..total)
        .map(|index| {
            let payload = image.build_fragment(index)?;
            Ok(CommandItem::new(
                CommandKind::Upload,
                payload,
                CommandKind::Ack,
                format!("upload fragment {}/{total}", index + 1),
            )
            .with_policy(upload_policy())
            .with_transport_retries(0)
            .with_schedule_retries(3))
        })
        .collect()
}

/// Asks the target to check the delivered image against its length and
/// whole-image CRC32.
pub fn verify_item(image: &FirmwareImage) -> CommandItem {
    let mut payload = Vec::with_capacity(8);
    payload.extend_from_slice(&(image.len() as u32).to_le_bytes());
    payload.extend_from_slice(&image.crc32().to_le_bytes());

    CommandItem::new(CommandKind::Verify, payload, CommandKind::Ack, "verify image")
        .with_policy(verify_policy())
}

pub fn run_app_item() -> CommandItem {
    CommandItem::new(
        CommandKind::RunApp,
        Vec::new(),
        CommandKind::Ack,
        "run application",
    )
    .with_policy(run_app_policy())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::FirmwareStore;
    use crate::frame::Frame;

    fn frame(kind: CommandKind) -> Frame {
        Frame::empty(kind)
    }

    #[test]
    fn enter_boot_accepts_only_the_boot_report() {
        let policy = enter_boot_policy();
        assert_eq!(
            policy.apply(&frame(CommandKind::EnterBoot)),
            ResponseAction::Continue,
        );
        assert_eq!(policy.apply(&frame(CommandKind::Nack)), ResponseAction::Stop);
        assert_eq!(
            policy.apply(&frame(CommandKind::ErrorResponse)),
            ResponseAction::Stop,
        );
        assert_eq!(policy.apply(&frame(CommandKind::Ack)), ResponseAction::Stop);
    }

    #[test]
    fn upload_retries_on_device_error() {
        let policy = upload_policy();
        assert_eq!(
            policy.apply(&frame(CommandKind::Ack)),
            ResponseAction::Continue,
        );
        assert_eq!(
            policy.apply(&frame(CommandKind::ErrorResponse)),
            ResponseAction::Retry,
        );
        assert_eq!(policy.apply(&frame(CommandKind::Nack)), ResponseAction::Stop);
    }

    #[test]
    fn run_app_stops_on_device_error() {
        let policy = run_app_policy();
        assert_eq!(
            policy.apply(&frame(CommandKind::Ack)),
            ResponseAction::Continue,
        );
        assert_eq!(
            policy.apply(&frame(CommandKind::ErrorResponse)),
            ResponseAction::Stop,
        );
    }

    #[test]
    fn upload_items_cover_every_fragment() {
        let dir = std::env::temp_dir().join(format!(
            "bootlink-commands-{}.bin",
            std::process::id(),
        ));
        std::fs::write(&dir, (0u8..=99).collect::<Vec<_>>()).unwrap();

        let mut store = FirmwareStore::new();
        let image = store.load(&dir, 40, 0x0800_0000).unwrap();
        let items = upload_items(image).unwrap();
        std::fs::remove_file(&dir).ok();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].label, "upload fragment 1/3");
        assert_eq!(items[2].label, "upload fragment 3/3");
        for (index, item) in items.iter().enumerate() {
            assert_eq!(item.kind, CommandKind::Upload);
            assert_eq!(item.expected, CommandKind::Ack);
            assert_eq!(item.retry_override, Some(0));
            assert_eq!(item.schedule_retries, 3);
            assert_eq!(&item.payload[0..4], &(index as u32).to_le_bytes());
        }
    }

    #[test]
    fn verify_payload_carries_length_and_crc() {
        let path = std::env::temp_dir().join(format!(
            "bootlink-verify-{}.bin",
            std::process::id(),
        ));
        std::fs::write(&path, [1u8, 2, 3, 4, 5]).unwrap();

        let mut store = FirmwareStore::new();
        let image = store.load(&path, 4, 0).unwrap();
        let item = verify_item(image);
        std::fs::remove_file(&path).ok();

        assert_eq!(item.kind, CommandKind::Verify);
        assert_eq!(&item.payload[0..4], &5u32.to_le_bytes());
        assert_eq!(&item.payload[4..8], &image.crc32().to_le_bytes());
    }
}
