//! Opening real serial ports into [`StreamTransport`]s.

use log::debug;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{StreamTransport, TransferConfig, TransportError};
use crate::event::EventSender;

/// Baud rate resident bootloaders in the field run at.
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Opens the port at `path` with 8-N-1 framing and wraps it in a
/// [`StreamTransport`].
pub fn open(
    path: &str,
    baud_rate: u32,
    config: TransferConfig,
    events: EventSender,
) -> Result<StreamTransport<SerialStream>, TransportError> {
    debug!("opening serial port {path} at {baud_rate} baud");

    let stream = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()?;

    Ok(StreamTransport::new(stream, config, events))
}

/// Names of the serial ports visible to the host.
pub fn available_ports() -> Result<Vec<String>, TransportError> {
    Ok(tokio_serial::available_ports()?
        .into_iter()
        .map(|port| port.port_name)
        .collect())
}
