use std::error::Error;
use std::process::ExitCode;

use bootlink::{
    event::{self, Event},
    transport::{serial, TransferConfig},
    updater::Updater,
};

type Result<T> = std::result::Result<T, Box<dyn Error>>;

const USAGE: &str = "usage: bootlink <port> <firmware.bin> [fragment-size] [load-address]

  port          serial port name, e.g. /dev/ttyUSB0 or COM3
  firmware.bin  image to flash
  fragment-size upload fragment size in bytes (default 1024)
  load-address  application load address (default 0x08000000)

Pass `list` as the only argument to print the available ports.";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    simplelog::TermLogger::init(
        log::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )?;

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.len() == 1 && args[0] == "list" {
        for port in serial::available_ports()? {
            println!("{port}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    if args.len() < 2 {
        eprintln!("{USAGE}");
        return Ok(ExitCode::from(2));
    }

    let port = &args[0];
    let firmware = &args[1];
    let fragment_size: usize = match args.get(2) {
        Some(raw) => raw.parse()?,
        None => 1024,
    };
    let load_address = match args.get(3) {
        Some(raw) => parse_address(raw)?,
        None => 0x0800_0000,
    };

    let (events, mut rx) = event::channel();

    // Log and device-error events already reach the logger; surface
    // progress and status changes on stdout.
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Progress {
                    label, percent, ..
                } => println!("[{percent:5.1}%] {label}"),
                Event::Status(status) => println!("status: {status}"),
                _ => {}
            }
        }
    });

    let transport = serial::open(
        port,
        serial::DEFAULT_BAUD_RATE,
        TransferConfig::default(),
        events.clone(),
    )?;

    let mut updater = Updater::new(transport, events);
    updater.load_firmware(firmware, fragment_size, load_address)?;

    let result = updater.update().await?;
    if result.success {
        log::info!("update complete ({} commands)", result.executed);
        Ok(ExitCode::SUCCESS)
    } else {
        log::error!("update failed: {}", result.error);
        Ok(ExitCode::FAILURE)
    }
}

fn parse_address(raw: &str) -> Result<u32> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => raw.parse()?,
    };
    Ok(parsed)
}
