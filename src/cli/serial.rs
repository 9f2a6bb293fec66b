//! Discovery and selection of the console serial port.

use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use miette::{IntoDiagnostic, Result};
use serialport::{available_ports, SerialPortInfo, SerialPortType, UsbPortInfo};

use crate::{
    cli::{
        config::{Config, UsbDevice},
        ConnectArgs,
    },
    error::Error,
};

/// USB serial adapters commonly built into console cables
const KNOWN_DEVICES: &[UsbDevice] = &[
    // FTDI FT232R, the adapter in Cisco's own USB console cables
    UsbDevice {
        vid: 0x0403,
        pid: 0x6001,
    },
    // Prolific PL2303
    UsbDevice {
        vid: 0x067b,
        pid: 0x2303,
    },
    // Silicon Labs CP210x
    UsbDevice {
        vid: 0x10c4,
        pid: 0xea60,
    },
];

/// Resolve the console port from the command line, the config file, or an
/// interactive selection, in that order of precedence.
pub fn get_serial_port_info(args: &ConnectArgs, config: &Config) -> Result<SerialPortInfo, Error> {
    let ports = detect_serial_ports().unwrap_or_default();

    if let Some(port) = &args.port {
        let info = find_serial_port(&ports, port)?;
        if args.confirm_port && !confirm_port(&info)? {
            return Err(Error::SerialNotFound(port.clone()));
        }
        Ok(info)
    } else if let Some(port) = &config.connection.serial {
        find_serial_port(&ports, port)
    } else {
        let (info, known) = select_serial_port(ports, config)?;

        if let SerialPortType::UsbPort(usb_info) = &info.port_type {
            if !known {
                offer_to_remember(config, usb_info)?;
            }
        }

        Ok(info)
    }
}

/// Candidate console ports on this host. Built-in RS-232 ports enumerate as
/// `Unknown` on most platforms, so those are kept alongside USB adapters.
pub fn detect_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = available_ports().into_diagnostic()?;
    let ports = ports
        .into_iter()
        .filter(|port_info| {
            matches!(
                &port_info.port_type,
                SerialPortType::UsbPort(..) | SerialPortType::Unknown
            )
        })
        .collect::<Vec<_>>();

    Ok(ports)
}

fn find_serial_port(ports: &[SerialPortInfo], name: &str) -> Result<SerialPortInfo, Error> {
    // Resolve symlinked names like /dev/serial/by-id/... to the device node
    // the enumeration reports. Windows port names are not paths.
    #[cfg(not(target_os = "windows"))]
    let name = &std::fs::canonicalize(name)
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| name.to_string());

    ports
        .iter()
        .find(|port| port.port_name.eq_ignore_ascii_case(name))
        .cloned()
        .ok_or_else(|| Error::SerialNotFound(name.to_string()))
}

fn select_serial_port(
    ports: Vec<SerialPortInfo>,
    config: &Config,
) -> Result<(SerialPortInfo, bool), Error> {
    let device_matches = |info: &UsbPortInfo| {
        config
            .usb_device
            .iter()
            .chain(KNOWN_DEVICES.iter())
            .any(|dev| dev.matches(info))
    };

    if ports.len() > 1 {
        println!(
            "Detected {} serial ports. Ports which match a known console adapter are highlighted.\n",
            ports.len()
        );

        let port_names = ports
            .iter()
            .map(|port_info| match &port_info.port_type {
                SerialPortType::UsbPort(info) => {
                    let formatted = if device_matches(info) {
                        port_info.port_name.as_str().bold()
                    } else {
                        port_info.port_name.as_str().reset()
                    };

                    match &info.product {
                        Some(product) => format!("{} - {}", formatted, product),
                        None => formatted.to_string(),
                    }
                }
                _ => port_info.port_name.clone(),
            })
            .collect::<Vec<_>>();

        let index = Select::with_theme(&ColorfulTheme::default())
            .items(&port_names)
            .default(0)
            .interact_opt()?
            .ok_or(Error::Cancelled)?;

        let port_info = ports.into_iter().nth(index).ok_or(Error::NoSerial)?;
        let known = match &port_info.port_type {
            SerialPortType::UsbPort(usb_info) => device_matches(usb_info),
            _ => false,
        };

        Ok((port_info, known))
    } else if let [port_info] = ports.as_slice() {
        match &port_info.port_type {
            SerialPortType::UsbPort(usb_info) if device_matches(usb_info) => {
                Ok((port_info.clone(), true))
            }
            _ => {
                if confirm_port(port_info)? {
                    Ok((port_info.clone(), false))
                } else {
                    Err(Error::SerialNotFound(port_info.port_name.clone()))
                }
            }
        }
    } else {
        Err(Error::NoSerial)
    }
}

fn confirm_port(port_info: &SerialPortInfo) -> Result<bool, Error> {
    let product = match &port_info.port_type {
        SerialPortType::UsbPort(info) => info.product.as_deref(),
        _ => None,
    };

    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(match product {
            Some(product) => format!("Use serial port '{}' - {}?", port_info.port_name, product),
            None => format!("Use serial port '{}'?", port_info.port_name),
        })
        .interact_opt()?
        .ok_or(Error::Cancelled)
}

fn offer_to_remember(config: &Config, usb_info: &UsbPortInfo) -> Result<(), Error> {
    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Remember this serial adapter for future use?")
        .interact_opt()?
        .unwrap_or_default();

    if remember {
        // Failing to persist the adapter must not abort the recovery.
        if let Err(e) = config.save_with(|config| {
            config.usb_device.push(UsbDevice {
                vid: usb_info.vid,
                pid: usb_info.pid,
            })
        }) {
            eprintln!("Failed to save config {:#}", e);
        }
    }

    Ok(())
}
