//! Command-line interface configuration
//!
//! The [Config] type handles loading and saving the optional configuration
//! file: the remembered console port, known USB serial adapters, and the
//! recovery defaults applied when the matching CLI arguments are omitted.

use std::{
    fs::{create_dir_all, read_to_string, write},
    net::Ipv4Addr,
    path::PathBuf,
};

use directories::ProjectDirs;
use log::debug;
use miette::{miette, IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};
use serialport::UsbPortInfo;

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for the console
    pub serial: Option<String>,
}

/// A configured, known USB serial adapter
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

impl UsbDevice {
    /// Check if the given USB port matches this device
    pub fn matches(&self, port: &UsbPortInfo) -> bool {
        self.vid == port.vid && self.pid == port.pid
    }
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{decimal:04x}"))
}

/// Recovery defaults applied when the matching CLI arguments are omitted
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RecoveryDefaults {
    /// TFTP server the device pulls the image from
    pub server: Option<Ipv4Addr>,
    /// Enable password of the recovered image
    pub enable_password: Option<String>,
    pub extract_timeout_secs: Option<u64>,
    pub boot_timeout_secs: Option<u64>,
}

/// Deserialized contents of the configuration file
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    #[serde(default)]
    pub recovery: RecoveryDefaults,
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load the config from the platform config directory, falling back to
    /// defaults when no file exists yet.
    pub fn load() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "apflash")
            .ok_or_else(|| miette!("No valid home directory path could be retrieved"))?;
        let file = dirs.config_dir().join("apflash.toml");

        let mut config = if let Ok(data) = read_to_string(&file) {
            toml::from_str(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", file.display()))?
        } else {
            Self::default()
        };
        config.save_path = file;
        debug!("config: {:?}", config);

        Ok(config)
    }

    /// Apply a modification and persist the result.
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        if let Some(parent) = copy.save_path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;
        write(&copy.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", copy.save_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_usb_ids() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "0403"
            pid = "6001"
            "#,
        )
        .unwrap();

        assert_eq!(config.usb_device.len(), 1);
        assert_eq!(config.usb_device[0].vid, 0x0403);
        assert_eq!(config.usb_device[0].pid, 0x6001);
    }

    #[test]
    fn accepts_prefixed_hex() {
        let config: Config = toml::from_str(
            r#"
            [[usb_device]]
            vid = "0x067B"
            pid = "0x2303"
            "#,
        )
        .unwrap();

        assert_eq!(config.usb_device[0].vid, 0x067b);
        assert_eq!(config.usb_device[0].pid, 0x2303);
    }

    #[test]
    fn roundtrips_usb_ids() {
        let config = Config {
            usb_device: vec![UsbDevice {
                vid: 0x10c4,
                pid: 0xea60,
            }],
            ..Config::default()
        };

        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.usb_device[0].vid, 0x10c4);
        assert_eq!(parsed.usb_device[0].pid, 0xea60);
    }

    #[test]
    fn recovery_defaults_are_optional() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.recovery.server.is_none());
        assert!(config.recovery.enable_password.is_none());
    }
}
