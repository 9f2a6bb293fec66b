//! Console commands understood by the ROMMON bootloader and the recovered
//! IOS image, together with their per-command timeouts.

use std::{net::Ipv4Addr, time::Duration};

use strum::Display;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const PROMPT_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const FLASH_INIT_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const EXTRACT_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub(crate) const EXTRACT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const BOOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub(crate) const LOGIN_TIMEOUT: Duration = Duration::from_secs(90);

/// A ROMMON environment variable set during the procedure
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EnvVar {
    IpAddr,
    Netmask,
    DefaultRouter,
    Boot,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::IpAddr => "IP_ADDR",
            EnvVar::Netmask => "NETMASK",
            EnvVar::DefaultRouter => "DEFAULT_ROUTER",
            EnvVar::Boot => "BOOT",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
#[non_exhaustive]
pub enum CommandType {
    Wake,
    SetEnv,
    PrintEnv,
    TftpInit,
    EtherInit,
    FlashInit,
    TarExtract,
    Boot,
    Enable,
    Password,
}

impl CommandType {
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Wake => PROMPT_TIMEOUT,
            CommandType::FlashInit => FLASH_INIT_TIMEOUT,
            CommandType::TarExtract => EXTRACT_TIMEOUT,
            CommandType::Boot => BOOT_TIMEOUT,
            CommandType::Enable => LOGIN_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Whether the command may be re-sent after a timeout. The extraction and
    /// the boot are owned by the device once issued and must never be
    /// re-entered mid-flight.
    pub fn retryable(&self) -> bool {
        !matches!(self, CommandType::TarExtract | CommandType::Boot)
    }
}

/// A command line sent verbatim to the device console
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Command {
    /// A bare carriage return to elicit the current prompt
    Wake,
    Set {
        variable: EnvVar,
        value: String,
    },
    PrintEnv,
    TftpInit,
    EtherInit,
    FlashInit,
    TarExtract {
        server: Ipv4Addr,
        filename: String,
    },
    Boot,
    Enable,
    Password {
        secret: String,
    },
}

impl Command {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Wake => CommandType::Wake,
            Command::Set { .. } => CommandType::SetEnv,
            Command::PrintEnv => CommandType::PrintEnv,
            Command::TftpInit => CommandType::TftpInit,
            Command::EtherInit => CommandType::EtherInit,
            Command::FlashInit => CommandType::FlashInit,
            Command::TarExtract { .. } => CommandType::TarExtract,
            Command::Boot => CommandType::Boot,
            Command::Enable => CommandType::Enable,
            Command::Password { .. } => CommandType::Password,
        }
    }

    /// The exact text written to the console, without the line terminator.
    pub fn line(&self) -> String {
        match self {
            Command::Wake => String::new(),
            Command::Set { variable, value } => format!("set {} {}", variable.as_str(), value),
            Command::PrintEnv => "set".into(),
            Command::TftpInit => "tftp_init".into(),
            Command::EtherInit => "ether_init".into(),
            Command::FlashInit => "flash_init".into(),
            Command::TarExtract { server, filename } => {
                format!("tar -xtract tftp://{}/{} flash:", server, filename)
            }
            Command::Boot => "boot".into(),
            Command::Enable => "enable".into(),
            Command::Password { secret } => secret.clone(),
        }
    }

    /// Loggable rendition of the command. Credentials are never logged.
    pub fn display(&self) -> String {
        match self {
            Command::Wake => "<wake>".into(),
            Command::Password { .. } => "<password>".into(),
            _ => self.line(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_documented_command_lines() {
        let set = Command::Set {
            variable: EnvVar::IpAddr,
            value: "10.0.0.1".into(),
        };
        assert_eq!(set.line(), "set IP_ADDR 10.0.0.1");

        let extract = Command::TarExtract {
            server: "10.0.0.2".parse().unwrap(),
            filename: "ap3g2-k9w7-tar.153-3.JF15.tar".into(),
        };
        assert_eq!(
            extract.line(),
            "tar -xtract tftp://10.0.0.2/ap3g2-k9w7-tar.153-3.JF15.tar flash:"
        );

        assert_eq!(Command::PrintEnv.line(), "set");
        assert_eq!(Command::Wake.line(), "");
    }

    #[test]
    fn transfer_and_boot_are_not_retryable() {
        assert!(!CommandType::TarExtract.retryable());
        assert!(!CommandType::Boot.retryable());
        assert!(CommandType::SetEnv.retryable());
        assert!(CommandType::FlashInit.retryable());
    }

    #[test]
    fn password_is_redacted_in_display() {
        let password = Command::Password {
            secret: "Cisco".into(),
        };
        assert_eq!(password.display(), "<password>");
        assert_eq!(password.line(), "Cisco");
    }

    #[test]
    fn long_running_commands_get_generous_timeouts() {
        assert!(CommandType::TarExtract.timeout() > CommandType::SetEnv.timeout());
        assert!(CommandType::Boot.timeout() > CommandType::SetEnv.timeout());
    }
}
