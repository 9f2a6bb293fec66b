//! Automated ROMMON firmware recovery for Cisco 2702-series access points.
//!
//! Drives the documented recovery procedure over a serial console: configure
//! the bootloader's network environment, watch the device pull and extract a
//! firmware tar from an external TFTP server, set the boot path, reboot, and
//! authenticate into the recovered image. A captured session transcript can
//! be replayed through the same code paths without hardware.

pub mod cli;

mod command;
mod connection;
mod error;
mod interface;
mod prompt;
mod recovery;
mod session;
mod transcript;
mod transfer;

pub use command::{Command, CommandType, EnvVar};
pub use connection::Connection;
pub use error::{ConnectionError, Error};
pub use interface::{Interface, ReplayPort, Transport};
pub use prompt::{ExtractEntry, PromptState};
pub use recovery::{Recovery, RecoveryStage};
pub use session::{Session, SessionConfig, Timeouts, DEFAULT_ENABLE_PASSWORD};
pub use transcript::Transcript;
pub use transfer::{NullObserver, TransferObserver, TransferOutcome};
