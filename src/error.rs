//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;

/// All possible errors returned by apflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Recovery was cancelled by the operator")]
    #[diagnostic(code(apflash::cancelled))]
    Cancelled,

    #[error("Error while communicating with the device console")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Unexpected console output while waiting for {expected}")]
    #[diagnostic(
        code(apflash::unexpected_prompt),
        help("The device reported: `{found}`\n\
              The procedure has been halted; inspect the session transcript before retrying")
    )]
    UnexpectedPrompt { expected: String, found: String },

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(apflash::serial_not_found),
        help("Make sure the console cable is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(apflash::no_serial),
        help("Make sure a console cable is connected to the host system. If it is connected but not listed, pass the port explicitly with `--port`.")
    )]
    NoSerial,

    #[error("This session already failed and cannot be resumed")]
    #[diagnostic(
        code(apflash::session_not_resumable),
        help("Inspect the transcript, power-cycle the device into ROMMON, and start a new recovery")
    )]
    SessionNotResumable,

    #[error("Cannot derive a boot image path from firmware name '{0}'")]
    #[diagnostic(
        code(apflash::invalid_firmware_name),
        help("Expected a Cisco firmware tar such as `ap3g2-k9w7-tar.153-3.JF15.tar`")
    )]
    InvalidFirmwareName(String),

    #[error("Failed to open file: {0}")]
    #[diagnostic(code(apflash::file_open_error))]
    FileOpenError(String, #[source] io::Error),

    #[error(transparent)]
    #[diagnostic(code(apflash::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

/// Console-transport errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Serial connection closed by the device")]
    #[diagnostic(
        code(apflash::disconnected),
        help("Check the console cable and the device's power, then reconnect to resume")
    )]
    Disconnected,

    #[error("Serial port not found")]
    #[diagnostic(
        code(apflash::device_not_found),
        help("Ensure that the console cable is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("Timeout while waiting for {0}the expected console output")]
    #[diagnostic(
        code(apflash::timeout),
        help("The device produced no matching output before the deadline; a stalled TFTP transfer also surfaces here")
    )]
    Timeout(TimedOutStep),

    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(apflash::serial_error))]
    Serial(#[source] serialport::Error),
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        from_error_kind(err.kind(), err)
    }
}

impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(kind) => from_error_kind(kind, err),
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

fn from_error_kind<E>(kind: io::ErrorKind, err: E) -> ConnectionError
where
    E: Display,
{
    use io::ErrorKind;

    match kind {
        ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutStep::default()),
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => ConnectionError::Disconnected,
        _ => ConnectionError::Serial(serialport::Error::new(
            serialport::ErrorKind::Io(kind),
            err.to_string(),
        )),
    }
}

/// A procedure step which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutStep {
    command: Option<CommandType>,
}

impl TimedOutStep {
    pub fn command(&self) -> Option<CommandType> {
        self.command
    }
}

impl Display for TimedOutStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "`{}` and ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutStep {
    fn from(ct: CommandType) -> Self {
        TimedOutStep { command: Some(ct) }
    }
}

/// Attach the step's command type to an otherwise anonymous timeout.
pub(crate) trait ResultExt {
    fn for_step(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn for_step(self, command: CommandType) -> Self {
        self.map_err(|err| match err {
            Error::Connection(ConnectionError::Timeout(step)) if step.command().is_none() => {
                Error::Connection(ConnectionError::Timeout(command.into()))
            }
            err => err,
        })
    }
}
