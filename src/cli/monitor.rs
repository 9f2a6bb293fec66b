//! Interactive serial monitor.
//!
//! Output is written as soon as it is read rather than being buffered until a
//! newline, so a prompt waiting for input shows up immediately. Keystrokes go
//! to the device; Ctrl-C exits the monitor.

use std::{
    io::{stdout, ErrorKind, Read, Write},
    time::Duration,
};

use crossterm::{
    event::{poll, read, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use log::error;
use miette::{IntoDiagnostic, Result};

use crate::interface::Transport;

const MONITOR_POLL_TIMEOUT: Duration = Duration::from_millis(5);

/// Type that ensures that raw mode is disabled when dropped.
struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        enable_raw_mode().into_diagnostic()?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            error!("Failed to disable raw_mode: {:#}", e)
        }
    }
}

/// Open a serial monitor on the given console transport.
pub fn monitor(mut serial: Box<dyn Transport>) -> Result<()> {
    println!("Commands:");
    println!("    CTRL+C    Exit");
    println!();

    serial.set_timeout(MONITOR_POLL_TIMEOUT).into_diagnostic()?;

    // We are in raw mode until `_raw_mode` is dropped (ie. this function
    // returns).
    let _raw_mode = RawModeGuard::new()?;

    let mut stdout = stdout();
    let mut buff = [0; 1024];
    loop {
        let read_count = match serial.read(&mut buff) {
            Ok(count) => Ok(count),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            err => err.into_diagnostic(),
        }?;

        if read_count > 0 {
            stdout.write_all(&buff[..read_count]).into_diagnostic()?;
            stdout.flush().ok();
        }

        if poll(Duration::from_secs(0)).into_diagnostic()? {
            if let Event::Key(key) = read().into_diagnostic()? {
                if key.kind == KeyEventKind::Press {
                    if key.modifiers.contains(KeyModifiers::CONTROL)
                        && key.code == KeyCode::Char('c')
                    {
                        break;
                    }

                    if let Some(bytes) = key_bytes(key) {
                        serial.write_all(&bytes).into_diagnostic()?;
                        serial.flush().into_diagnostic()?;
                    }
                }
            }
        }
    }

    Ok(())
}

// Translate a key event into the bytes the console expects; escape sequences
// follow the usual VT100 arrow-key encoding.
fn key_bytes(key_event: KeyEvent) -> Option<Vec<u8>> {
    let bytes: Vec<u8> = match key_event.code {
        KeyCode::Backspace => b"\x08".to_vec(),
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Tab => b"\x09".to_vec(),
        KeyCode::Esc => b"\x1b".to_vec(),
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Char(ch) => {
            if key_event.modifiers.contains(KeyModifiers::CONTROL) && ch.is_ascii_lowercase() {
                vec![ch as u8 & 0x1f]
            } else {
                let mut buf = [0; 4];
                ch.encode_utf8(&mut buf).as_bytes().to_vec()
            }
        }
        _ => return None,
    };

    Some(bytes)
}
