//! Establish a connection with the device console
//!
//! The [Connection] struct abstracts over the serial transport and provides
//! the line-oriented operations the procedure is built from: sending command
//! lines and waiting, under a wall-clock deadline, for output matching an
//! expected pattern. Everything the device prints is appended to the session
//! transcript.

use std::{
    io::{ErrorKind, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use log::{debug, trace};
use regex::Regex;

use crate::{
    command::Command,
    error::{ConnectionError, Error, TimedOutStep},
    interface::Transport,
    prompt,
    transcript::Transcript,
};

// The transport read timeout is kept short and a timed-out read simply means
// "no data yet"; step deadlines are enforced on top by [Connection::await_pattern].
const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(50);

const READ_CHUNK: usize = 1024;

// Boot output runs to hundreds of kilobytes; the match window is bounded and
// only its tail is kept. The full output is still in the transcript.
const WINDOW_LIMIT: usize = 64 * 1024;
const WINDOW_KEEP: usize = 16 * 1024;

/// An established connection with a device console
pub struct Connection {
    transport: Box<dyn Transport>,
    transcript: Transcript,
    window: String,
    pending_cr: bool,
    abort: Option<Arc<AtomicBool>>,
}

impl Connection {
    pub fn new(mut transport: Box<dyn Transport>, transcript: Transcript) -> Self {
        if let Err(e) = transport.set_timeout(SERIAL_POLL_TIMEOUT) {
            log::warn!("failed to set transport poll timeout: {e}");
        }

        Connection {
            transport,
            transcript,
            window: String::new(),
            pending_cr: false,
            abort: None,
        }
    }

    /// Abort between reads when the flag is raised (Ctrl-C wiring).
    #[must_use]
    pub fn with_abort(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = Some(flag);
        self
    }

    /// Write one command line to the console, CR-terminated.
    pub fn send_command(&mut self, command: &Command) -> Result<(), Error> {
        debug!("sending command: {}", command.display());
        self.send_line(&command.line())
    }

    pub fn send_line(&mut self, line: &str) -> Result<(), Error> {
        self.transport.write_all(line.as_bytes())?;
        self.transport.write_all(b"\r")?;
        self.transport.flush()?;
        Ok(())
    }

    /// Block until output matching `expect` arrives or the deadline elapses.
    ///
    /// Returns the matched text and consumes the window through the end of
    /// the match, so a later call needs a fresh occurrence. Output matching a
    /// known failure pattern before the expected match halts the procedure
    /// with [Error::UnexpectedPrompt]; the documented benign anomaly is
    /// exempt.
    pub fn await_pattern(
        &mut self,
        expect: &Regex,
        what: &str,
        timeout: Duration,
    ) -> Result<String, Error> {
        let deadline = Instant::now() + timeout;

        loop {
            let found = expect.find(&self.window).map(|m| (m.start(), m.end()));

            if let Some((pos, line)) = self.scan_suspect() {
                if found.map_or(true, |(start, _)| pos < start) {
                    return Err(Error::UnexpectedPrompt {
                        expected: what.to_string(),
                        found: line,
                    });
                }
            }

            if let Some((start, end)) = found {
                let matched = self.window[start..end].to_string();
                trace!("matched {what:?}: {matched:?}");
                self.window.drain(..end);
                return Ok(matched);
            }

            if Instant::now() >= deadline {
                return Err(Error::Connection(ConnectionError::Timeout(
                    TimedOutStep::default(),
                )));
            }

            self.poll_output()?;
        }
    }

    /// Read whatever the device has produced, appending it to the transcript
    /// and the match window. Returns the number of new bytes; zero means the
    /// poll timeout elapsed with the line silent.
    pub(crate) fn poll_output(&mut self) -> Result<usize, Error> {
        self.check_abort()?;

        let mut buf = [0u8; READ_CHUNK];
        match self.transport.read(&mut buf) {
            Ok(0) => Err(Error::Connection(ConnectionError::Disconnected)),
            Ok(n) => {
                self.transcript.append(&buf[..n]);
                self.push_normalized(&buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove and return the first complete line in the window, leaving
    /// everything after it (and any unterminated tail, such as a pending
    /// prompt) in place.
    pub(crate) fn take_line(&mut self) -> Option<String> {
        let idx = self.window.find('\n')?;
        let line: String = self.window.drain(..=idx).collect();
        Some(line.trim_end_matches('\n').to_string())
    }

    pub(crate) fn window(&self) -> &str {
        &self.window
    }

    pub(crate) fn consume_window(&mut self) {
        self.window.clear();
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Release the transport, e.g. to hand it to the serial monitor.
    pub fn into_parts(self) -> (Box<dyn Transport>, Transcript) {
        (self.transport, self.transcript)
    }

    fn check_abort(&self) -> Result<(), Error> {
        match &self.abort {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// First failure-pattern match in the window, as (offset, full line),
    /// skipping lines the procedure whitelists.
    fn scan_suspect(&self) -> Option<(usize, String)> {
        let mut earliest: Option<(usize, String)> = None;

        for pattern in prompt::suspect_patterns() {
            for found in pattern.find_iter(&self.window) {
                let line_start = self.window[..found.start()]
                    .rfind('\n')
                    .map(|i| i + 1)
                    .unwrap_or(0);
                let line_end = self.window[found.end()..]
                    .find('\n')
                    .map(|i| found.end() + i)
                    .unwrap_or(self.window.len());
                let line = &self.window[line_start..line_end];

                if prompt::is_benign(line) {
                    continue;
                }
                if earliest.as_ref().map_or(true, |(pos, _)| found.start() < *pos) {
                    earliest = Some((found.start(), line.to_string()));
                }
                break;
            }
        }

        earliest
    }

    // Console output arrives with CRLF (and occasionally bare CR) line
    // endings; the window holds a single form so patterns do too.
    fn push_normalized(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                b'\r' => {
                    self.window.push('\n');
                    self.pending_cr = true;
                }
                b'\n' => {
                    if !self.pending_cr {
                        self.window.push('\n');
                    }
                    self.pending_cr = false;
                }
                _ => {
                    self.pending_cr = false;
                    if b.is_ascii() {
                        self.window.push(b as char);
                    } else {
                        self.window.push(char::REPLACEMENT_CHARACTER);
                    }
                }
            }
        }

        if self.window.len() > WINDOW_LIMIT {
            let mut cut = self.window.len() - WINDOW_KEEP;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, Read, Write};

    use super::*;
    use crate::interface::ReplayPort;
    use crate::prompt::RE_ROMMON_PROMPT;

    fn connection(output: &str) -> Connection {
        Connection::new(
            Box::new(ReplayPort::new(output.as_bytes().to_vec())),
            Transcript::in_memory(),
        )
    }

    const SHORT: Duration = Duration::from_millis(50);

    #[test]
    fn matches_and_consumes_each_prompt_once() {
        let mut conn = connection("ap: \nap: tftp_init\n");

        conn.await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap();
        conn.await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap();

        // Both occurrences are consumed; a third wait must time out.
        let err = conn
            .await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
    }

    #[test]
    fn silent_device_times_out() {
        let mut conn = connection("IOS Bootloader - Starting system.\n");
        let err = conn
            .await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
    }

    #[test]
    fn failure_line_halts_with_unexpected_prompt() {
        let mut conn = connection("boot: cannot load \"flash:/missing\"\n");
        let err = conn
            .await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap_err();
        match err {
            Error::UnexpectedPrompt { found, .. } => {
                assert_eq!(found, "boot: cannot load \"flash:/missing\"")
            }
            other => panic!("expected UnexpectedPrompt, got {other:?}"),
        }
    }

    #[test]
    fn benign_mzip_line_is_skipped() {
        let mut conn = connection("magic number mismatch: bad mzip file\nap: \n");
        conn.await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap();
    }

    #[test]
    fn expected_match_before_failure_line_wins() {
        let mut conn = connection("ap: \nmagic number mismatch: 0xdeadbeef\n");
        conn.await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap();
    }

    #[test]
    fn raised_abort_flag_cancels() {
        let flag = Arc::new(AtomicBool::new(true));
        let mut conn = connection("ap: ").with_abort(flag);
        let err = conn
            .await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    struct DeadPort;

    impl Read for DeadPort {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    impl Write for DeadPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for DeadPort {
        fn set_timeout(&mut self, _: Duration) -> io::Result<()> {
            Ok(())
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }
    }

    #[test]
    fn closed_transport_is_fatal() {
        let mut conn = Connection::new(Box::new(DeadPort), Transcript::in_memory());
        let err = conn
            .await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Disconnected)
        ));
    }

    #[test]
    fn crlf_output_is_normalized_for_matching() {
        let mut conn = connection("tftp_init success\r\nap: ");
        conn.await_pattern(&RE_ROMMON_PROMPT, "ROMMON prompt", SHORT)
            .unwrap();
        assert!(conn.transcript().contents().contains("\r\n"));
    }

    #[test]
    fn take_line_keeps_the_pending_prompt() {
        let mut conn = connection("extracting info (285 bytes)\nextracting 8001.img (7233931 bytes)\nap: ");
        while conn.poll_output().unwrap() > 0 {}

        assert_eq!(
            conn.take_line(),
            Some("extracting info (285 bytes)".to_string())
        );
        assert_eq!(
            conn.take_line(),
            Some("extracting 8001.img (7233931 bytes)".to_string())
        );
        assert_eq!(conn.take_line(), None);
        assert_eq!(conn.window(), "ap: ");
    }
}
