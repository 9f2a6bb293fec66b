//! Observation of the TFTP pull and flash extraction.
//!
//! The transfer itself is owned by the device and the external TFTP server;
//! this side only watches the console for the device's extraction listing.
//! There is consequently no retry here: a stalled transfer surfaces as a
//! timeout and the procedure halts.

use std::time::Instant;

use log::{debug, info};

use crate::{
    command::CommandType,
    connection::Connection,
    error::{ConnectionError, Error},
    prompt::{self, ExtractEntry, PromptState, RE_ROMMON_PROMPT},
    session::Timeouts,
};

/// Progress callbacks for the extraction phase
pub trait TransferObserver {
    /// The extraction command was issued
    fn start(&mut self, filename: &str);
    /// The device reported one extracted file
    fn entry(&mut self, entry: &ExtractEntry);
    /// The bootloader prompt returned after the listing
    fn finish(&mut self, outcome: &TransferOutcome);
}

/// Observer that discards all progress
#[derive(Default)]
pub struct NullObserver;

impl TransferObserver for NullObserver {
    fn start(&mut self, _filename: &str) {}
    fn entry(&mut self, _entry: &ExtractEntry) {}
    fn finish(&mut self, _outcome: &TransferOutcome) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
    pub entries: usize,
    pub total_bytes: u64,
}

/// Watch the console until the extraction completes.
///
/// The completion signal is the ROMMON prompt returning after at least one
/// `extracting` entry; the manual procedure offers nothing stronger. Both the
/// overall deadline and an inactivity window are enforced, and either miss is
/// reported as a `tar_extract` timeout.
pub fn await_transfer_complete(
    connection: &mut Connection,
    observer: &mut dyn TransferObserver,
    timeouts: &Timeouts,
) -> Result<TransferOutcome, Error> {
    let deadline = Instant::now() + timeouts.extract;
    let mut last_activity = Instant::now();
    let mut outcome = TransferOutcome::default();

    loop {
        let read = connection.poll_output()?;
        if read > 0 {
            last_activity = Instant::now();
        }

        // One line at a time, so that output past the completion signal (the
        // echoed prompt of the next stage's command in a captured transcript)
        // stays in the window for that stage.
        while let Some(line) = connection.take_line() {
            match prompt::classify(&line) {
                Some(PromptState::Extracting) => {
                    if let Some(entry) = prompt::parse_extract_entry(&line) {
                        debug!("extracted {} ({} bytes)", entry.path, entry.bytes);
                        outcome.entries += 1;
                        outcome.total_bytes += entry.bytes;
                        observer.entry(&entry);
                    }
                }
                Some(PromptState::Error) => {
                    return Err(Error::UnexpectedPrompt {
                        expected: "extraction listing".into(),
                        found: line,
                    });
                }
                // In a captured transcript the returning prompt arrives as
                // the prefix of the next echoed command line. The prompt
                // preceding the extraction (the echoed `tar -xtract` itself)
                // is ignored by the entry-count guard.
                Some(PromptState::RommonReady) if outcome.entries > 0 => {
                    return finished(observer, outcome);
                }
                _ => {}
            }
        }

        // Live, the returning prompt has no newline and stays in the window.
        if outcome.entries > 0 && RE_ROMMON_PROMPT.is_match(connection.window()) {
            connection.consume_window();
            return finished(observer, outcome);
        }

        let now = Instant::now();
        if now >= deadline || now.duration_since(last_activity) >= timeouts.extract_inactivity {
            return Err(Error::Connection(ConnectionError::Timeout(
                CommandType::TarExtract.into(),
            )));
        }
    }
}

fn finished(
    observer: &mut dyn TransferObserver,
    outcome: TransferOutcome,
) -> Result<TransferOutcome, Error> {
    info!(
        "extraction complete: {} files, {} bytes (state: {})",
        outcome.entries,
        outcome.total_bytes,
        PromptState::ExtractDone,
    );
    observer.finish(&outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{interface::ReplayPort, transcript::Transcript};

    fn connection(output: &str) -> Connection {
        Connection::new(
            Box::new(ReplayPort::new(output.as_bytes().to_vec())),
            Transcript::in_memory(),
        )
    }

    fn timeouts() -> Timeouts {
        Timeouts::uniform(Duration::from_millis(50))
    }

    #[derive(Default)]
    struct RecordingObserver {
        entries: Vec<ExtractEntry>,
        finished: Option<TransferOutcome>,
    }

    impl TransferObserver for RecordingObserver {
        fn start(&mut self, _filename: &str) {}

        fn entry(&mut self, entry: &ExtractEntry) {
            self.entries.push(entry.clone());
        }

        fn finish(&mut self, outcome: &TransferOutcome) {
            self.finished = Some(*outcome);
        }
    }

    #[test]
    fn completes_when_the_prompt_returns_after_entries() {
        let mut conn = connection(
            "tar -xtract tftp://10.0.0.2/ap3g2-k9w7-tar.153-3.JF15.tar flash:\n\
             extracting info (285 bytes)\n\
             extracting ap3g2-k9w7-mx.153-3.JF15/8001.img (7233931 bytes)\n\
             ap: ",
        );
        let mut observer = RecordingObserver::default();

        let outcome =
            await_transfer_complete(&mut conn, &mut observer, &timeouts()).unwrap();

        assert_eq!(outcome.entries, 2);
        assert_eq!(outcome.total_bytes, 285 + 7_233_931);
        assert_eq!(observer.entries.len(), 2);
        assert_eq!(observer.finished, Some(outcome));
    }

    #[test]
    fn prompt_without_entries_does_not_complete() {
        // The echoed command line carries the prompt prefix; with no
        // extraction output the monitor must keep waiting until it times out.
        let mut conn = connection("ap: tar -xtract tftp://10.0.0.2/fw.tar flash:\n");
        let err = await_transfer_complete(&mut conn, &mut NullObserver, &timeouts())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ConnectionError::Timeout(_))
        ));
    }

    #[test]
    fn device_reported_failure_halts() {
        let mut conn = connection(
            "extracting info (285 bytes)\n\
             %Error opening tftp://10.0.0.2/fw.tar (timed out)\n",
        );
        let err = await_transfer_complete(&mut conn, &mut NullObserver, &timeouts())
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedPrompt { .. }));
    }

    #[test]
    fn silence_mid_extraction_times_out() {
        let mut conn = connection("extracting info (285 bytes)\n");
        let err = await_transfer_complete(&mut conn, &mut NullObserver, &timeouts())
            .unwrap_err();
        match err {
            Error::Connection(ConnectionError::Timeout(step)) => {
                assert_eq!(step.command(), Some(CommandType::TarExtract))
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
