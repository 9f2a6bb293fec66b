//! Session transcript capture.
//!
//! Everything the device prints is appended here exactly as received; the
//! transcript is the only artifact the tool produces and the first thing an
//! operator reaches for when a recovery halts. A saved transcript can be fed
//! back through the whole stack with [ReplayPort](crate::ReplayPort).

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use crate::error::Error;

#[derive(Default)]
pub struct Transcript {
    captured: String,
    sink: Option<File>,
    path: Option<PathBuf>,
}

impl Transcript {
    /// Capture in memory only.
    pub fn in_memory() -> Self {
        Transcript::default()
    }

    /// Capture in memory and tee every chunk to `path`.
    pub fn to_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let sink = File::create(path)
            .map_err(|e| Error::FileOpenError(path.display().to_string(), e))?;

        Ok(Transcript {
            captured: String::new(),
            sink: Some(sink),
            path: Some(path.to_path_buf()),
        })
    }

    /// Append raw console output as received.
    pub fn append(&mut self, bytes: &[u8]) {
        self.captured.push_str(&String::from_utf8_lossy(bytes));
        if let Some(sink) = self.sink.as_mut() {
            // A transcript chunk that cannot be written must not kill the
            // recovery; the in-memory capture still has it.
            if let Err(e) = sink.write_all(bytes).and_then(|_| sink.flush()) {
                log::warn!("failed to write transcript chunk: {e}");
            }
        }
    }

    pub fn contents(&self) -> &str {
        &self.captured
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read a previously saved transcript for replay.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
        let path = path.as_ref();
        fs::read(path).map_err(|e| Error::FileOpenError(path.display().to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_appended_output() {
        let mut transcript = Transcript::in_memory();
        transcript.append(b"ap: ");
        transcript.append(b"tftp_init\n");

        assert_eq!(transcript.contents(), "ap: tftp_init\n");
        assert!(transcript.path().is_none());
    }

    #[test]
    fn tees_output_to_a_file() {
        let dir = std::env::temp_dir().join("apflash-transcript-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("session.log");

        let mut transcript = Transcript::to_file(&path).unwrap();
        transcript.append(b"extracting info (285 bytes)\n");
        drop(transcript);

        assert_eq!(Transcript::load(&path).unwrap(), b"extracting info (285 bytes)\n");
        fs::remove_dir_all(&dir).ok();
    }
}
