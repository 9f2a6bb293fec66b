//! One device-recovery attempt: its configuration and its live state.

use std::{
    net::Ipv4Addr,
    time::{Duration, SystemTime},
};

use crate::{
    command::{self, CommandType},
    error::Error,
    recovery::RecoveryStage,
};

/// The documented recovery default for the IOS enable prompt.
pub const DEFAULT_ENABLE_PASSWORD: &str = "Cisco";

/// Per-step deadlines. The extraction and boot waits are open-ended in the
/// documented procedure, so their defaults are generous and every field is
/// operator-overridable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for a prompt after a wake
    pub prompt: Duration,
    /// Ordinary commands (`set` family, subsystem inits)
    pub command: Duration,
    /// `flash_init`, which can take minutes on an unformatted filesystem
    pub flash_init: Duration,
    /// The whole TFTP pull and extraction
    pub extract: Duration,
    /// Longest tolerated silence during extraction
    pub extract_inactivity: Duration,
    /// `boot` until the recovered image reaches its login prompt
    pub boot: Duration,
    /// Login and privilege escalation
    pub login: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            prompt: CommandType::Wake.timeout(),
            command: CommandType::SetEnv.timeout(),
            flash_init: CommandType::FlashInit.timeout(),
            extract: CommandType::TarExtract.timeout(),
            extract_inactivity: command::EXTRACT_INACTIVITY_TIMEOUT,
            boot: CommandType::Boot.timeout(),
            login: CommandType::Enable.timeout(),
        }
    }
}

impl Timeouts {
    /// The same deadline everywhere; used by transcript replay, where a
    /// missing pattern should fail fast rather than wait out the live
    /// defaults.
    pub fn uniform(timeout: Duration) -> Self {
        Timeouts {
            prompt: timeout,
            command: timeout,
            flash_init: timeout,
            extract: timeout,
            extract_inactivity: timeout,
            boot: timeout,
            login: timeout,
        }
    }

    pub fn for_command(&self, command: CommandType) -> Duration {
        match command {
            CommandType::Wake => self.prompt,
            CommandType::FlashInit => self.flash_init,
            CommandType::TarExtract => self.extract,
            CommandType::Boot => self.boot,
            CommandType::Enable => self.login,
            _ => self.command,
        }
    }
}

/// Static parameters of a recovery attempt
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address assigned to the device in ROMMON
    pub ip_addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    /// TFTP server the device pulls the image from
    pub server: Ipv4Addr,
    /// Firmware tar filename served by the TFTP server
    pub filename: String,
    pub enable_password: String,
    pub timeouts: Timeouts,
}

impl SessionConfig {
    /// The `flash:` path of the bootable image inside the extracted tar.
    ///
    /// Cisco archives name the contained image directory after the tar with
    /// the `-tar.` marker replaced by the image variant, so
    /// `ap3g2-k9w7-tar.153-3.JF15.tar` extracts to
    /// `ap3g2-k9w7-mx.153-3.JF15/ap3g2-k9w7-mx.153-3.JF15`.
    pub fn boot_image(&self) -> Result<String, Error> {
        let stem = self
            .filename
            .strip_suffix(".tar")
            .ok_or_else(|| Error::InvalidFirmwareName(self.filename.clone()))?;

        if !stem.contains("-tar.") {
            return Err(Error::InvalidFirmwareName(self.filename.clone()));
        }
        let image = stem.replace("-tar.", "-mx.");

        Ok(format!("flash:/{image}/{image}"))
    }
}

/// The live state of one recovery attempt
#[derive(Debug)]
pub struct Session {
    pub config: SessionConfig,
    stage: RecoveryStage,
    step: usize,
    halted_at: Option<RecoveryStage>,
    started_at: SystemTime,
    finished_at: Option<SystemTime>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Session {
            config,
            stage: RecoveryStage::Init,
            step: 0,
            halted_at: None,
            started_at: SystemTime::now(),
            finished_at: None,
        }
    }

    pub fn stage(&self) -> RecoveryStage {
        self.stage
    }

    /// Index of the current step within the current stage's plan.
    pub fn step(&self) -> usize {
        self.step
    }

    /// The stage the procedure was in when it failed, if it has.
    pub fn halted_at(&self) -> Option<RecoveryStage> {
        self.halted_at
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<SystemTime> {
        self.finished_at
    }

    pub(crate) fn advance(&mut self, stage: RecoveryStage) {
        log::info!("recovery stage: {} -> {}", self.stage, stage);
        self.stage = stage;
        self.step = 0;
        if stage == RecoveryStage::Done {
            self.finished_at = Some(SystemTime::now());
        }
    }

    pub(crate) fn set_step(&mut self, step: usize) {
        self.step = step;
    }

    pub(crate) fn fail(&mut self) {
        self.halted_at = Some(self.stage);
        self.stage = RecoveryStage::Failed;
    }
}
