//! Classification of console output into device states.
//!
//! All knowledge about the text the 2702's ROMMON and IOS images print lives
//! here: the prompts, the extraction listing, the boot banner, and the lines
//! that indicate the procedure has gone off the rails.

use std::sync::LazyLock;

use regex::Regex;
use strum::Display;

/// Device state inferred from console output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[non_exhaustive]
pub enum PromptState {
    /// The `ap: ` bootloader prompt is ready for a command
    RommonReady,
    /// The device is extracting the firmware tar into flash
    Extracting,
    /// The extraction listing finished and the bootloader prompt returned.
    /// Never produced by [classify] directly; the transfer monitor infers it
    /// from a [PromptState::RommonReady] following at least one extraction
    /// entry.
    ExtractDone,
    /// The device is loading the boot image
    BootPending,
    /// The recovered IOS image is at its login prompt
    LoginReady,
    /// The device reported a failure
    Error,
}

// The prompt reaches us in two shapes: live, as a bare `ap: ` waiting at the
// end of the stream, and in captured transcripts, as the prefix of an echoed
// command line. Anchoring on the line start only matches both.
pub(crate) static RE_ROMMON_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^ap: ").unwrap());

pub(crate) static RE_EXTRACTING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^extracting (\S+) \((\d+) bytes\)").unwrap());

pub(crate) static RE_BOOT_LOADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^Loading "flash:"#).unwrap());

pub(crate) static RE_LOGIN_READY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^ap>|Press RETURN to get started").unwrap());

pub(crate) static RE_IOS_USER_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^ap>").unwrap());

pub(crate) static RE_IOS_PRIV_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^ap#").unwrap());

pub(crate) static RE_PASSWORD_PROMPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Password: ?").unwrap());

// Lines that indicate a genuine failure. `magic number mismatch` is listed
// here on purpose: the generic form is fatal, while the specific
// `bad mzip file` form printed while booting a w7 image is the documented
// benign anomaly and is filtered out by [is_benign] before these fire.
static RE_SUSPECT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)^boot: cannot load",
        r"magic number mismatch",
        r"(?mi)^%\s?error",
        r"(?i)no such file|file not found|permission denied",
        r"(?i)tftp.*(timed out|error|failed)",
        r"(?i)checksum (error|mismatch|verification fail)",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

const BENIGN_MZIP: &str = "magic number mismatch: bad mzip file";

/// The documented benign anomaly printed while booting, never an error.
pub fn is_benign(text: &str) -> bool {
    text.contains(BENIGN_MZIP)
}

pub(crate) fn suspect_patterns() -> &'static [Regex] {
    &RE_SUSPECT
}

/// An `extracting <path> (<n> bytes)` entry from the device's tar listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractEntry {
    pub path: String,
    pub bytes: u64,
}

pub fn parse_extract_entry(line: &str) -> Option<ExtractEntry> {
    let captures = RE_EXTRACTING.captures(line)?;
    Some(ExtractEntry {
        path: captures[1].to_string(),
        bytes: captures[2].parse().ok()?,
    })
}

/// Classify a single console line. Returns `None` for output that carries no
/// state information (boot chatter, environment listings, benign anomalies).
pub fn classify(line: &str) -> Option<PromptState> {
    if is_benign(line) {
        return None;
    }
    if RE_EXTRACTING.is_match(line) {
        return Some(PromptState::Extracting);
    }
    if RE_ROMMON_PROMPT.is_match(line) {
        return Some(PromptState::RommonReady);
    }
    if RE_BOOT_LOADING.is_match(line) {
        return Some(PromptState::BootPending);
    }
    if RE_LOGIN_READY.is_match(line) {
        return Some(PromptState::LoginReady);
    }
    if RE_SUSPECT.iter().any(|pattern| pattern.is_match(line)) {
        return Some(PromptState::Error);
    }
    None
}
