//! Fail-file persistence.
//!
//! A fail file pins down one failing test case: the captured test output as
//! comment lines, a format version, the originating seed, and the minimized
//! tape. The driver writes one on failure and replays it on the next run
//! when pointed at it; files with an unknown version are ignored rather than
//! rejected, so stale files from older releases cannot break a test run.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub const FAIL_FILE_VERSION: &str = "tapecheck-v1";

const FAIL_FILE_DIR: &str = "testdata/tapecheck";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed fail file: {0}")]
    Malformed(String),
}

/// Directory and file name for a fresh fail file for `test_name`.
pub fn fail_file_name(test_name: &str) -> (PathBuf, PathBuf) {
    let dir = PathBuf::from(FAIL_FILE_DIR);

    let sanitized: String = test_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let file = dir.join(format!("{}-{}-{}.fail", sanitized, secs, std::process::id()));

    (dir, file)
}

/// Write a fail file, creating its directory as needed. The write goes to a
/// temporary file first and is renamed into place.
pub fn save_fail_file(
    path: &Path,
    version: &str,
    output: &[u8],
    seed: u64,
    buf: &[u64],
) -> Result<(), PersistError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let mut content = Vec::new();
    for line in String::from_utf8_lossy(output).lines() {
        writeln!(content, "# {}", line)?;
    }
    writeln!(content, "{}", version)?;
    writeln!(content, "{:#x}", seed)?;
    let words: Vec<String> = buf.iter().map(|w| format!("{:#x}", w)).collect();
    writeln!(content, "{}", words.join(" "))?;

    let tmp = path.with_extension("fail.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

/// Read a fail file back: `(version, seed, tape)`. The caller decides what
/// to do about a version it does not recognize.
pub fn load_fail_file(path: &Path) -> Result<(String, u64, Vec<u64>), PersistError> {
    let content = fs::read_to_string(path)?;

    let mut lines = content.lines().filter(|l| !l.starts_with('#'));

    let version = lines
        .next()
        .ok_or_else(|| PersistError::Malformed("missing version line".to_string()))?
        .to_string();
    let seed_line = lines
        .next()
        .ok_or_else(|| PersistError::Malformed("missing seed line".to_string()))?;
    let seed = parse_word(seed_line)?;

    let buf = match lines.next() {
        None | Some("") => Vec::new(),
        Some(tape_line) => tape_line
            .split_whitespace()
            .map(parse_word)
            .collect::<Result<Vec<u64>, _>>()?,
    };

    Ok((version, seed, buf))
}

fn parse_word(s: &str) -> Result<u64, PersistError> {
    let hex = s
        .strip_prefix("0x")
        .ok_or_else(|| PersistError::Malformed(format!("expected hex word, got {:?}", s)))?;
    u64::from_str_radix(hex, 16)
        .map_err(|e| PersistError::Malformed(format!("bad word {:?}: {}", s, e)))
}
