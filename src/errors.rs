//! Test error representation and panic plumbing.
//!
//! The engine distinguishes three kinds of failure. `InvalidData` means the
//! current attempt cannot proceed (an exhausted filter, an over-rejecting
//! repeat, a replay buffer under-run) and is never a user-visible failure on
//! its own. `StopTest` means the property decided to fail. Everything else is
//! a plain panic from user or library code.
//!
//! `InvalidData` and `StopTest` travel as panic payloads and are caught at a
//! small set of boundaries: filter and custom-generator retries translate
//! `InvalidData` into a rejected attempt, and [`crate::engine::run_once`]
//! catches everything at the outermost property frame. True user panics
//! traverse the engine untouched.
//!
//! Error identity — the equivalence class the shrinker preserves — is the
//! triple of kind, message, and normalized traceback.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic;

use once_cell::sync::Lazy;

pub(crate) const TRACEBACK_LEN: usize = 32;

/// Panic payload for "skip this attempt".
pub(crate) struct InvalidData(pub String);

/// Panic payload for "the property failed".
pub(crate) struct StopTest(pub String);

pub(crate) fn raise_invalid_data(msg: String) -> ! {
    panic::panic_any(InvalidData(msg))
}

pub(crate) fn raise_stop_test(msg: String) -> ! {
    panic::panic_any(StopTest(msg))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidData,
    StopTest,
    Panic,
}

/// A classified property failure, with enough identity for the shrinker to
/// tell "the same bug" from "a different bug".
#[derive(Debug, Clone)]
pub struct TestError {
    pub kind: ErrorKind,
    pub message: String,
    pub traceback: String,
}

impl TestError {
    pub fn is_invalid_data(&self) -> bool {
        self.kind == ErrorKind::InvalidData
    }

    pub fn is_stop_test(&self) -> bool {
        self.kind == ErrorKind::StopTest
    }

    /// Identity comparison: kind, message and normalized traceback must all
    /// agree.
    pub fn same(&self, other: &TestError) -> bool {
        self.kind == other.kind
            && self.message == other.message
            && self.traceback == other.traceback
    }

    pub(crate) fn stop_test(message: String, traceback: String) -> TestError {
        TestError {
            kind: ErrorKind::StopTest,
            message,
            traceback,
        }
    }

    /// Classify a payload caught by `catch_unwind`, attaching the traceback
    /// recorded by the panic hook.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> TestError {
        let traceback = take_captured_traceback();

        let (kind, message) = if let Some(InvalidData(msg)) = payload.downcast_ref::<InvalidData>()
        {
            (ErrorKind::InvalidData, msg.clone())
        } else if let Some(StopTest(msg)) = payload.downcast_ref::<StopTest>() {
            (ErrorKind::StopTest, msg.clone())
        } else if let Some(msg) = payload.downcast_ref::<&'static str>() {
            (ErrorKind::Panic, (*msg).to_string())
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            (ErrorKind::Panic, msg.clone())
        } else {
            (ErrorKind::Panic, "<non-string panic payload>".to_string())
        };

        TestError {
            kind,
            message,
            traceback,
        }
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ErrorKind::InvalidData => write!(f, "invalid data: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for TestError {}

/// Render `err` for the flaky-failure report, where one of the two runs may
/// not have failed at all.
pub(crate) fn traceback_of(err: Option<&TestError>) -> &str {
    match err {
        Some(e) => &e.traceback,
        None => "    <no error>\n",
    }
}

// Traceback capture.
//
// A process-wide panic hook records a normalized backtrace into a
// thread-local slot whenever a panic unwinds while a property is being run on
// the current thread. The default hook keeps handling panics on all other
// threads, and on this thread outside of property runs.

thread_local! {
    static CAPTURE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static LAST_TRACEBACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Lazy<()> = Lazy::new(|| {
    let prev = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if CAPTURE_DEPTH.with(|d| d.get()) > 0 {
            let bt = Backtrace::force_capture();
            let tb = normalize_traceback(&bt.to_string());
            LAST_TRACEBACK.with(|l| *l.borrow_mut() = Some(tb));
        } else {
            prev(info);
        }
    }));
});

pub(crate) struct CaptureGuard(());

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURE_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

/// Arm panic capture on this thread for the duration of the returned guard.
pub(crate) fn capture_panics() -> CaptureGuard {
    Lazy::force(&HOOK);
    CAPTURE_DEPTH.with(|d| d.set(d.get() + 1));
    CaptureGuard(())
}

pub(crate) fn take_captured_traceback() -> String {
    LAST_TRACEBACK
        .with(|l| l.borrow_mut().take())
        .unwrap_or_else(|| "    <no traceback>\n".to_string())
}

/// Capture and normalize a traceback of the current call stack. The runner
/// uses this for quiet failures, which surface only after the property
/// returns; captured there, the traceback does not depend on where inside
/// the property the failure was recorded.
pub(crate) fn capture_here() -> String {
    normalize_traceback(&Backtrace::force_capture().to_string())
}

// Frames stripped from the top of a traceback: panic and backtrace
// machinery, plus the engine's own raise/fail plumbing.
const SPECIAL_PREFIXES: &[&str] = &[
    "std::",
    "core::",
    "rust_begin_unwind",
    "rust_panic",
    "__rust",
    "___rust",
    "backtrace::",
    "tapecheck::errors",
    "tapecheck::engine::T",
];

// The frame marking the outermost property invocation; nothing below it
// belongs to the failure. Every run of a property goes through this frame
// and no other driver frames sit above it, so cutting here makes tracebacks
// comparable between the bug-finding loop and shrink replays.
const TRACEBACK_STOP: &str = "check_once";

/// Reduce a `Backtrace` rendering to a canonical multi-line string: strip
/// runtime and engine plumbing from the top, strip symbol hashes, cut at the
/// property-runner frame, cap the frame count.
pub(crate) fn normalize_traceback(raw: &str) -> String {
    let mut frames: Vec<(String, Option<String>)> = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                if last.1.is_none() {
                    last.1 = Some(rest.to_string());
                }
            }
        } else if let Some(colon) = trimmed.find(": ") {
            if trimmed[..colon].chars().all(|c| c.is_ascii_digit()) {
                let symbol = strip_symbol_hash(&trimmed[colon + 2..]);
                frames.push((symbol, None));
            }
        }
    }

    let mut out = String::new();
    let mut skip_special = true;
    let mut count = 0;

    for (symbol, loc) in frames {
        if skip_special && SPECIAL_PREFIXES.iter().any(|p| symbol.starts_with(p)) {
            continue;
        }
        skip_special = false;

        if symbol.contains(TRACEBACK_STOP) || count == TRACEBACK_LEN {
            break;
        }

        match loc {
            Some(loc) => {
                out.push_str("    ");
                out.push_str(&loc);
                out.push_str(" in ");
            }
            None => out.push_str("    <unknown> in "),
        }
        out.push_str(&symbol);
        out.push('\n');
        count += 1;
    }

    out
}

// Symbols come out of the backtrace as `path::to::fn::h0123456789abcdef`;
// the hash changes between builds and carries no identity.
fn strip_symbol_hash(symbol: &str) -> String {
    if let Some(pos) = symbol.rfind("::h") {
        let tail = &symbol[pos + 3..];
        if tail.len() == 16 && tail.chars().all(|c| c.is_ascii_hexdigit()) {
            return symbol[..pos].to_string();
        }
    }
    symbol.to_string()
}
