//! The property runner and check driver.
//!
//! A property is a closure over [`T`], the per-invocation context: it owns
//! the bit stream for the duration of the run, counts draws, carries the
//! failure flag, and tears down cleanups and the cancellation token when the
//! invocation ends. [`run_once`] classifies one invocation as pass, invalid,
//! or failure; [`check`] is the outer loop that hunts for a counterexample,
//! shrinks it, and reports it through the host framework.

use std::cell::{Cell, RefCell};
use std::env;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::data::{BitStream, BufBitStream, RandomBitStream};
use crate::errors::{self, traceback_of, TestError};
use crate::generator::Generator;
use crate::persist::{fail_file_name, load_fail_file, save_fail_file, FAIL_FILE_VERSION};
use crate::shrink::shrink;

pub(crate) const INVALID_CHECKS_MULT: usize = 10;
pub(crate) const EXAMPLE_MAX_TRIES: usize = 1000;

/// Host test framework contract. The driver reports through this interface
/// and never prints directly; the host must serialize its own `helper` and
/// `logf` calls per test.
pub trait Tb {
    fn name(&self) -> String;
    fn helper(&self) {}
    fn logf(&self, args: fmt::Arguments<'_>);
    fn errorf(&self, args: fmt::Arguments<'_>);
    fn fatalf(&self, args: fmt::Arguments<'_>) -> !;
    fn failed(&self) -> bool;
}

/// Plain implementation of [`Tb`] over standard error, used by [`check`].
pub struct StdTb {
    name: String,
    failed: Cell<bool>,
}

impl StdTb {
    pub fn new(name: impl Into<String>) -> StdTb {
        StdTb {
            name: name.into(),
            failed: Cell::new(false),
        }
    }
}

impl Tb for StdTb {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn logf(&self, args: fmt::Arguments<'_>) {
        eprintln!("{}", args);
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        self.failed.set(true);
        eprintln!("{}", args);
    }

    fn fatalf(&self, args: fmt::Arguments<'_>) -> ! {
        self.failed.set(true);
        panic!("{}", args);
    }

    fn failed(&self) -> bool {
        self.failed.get()
    }
}

/// Driver configuration, overridable from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of valid test cases required for a pass.
    pub checks: usize,
    /// Fixed starting seed; random when unset.
    pub seed: Option<u64>,
    /// Wall-clock budget for test case minimization.
    pub shrink_time: Duration,
    /// Fail file to replay instead of generating fresh test cases.
    pub fail_file: Option<PathBuf>,
    /// Do not persist fail files on failure.
    pub no_fail_file: bool,
    /// Log each test case and draw.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            checks: 100,
            seed: None,
            shrink_time: Duration::from_secs(30),
            fail_file: None,
            no_fail_file: false,
            verbose: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Config {
        let mut cfg = Config::default();
        if let Some(n) = env_parse("TAPECHECK_CHECKS") {
            cfg.checks = n;
        }
        if let Some(n) = env_parse("TAPECHECK_SEED") {
            cfg.seed = Some(n);
        }
        if let Some(secs) = env_parse("TAPECHECK_SHRINKTIME") {
            cfg.shrink_time = Duration::from_secs(secs);
        }
        if let Ok(path) = env::var("TAPECHECK_FAILFILE") {
            cfg.fail_file = Some(PathBuf::from(path));
        }
        cfg.no_fail_file = env::var_os("TAPECHECK_NOFAILFILE").is_some();
        cfg.verbose = env::var_os("TAPECHECK_VERBOSE").is_some();
        cfg
    }
}

fn env_parse<N: std::str::FromStr>(key: &str) -> Option<N> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Cancellation signal scoped to one property invocation; cancelled when the
/// invocation ends, however it ends.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// LIFO cleanup stack shared between [`T`] and cleanup closures, so a
/// cleanup may register further cleanups and still have them run.
#[derive(Clone, Default)]
pub struct Cleanups(Rc<RefCell<Vec<Box<dyn FnOnce()>>>>);

impl Cleanups {
    pub fn push(&self, f: impl FnOnce() + 'static) {
        self.0.borrow_mut().push(Box::new(f));
    }

    fn run_all(&self) {
        loop {
            let f = self.0.borrow_mut().pop();
            match f {
                Some(f) => f(),
                None => break,
            }
        }
    }
}

/// Per-invocation property context.
///
/// Created fresh for each property invocation and torn down when it ends;
/// the bit stream and draw counter are exclusively owned by the current
/// evaluation.
pub struct T<'a> {
    tb: Option<&'a dyn Tb>,
    s: &'a mut dyn BitStream,
    verbose: bool,
    draws: usize,
    ref_draws: Vec<String>,
    failure: Option<String>,
    cleanups: Cleanups,
    cancel: CancelToken,
}

impl<'a> T<'a> {
    pub(crate) fn new(
        tb: Option<&'a dyn Tb>,
        s: &'a mut dyn BitStream,
        verbose: bool,
        ref_draws: Vec<String>,
    ) -> T<'a> {
        T {
            tb,
            s,
            verbose,
            draws: 0,
            ref_draws,
            failure: None,
            cleanups: Cleanups::default(),
            cancel: CancelToken::default(),
        }
    }

    pub fn name(&self) -> String {
        match self.tb {
            Some(tb) => tb.name(),
            None => "tapecheck test".to_string(),
        }
    }

    /// Frame-skip hint, forwarded to the host framework.
    pub fn helper(&self) {
        if let Some(tb) = self.tb {
            tb.helper();
        }
    }

    /// The bit stream owned by this invocation, for generator
    /// implementations that sample it directly.
    pub fn bit_stream(&mut self) -> &mut dyn BitStream {
        self.s
    }

    pub(crate) fn bs(&mut self) -> &mut dyn BitStream {
        self.s
    }

    pub(crate) fn begin_group(&mut self, label: &str, standalone: bool) -> usize {
        self.s.begin_group(label, standalone)
    }

    pub(crate) fn end_group(&mut self, id: usize, discard: bool) {
        self.s.end_group(id, discard);
    }

    /// Draw a value from `g`, logging it and comparing it against the
    /// expected reference draws when those were supplied.
    pub fn draw<V: fmt::Debug + 'static>(&mut self, g: &Generator<V>, label: &str) -> V {
        let v = g.value(self);

        if !self.ref_draws.is_empty() {
            let repr = format!("{:?}", v);
            match self.ref_draws.get(self.draws) {
                Some(expected) if *expected == repr => {}
                Some(expected) => self.audit_fail(format_args!(
                    "[tapecheck] draw {} differs: {} vs expected {}",
                    self.draws, repr, expected
                )),
                None => self.audit_fail(format_args!(
                    "[tapecheck] unexpected draw {}: {}",
                    self.draws, repr
                )),
            }
        }

        if self.verbose {
            if label.is_empty() {
                self.logf(format_args!("[tapecheck] draw #{}: {:?}", self.draws, v));
            } else {
                self.logf(format_args!("[tapecheck] draw {}: {:?}", label, v));
            }
        }

        self.draws += 1;
        v
    }

    fn audit_fail(&self, args: fmt::Arguments<'_>) -> ! {
        match self.tb {
            Some(tb) => {
                tb.helper();
                tb.fatalf(args)
            }
            None => panic!("{}", args),
        }
    }

    pub fn logf(&self, args: fmt::Arguments<'_>) {
        if !self.verbose {
            return;
        }
        match self.tb {
            Some(tb) => {
                tb.helper();
                tb.logf(args);
            }
            None => debug!("{}", args),
        }
    }

    pub fn log(&self, msg: impl fmt::Display) {
        self.logf(format_args!("{}", msg));
    }

    /// Mark the current test case as invalid and abandon it. Too many
    /// skipped cases fail the check for inability to generate valid tests.
    pub fn skip(&self, msg: impl fmt::Display) -> ! {
        let msg = msg.to_string();
        self.log(&msg);
        errors::raise_invalid_data(msg)
    }

    pub fn skip_now(&self) -> ! {
        errors::raise_invalid_data("skip_now called".to_string())
    }

    /// Fail the test case and keep running the property.
    pub fn error(&mut self, msg: impl fmt::Display) {
        self.helper();
        self.fail(false, msg.to_string())
    }

    /// Fail the test case and stop the property immediately.
    pub fn fatal(&mut self, msg: impl fmt::Display) -> ! {
        self.helper();
        self.fail(true, msg.to_string());
        unreachable!()
    }

    pub fn fail_now(&mut self) -> ! {
        self.fail(true, "fail_now called".to_string());
        unreachable!()
    }

    pub fn fail(&mut self, now: bool, msg: String) {
        self.failure = Some(msg.clone());
        if now {
            errors::raise_stop_test(msg);
        }
    }

    pub fn failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Register a cleanup; cleanups run in reverse registration order when
    /// the invocation ends, pass or fail.
    pub fn cleanup(&self, f: impl FnOnce() + 'static) {
        self.cleanups.push(f);
    }

    /// Handle to the cleanup stack, for registering cleanups from within a
    /// cleanup.
    pub fn cleanups(&self) -> Cleanups {
        self.cleanups.clone()
    }

    /// Token cancelled when this invocation ends, for cooperating user code.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn teardown(&mut self) {
        self.cancel.cancel();
        self.cleanups.run_all();
    }

    fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }
}

/// Run the property once against the given stream, classifying the outcome:
/// `None` for a pass, otherwise the captured error.
pub fn run_once(s: &mut dyn BitStream, prop: impl Fn(&mut T<'_>)) -> Option<TestError> {
    let mut t = T::new(None, s, false, Vec::new());
    check_once(&mut t, &prop)
}

/// Replay a property against a fixed tape.
pub fn replay(buf: &[u64], prop: impl Fn(&mut T<'_>)) -> Option<TestError> {
    let mut s = BufBitStream::new(buf.to_vec(), false);
    run_once(&mut s, prop)
}

pub(crate) fn check_once(t: &mut T<'_>, prop: &dyn Fn(&mut T<'_>)) -> Option<TestError> {
    t.helper();
    let res = {
        let _guard = errors::capture_panics();
        catch_unwind(AssertUnwindSafe(|| prop(t)))
    };
    t.teardown();

    match res {
        // a quiet failure surfaces here, once the property has returned, so
        // its traceback is the same no matter where in the property the
        // failure was recorded
        Ok(()) => t
            .take_failure()
            .map(|msg| TestError::stop_test(msg, errors::capture_here())),
        Err(payload) => Some(TestError::from_panic(payload)),
    }
}

/// Check the property against `cfg.checks` fresh test cases, shrinking and
/// reporting the first counterexample found. Panics (through
/// [`Tb::fatalf`]) if the property fails.
pub fn check(name: &str, prop: impl Fn(&mut T<'_>)) {
    let tb = StdTb::new(name);
    check_tb(&tb, &Config::from_env(), prop);
}

pub fn check_with(name: &str, cfg: &Config, prop: impl Fn(&mut T<'_>)) {
    let tb = StdTb::new(name);
    check_tb(&tb, cfg, prop);
}

/// [`check`] against an arbitrary host framework.
pub fn check_tb(tb: &dyn Tb, cfg: &Config, prop: impl Fn(&mut T<'_>)) {
    tb.helper();

    let start = Instant::now();
    let outcome = do_check(tb, cfg, &prop);
    let dt = start.elapsed();

    match outcome {
        CheckOutcome::Passed { valid, invalid } => {
            if valid >= cfg.checks {
                if cfg.verbose {
                    tb.logf(format_args!(
                        "[tapecheck] OK, passed {} tests ({:?})",
                        valid, dt
                    ));
                }
            } else {
                tb.errorf(format_args!(
                    "[tapecheck] only generated {} valid tests from {} total ({:?})",
                    valid,
                    valid + invalid,
                    dt
                ));
            }
        }
        CheckOutcome::Failed(fail) => report_failure(tb, cfg, &prop, &fail),
    }

    if tb.failed() {
        tb.fatalf(format_args!("[tapecheck] {} failed", tb.name()));
    }
}

pub(crate) enum CheckOutcome {
    Passed { valid: usize, invalid: usize },
    Failed(Box<CheckFailure>),
}

pub(crate) struct CheckFailure {
    pub seed: u64,
    pub valid: usize,
    pub buf: Vec<u64>,
    pub err1: TestError,
    pub err2: Option<TestError>,
    pub from_file: Option<PathBuf>,
}

impl CheckFailure {
    pub(crate) fn reproduced(&self) -> Option<&TestError> {
        match &self.err2 {
            Some(e2) if e2.same(&self.err1) => Some(e2),
            _ => None,
        }
    }
}

pub(crate) fn do_check(tb: &dyn Tb, cfg: &Config, prop: &dyn Fn(&mut T<'_>)) -> CheckOutcome {
    tb.helper();
    assert!(
        !tb.failed(),
        "check called with a test that has already failed"
    );

    if let Some(path) = &cfg.fail_file {
        if let Some(fail) = check_fail_file(tb, cfg, path.clone(), prop) {
            return CheckOutcome::Failed(Box::new(fail));
        }
    }

    let seed0 = cfg.seed.unwrap_or_else(rand::random);
    let (seed, valid, invalid, err1) = find_bug(tb, cfg, seed0, prop);
    let err1 = match err1 {
        None => return CheckOutcome::Passed { valid, invalid },
        Some(e) => e,
    };

    let mut s = RandomBitStream::new(seed, true);
    let err2 = {
        let mut t = T::new(Some(tb), &mut s, cfg.verbose, Vec::new());
        t.logf(format_args!("[tapecheck] trying to reproduce the failure"));
        check_once(&mut t, prop)
    };
    let rec = s.take_record();

    match err2 {
        Some(err2) if err2.same(&err1) => {
            debug!("[tapecheck] trying to minimize the failing test case");
            let deadline = Instant::now() + cfg.shrink_time;
            let (buf, err3) = shrink(rec, err2.clone(), prop, deadline);
            CheckOutcome::Failed(Box::new(CheckFailure {
                seed,
                valid,
                buf,
                err1: err2,
                err2: Some(err3),
                from_file: None,
            }))
        }
        other => CheckOutcome::Failed(Box::new(CheckFailure {
            seed,
            valid,
            buf: rec.data,
            err1,
            err2: other,
            from_file: None,
        })),
    }
}

fn find_bug(
    tb: &dyn Tb,
    cfg: &Config,
    mut seed: u64,
    prop: &dyn Fn(&mut T<'_>),
) -> (u64, usize, usize, Option<TestError>) {
    tb.helper();

    let mut s = RandomBitStream::new(0, false);
    let mut valid = 0;
    let mut invalid = 0;

    while valid < cfg.checks && invalid < cfg.checks * INVALID_CHECKS_MULT {
        seed = seed.wrapping_add((valid + invalid) as u64);
        s.init(seed);

        let err = {
            let mut t = T::new(Some(tb), &mut s, cfg.verbose, Vec::new());
            t.logf(format_args!(
                "[tapecheck] test #{} start (seed {})",
                valid + invalid + 1,
                seed
            ));
            check_once(&mut t, prop)
        };

        match err {
            None => valid += 1,
            Some(e) if e.is_invalid_data() => {
                debug!("[tapecheck] test #{} invalid: {}", valid + invalid + 1, e);
                invalid += 1;
            }
            Some(e) => {
                debug!("[tapecheck] test #{} failed: {}", valid + invalid + 1, e);
                return (seed, valid, invalid, Some(e));
            }
        }
    }

    (0, valid, invalid, None)
}

fn check_fail_file(
    tb: &dyn Tb,
    cfg: &Config,
    path: PathBuf,
    prop: &dyn Fn(&mut T<'_>),
) -> Option<CheckFailure> {
    tb.helper();

    let (version, seed, buf) = match load_fail_file(&path) {
        Ok(parts) => parts,
        Err(e) => {
            tb.logf(format_args!("[tapecheck] ignoring fail file: {}", e));
            return None;
        }
    };
    if version != FAIL_FILE_VERSION {
        tb.logf(format_args!(
            "[tapecheck] ignoring fail file: version {:?} differs from {:?}",
            version, FAIL_FILE_VERSION
        ));
        return None;
    }

    let err1 = {
        let mut s = BufBitStream::new(buf.clone(), false);
        let mut t = T::new(Some(tb), &mut s, cfg.verbose, Vec::new());
        check_once(&mut t, prop)
    };
    let err1 = match err1 {
        None => return None,
        Some(e) if e.is_invalid_data() => {
            tb.logf(format_args!(
                "[tapecheck] fail file {:?} is no longer valid",
                path
            ));
            return None;
        }
        Some(e) => e,
    };

    let err2 = {
        let mut s = BufBitStream::new(buf.clone(), false);
        let mut t = T::new(Some(tb), &mut s, cfg.verbose, Vec::new());
        t.logf(format_args!("[tapecheck] trying to reproduce the failure"));
        check_once(&mut t, prop)
    };

    Some(CheckFailure {
        seed,
        valid: 0,
        buf,
        err1,
        err2,
        from_file: Some(path),
    })
}

fn report_failure(tb: &dyn Tb, cfg: &Config, prop: &dyn Fn(&mut T<'_>), fail: &CheckFailure) {
    tb.helper();

    let mut repro = format!("TAPECHECK_SEED={}", fail.seed);
    if let Some(path) = &fail.from_file {
        repro = format!("TAPECHECK_FAILFILE={}", path.display());
    } else if !cfg.no_fail_file {
        let output = capture_test_output(tb.name(), prop, &fail.buf);
        let (_dir, path) = fail_file_name(&tb.name());
        match save_fail_file(&path, FAIL_FILE_VERSION, &output, fail.seed, &fail.buf) {
            Ok(()) => {
                repro = format!(
                    "TAPECHECK_FAILFILE={} (or TAPECHECK_SEED={})",
                    path.display(),
                    fail.seed
                );
            }
            Err(e) => tb.logf(format_args!("[tapecheck] {}", e)),
        }
    }

    match fail.reproduced() {
        Some(err) if err.is_stop_test() => {
            tb.errorf(format_args!(
                "[tapecheck] failed after {} tests: {}\nTo reproduce, set {}\nFailed test output:",
                fail.valid, err, repro
            ));
        }
        Some(err) => {
            tb.errorf(format_args!(
                "[tapecheck] panic after {} tests: {}\nTo reproduce, set {}\nTraceback:\n{}Failed test output:",
                fail.valid, err, repro, err.traceback
            ));
        }
        None => {
            tb.errorf(format_args!(
                "[tapecheck] flaky test, can not reproduce a failure\nTo try to reproduce, set {}\nTraceback ({}):\n{}Original traceback ({}):\n{}Failed test output:",
                repro,
                fail.err2.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                traceback_of(fail.err2.as_ref()),
                fail.err1,
                fail.err1.traceback
            ));
        }
    }

    // replay the minimal test case with draw logging, so the report carries
    // the labeled draw sequence
    let mut s = BufBitStream::new(fail.buf.clone(), false);
    let mut t = T::new(Some(tb), &mut s, true, Vec::new());
    let _ = check_once(&mut t, prop);
}

fn capture_test_output(name: String, prop: &dyn Fn(&mut T<'_>), buf: &[u64]) -> Vec<u8> {
    let out = BufLogTb {
        name,
        out: RefCell::new(String::new()),
    };
    let mut s = BufBitStream::new(buf.to_vec(), false);
    let mut t = T::new(Some(&out), &mut s, true, Vec::new());
    let _ = check_once(&mut t, prop);
    out.out.into_inner().into_bytes()
}

// Log-collecting host used to embed the failing run's output into the fail
// file.
struct BufLogTb {
    name: String,
    out: RefCell<String>,
}

impl Tb for BufLogTb {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn logf(&self, args: fmt::Arguments<'_>) {
        let mut out = self.out.borrow_mut();
        out.push_str(&args.to_string());
        out.push('\n');
    }

    fn errorf(&self, args: fmt::Arguments<'_>) {
        self.logf(args);
    }

    fn fatalf(&self, args: fmt::Arguments<'_>) -> ! {
        panic!("{}", args);
    }

    fn failed(&self) -> bool {
        false
    }
}
