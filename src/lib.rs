//! Property-based testing with a recorded bit-stream tape and structural
//! shrinking.
//!
//! A property is a closure over [`T`] that draws values from composable
//! [`Generator`]s and fails when it finds its inputs wrong. [`check`] hunts
//! for a counterexample across many seeded runs; when one is found, every
//! random choice the generators made is already recorded as a span of a
//! tape of 64-bit draws, annotated with labeled groups. The shrinker
//! rewrites that tape — deleting standalone groups, minimizing single words
//! — and replays the property until no smaller tape reproduces the same
//! failure. The result is reported with its seed and persisted as a fail
//! file for replay.
//!
//! ```no_run
//! use tapecheck::{check, collections::vec_of, integers::i64s};
//!
//! check("reverse twice is identity", |t| {
//!     let v = vec_of(i64s()).draw(t, "v");
//!     let mut w = v.clone();
//!     w.reverse();
//!     w.reverse();
//!     assert_eq!(v, w);
//! });
//! ```

pub mod collections;
pub mod combinators;
pub mod data;
pub mod distributions;
mod engine;
mod errors;
pub mod generator;
pub mod integers;
mod persist;
mod rng;
mod shrink;

pub use combinators::{custom, deferred, just, one_of, option_of, sampled_from, AnyValue};
pub use data::{BitStream, BufBitStream, GroupInfo, RandomBitStream, RecordedBits};
pub use engine::{
    check, check_tb, check_with, replay, run_once, CancelToken, Cleanups, Config, StdTb, Tb, T,
};
pub use errors::{ErrorKind, TestError};
pub use generator::{Generator, GeneratorImpl};
pub use persist::{fail_file_name, load_fail_file, save_fail_file, PersistError, FAIL_FILE_VERSION};
pub use rng::Jsf64;
pub use shrink::shrink;

/// Bounded retry count shared by filters, custom generators, and the small
/// linear scan of the single-word minimizer.
pub(crate) const SMALL: usize = 5;
