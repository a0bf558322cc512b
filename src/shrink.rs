//! Structural test case minimization.
//!
//! Starting from a failing recorded tape, the shrinker proposes
//! lexicographically smaller tapes — first by deleting whole standalone
//! groups, then by minimizing individual words — and keeps every candidate
//! that still reproduces the original failure. Candidates are replayed
//! twice: once to check the failure identity, and once recording, because a
//! smaller tape can drive the generators down cheaper paths that consume
//! even less than proposed. The recorded, pruned tape is what is actually
//! adopted.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Instant;

use byteorder::{BigEndian, WriteBytesExt};
use log::debug;

use crate::data::{bit_len, BufBitStream, RecordedBits};
use crate::engine::{check_once, T};
use crate::errors::{ErrorKind, TestError};
use crate::SMALL;

/// Shrink `rec` to a locally minimal tape that still fails with the identity
/// of `err`, within the wall-clock `deadline`. Returns the minimized tape
/// and the error of its last reproduction.
pub fn shrink(
    mut rec: RecordedBits,
    err: TestError,
    prop: &dyn Fn(&mut T<'_>),
    deadline: Instant,
) -> (Vec<u64>, TestError) {
    rec.prune();

    let shrinker = Shrinker {
        rec,
        err,
        prop,
        deadline,
        tries: 0,
        shrinks: 0,
        hits: 0,
        cache: HashSet::new(),
        flaky: None,
    };

    shrinker.run()
}

struct Shrinker<'p> {
    rec: RecordedBits,
    err: TestError,
    prop: &'p dyn Fn(&mut T<'_>),
    deadline: Instant,
    tries: usize,
    shrinks: usize,
    hits: usize,
    cache: HashSet<Vec<u8>>,
    flaky: Option<TestError>,
}

impl Shrinker<'_> {
    fn run(mut self) -> (Vec<u64>, TestError) {
        let mut rounds = 0;
        let mut last_shrinks = None;

        while self.flaky.is_none()
            && last_shrinks != Some(self.shrinks)
            && Instant::now() < self.deadline
        {
            last_shrinks = Some(self.shrinks);
            debug!("[shrink] round {} start", rounds);
            self.remove_groups();
            self.minimize_blocks();
            rounds += 1;
        }
        debug!(
            "[shrink] done, {} rounds total ({} tries, {} shrinks, {} cache hits)",
            rounds, self.tries, self.shrinks, self.hits
        );

        match self.flaky {
            Some(flaky) => (self.rec.data, flaky),
            None => (self.rec.data, self.err),
        }
    }

    /// Propose the current tape with each standalone group excised.
    /// Acceptance replaces the group list, so the same index is retried
    /// against the shifted list.
    fn remove_groups(&mut self) {
        let mut i = 0;
        while i < self.rec.groups.len() {
            let g = self.rec.groups[i].clone();
            if let (true, Some(end)) = (g.standalone, g.end) {
                debug!(
                    "[shrink] try removing group {:?} at {}: [{}, {})",
                    g.label, i, g.begin, end
                );
                if self.accept(without(&self.rec.data, g.begin, end)) {
                    continue;
                }
            }
            i += 1;
        }
    }

    fn minimize_blocks(&mut self) {
        let mut i = 0;
        while i < self.rec.data.len() {
            let u = self.rec.data[i];
            minimize(u, &mut |x| {
                let mut buf = self.rec.data.clone();
                if i >= buf.len() {
                    return false;
                }
                buf[i] = x;
                self.accept(buf)
            });
            i += 1;
        }
    }

    /// The candidate acceptance protocol: strict decrease, memo, identity
    /// check on a replay, then adoption of the recorded consumed tape from a
    /// second replay that must agree with the first.
    fn accept(&mut self, buf: Vec<u64>) -> bool {
        if self.flaky.is_some() || Instant::now() >= self.deadline {
            return false;
        }
        if compare_tapes(&buf, &self.rec.data) != Ordering::Less {
            return false;
        }
        let key = tape_key(&buf);
        if self.cache.contains(&key) {
            self.hits += 1;
            return false;
        }

        self.tries += 1;
        let err1 = {
            let mut s = BufBitStream::new(buf.clone(), false);
            let mut t = T::new(None, &mut s, false, Vec::new());
            check_once(&mut t, self.prop)
        };
        match &err1 {
            Some(e) if e.same(&self.err) => {}
            _ => {
                self.cache.insert(key);
                return false;
            }
        }
        self.err = err1.expect("identity just matched");

        let (err2, mut rec) = {
            let mut s = BufBitStream::new(buf.clone(), true);
            let mut t = T::new(None, &mut s, false, Vec::new());
            let err2 = check_once(&mut t, self.prop);
            (err2, s.take_record())
        };
        rec.prune();
        assert!(
            compare_tapes(&rec.data, &buf) != Ordering::Greater,
            "recorded tape grew past its candidate"
        );
        self.rec = rec;

        match err2 {
            Some(e) if e.same(&self.err) => {}
            other => {
                // the property is not deterministic on this tape; stop and
                // surface it
                self.flaky = Some(other.unwrap_or_else(|| TestError {
                    kind: ErrorKind::Panic,
                    message: "flaky test: failure did not reproduce on replay".to_string(),
                    traceback: String::new(),
                }));
                return false;
            }
        }

        self.shrinks += 1;
        true
    }
}

/// `data` with `[begin, end)` removed.
fn without(data: &[u64], begin: usize, end: usize) -> Vec<u64> {
    let mut buf = Vec::with_capacity(data.len() - (end - begin));
    buf.extend_from_slice(&data[..begin]);
    buf.extend_from_slice(&data[end..]);
    buf
}

/// Tape ordering: shorter first, then lexicographic on the words.
pub(crate) fn compare_tapes(a: &[u64], b: &[u64]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn tape_key(buf: &[u64]) -> Vec<u8> {
    let mut key = Vec::with_capacity(buf.len() * 8);
    for &w in buf {
        key.write_u64::<BigEndian>(w).expect("writing to a vec");
    }
    key
}

/// Find the smallest `x <= u` satisfying `cond`, assuming `cond(u)` holds.
/// The steps are ordered: collapse magnitude first, then clear individual
/// bits, then move weight toward the low bits, then binary-search the exact
/// threshold. Each step accepts only strict decreases.
pub(crate) fn minimize(u: u64, cond: &mut dyn FnMut(u64) -> bool) -> u64 {
    if u == 0 {
        return 0;
    }
    for i in 0..u.min(SMALL as u64) {
        if cond(i) {
            return i;
        }
    }
    if u <= SMALL as u64 {
        return u;
    }

    let mut m = Minimizer { best: u, cond };

    m.r_shift();
    m.unset_bits();
    m.sort_bits();
    m.bin_search();

    m.best
}

struct Minimizer<'a> {
    best: u64,
    cond: &'a mut dyn FnMut(u64) -> bool,
}

impl Minimizer<'_> {
    fn accept(&mut self, u: u64) -> bool {
        if u >= self.best || !(self.cond)(u) {
            return false;
        }
        self.best = u;
        true
    }

    fn r_shift(&mut self) {
        while self.accept(self.best >> 1) {}
    }

    fn unset_bits(&mut self) {
        let size = bit_len(self.best);

        for i in (0..size).rev() {
            self.accept(self.best ^ (1 << i));
        }
    }

    fn sort_bits(&mut self) {
        let size = bit_len(self.best);

        for i in (0..size).rev() {
            let h = 1u64 << i;
            if self.best & h != 0 {
                for j in 0..i {
                    let l = 1u64 << j;
                    if self.best & l == 0 && self.accept(self.best ^ (l | h)) {
                        break;
                    }
                }
            }
        }
    }

    fn bin_search(&mut self) {
        if !self.accept(self.best - 1) {
            return;
        }

        let mut i = 0u64;
        let mut j = self.best;
        while i < j {
            let h = i + (j - i) / 2;
            if self.accept(h) {
                j = h;
            } else {
                i = h + 1;
            }
        }
    }
}
