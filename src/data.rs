//! Bit streams and the recorded tape.
//!
//! All randomness a property consumes flows through a [`BitStream`]: a tape
//! of 64-bit draws. A [`RandomBitStream`] appends fresh PRNG output to the
//! tape; a [`BufBitStream`] replays a fixed buffer. Generators annotate the
//! tape with labeled, nested groups, and the tape plus its group tree — the
//! [`RecordedBits`] — is what the shrinker rewrites.

use crate::errors::raise_invalid_data;
use crate::rng::Jsf64;

pub(crate) const MAX_DRAW_BITS: u32 = 64;

#[inline]
pub(crate) fn bitmask(n: u32) -> u64 {
    debug_assert!(n <= MAX_DRAW_BITS);
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

#[inline]
pub(crate) fn bit_len(u: u64) -> u32 {
    64 - u.leading_zeros()
}

/// The tape interface shared by recording and replay streams.
///
/// `draw_bits(n)` returns a value below `2^n`; `n == 0` is a real draw that
/// appends a zero entry, used by generators that otherwise consume nothing
/// but still need a positional anchor for shrinking.
pub trait BitStream {
    fn draw_bits(&mut self, n: u32) -> u64;

    /// Open a group over the draws that follow. `standalone` groups may be
    /// deleted by the shrinker as a unit.
    fn begin_group(&mut self, label: &str, standalone: bool) -> usize;

    /// Close the group opened by the matching `begin_group`. `discard` marks
    /// the group's draws as rejected; they are pruned before shrinking, not
    /// rolled back.
    fn end_group(&mut self, id: usize, discard: bool);
}

/// A labeled half-open interval of tape indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub label: String,
    pub begin: usize,
    pub end: Option<usize>,
    pub standalone: bool,
    pub discard: bool,
}

/// Tape plus group tree: everything recorded about one property run.
#[derive(Debug, Clone, Default)]
pub struct RecordedBits {
    pub data: Vec<u64>,
    pub groups: Vec<GroupInfo>,
    open: Vec<usize>,
}

impl RecordedBits {
    fn begin_group(&mut self, label: &str, standalone: bool) -> usize {
        let id = self.groups.len();
        self.groups.push(GroupInfo {
            label: label.to_string(),
            begin: self.data.len(),
            end: None,
            standalone,
            discard: false,
        });
        self.open.push(id);
        id
    }

    fn end_group(&mut self, id: usize, discard: bool) {
        // a caught unwind can abandon groups opened after `id`; they stay
        // open and are swept up by the enclosing discard on prune
        while let Some(top) = self.open.pop() {
            if top == id {
                let end = self.data.len();
                let g = &mut self.groups[id];
                g.end = Some(end);
                g.discard = discard;
                return;
            }
        }
        panic!("group {} closed twice or never opened", id);
    }

    /// True when every opened group has been closed.
    pub fn well_nested(&self) -> bool {
        self.open.is_empty() && self.groups.iter().all(|g| g.end.is_some())
    }

    /// Remove discarded groups together with their tape spans. Children of
    /// discarded groups go with them; surviving group intervals are
    /// re-indexed onto the compacted tape.
    pub fn prune(&mut self) {
        self.open.clear();

        let mut cuts: Vec<(usize, usize)> = self
            .groups
            .iter()
            .filter(|g| g.discard)
            .filter_map(|g| g.end.map(|e| (g.begin, e)))
            .filter(|&(b, e)| e > b)
            .collect();
        cuts.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::new();
        for (b, e) in cuts {
            match merged.last_mut() {
                Some(last) if b <= last.1 => last.1 = last.1.max(e),
                _ => merged.push((b, e)),
            }
        }

        let len = self.data.len();
        let mut keep = vec![true; len];
        for &(b, e) in &merged {
            for k in keep.iter_mut().take(e.min(len)).skip(b) {
                *k = false;
            }
        }

        let mut removed_before = vec![0usize; len + 1];
        for i in 0..len {
            removed_before[i + 1] = removed_before[i] + usize::from(!keep[i]);
        }

        let in_cut = |i: usize| merged.iter().any(|&(b, e)| i >= b && i < e);

        self.groups.retain(|g| !g.discard && !in_cut(g.begin));
        for g in &mut self.groups {
            g.begin -= removed_before[g.begin];
            if let Some(e) = g.end {
                g.end = Some(e - removed_before[e]);
            }
        }

        let mut i = 0;
        self.data.retain(|_| {
            let k = keep[i];
            i += 1;
            k
        });
    }
}

/// Recording stream: tape entries are fresh PRNG draws.
///
/// The group tree is only kept when `record` is set; the bug-finding loop
/// runs without it and re-records the failing seed afterwards.
#[derive(Debug)]
pub struct RandomBitStream {
    rng: Jsf64,
    rec: Option<RecordedBits>,
}

impl RandomBitStream {
    pub fn new(seed: u64, record: bool) -> RandomBitStream {
        RandomBitStream {
            rng: Jsf64::new(seed),
            rec: record.then(RecordedBits::default),
        }
    }

    /// Reset to a fresh sequence for `seed`, clearing any recording.
    pub fn init(&mut self, seed: u64) {
        self.rng = Jsf64::new(seed);
        if let Some(rec) = &mut self.rec {
            *rec = RecordedBits::default();
        }
    }

    pub fn take_record(&mut self) -> RecordedBits {
        self.rec.take().unwrap_or_default()
    }
}

impl BitStream for RandomBitStream {
    fn draw_bits(&mut self, n: u32) -> u64 {
        assert!(n <= MAX_DRAW_BITS, "cannot draw {} bits", n);
        let v = self.rng.next() & bitmask(n);
        if let Some(rec) = &mut self.rec {
            rec.data.push(v);
        }
        v
    }

    fn begin_group(&mut self, label: &str, standalone: bool) -> usize {
        match &mut self.rec {
            Some(rec) => rec.begin_group(label, standalone),
            None => 0,
        }
    }

    fn end_group(&mut self, id: usize, discard: bool) {
        if let Some(rec) = &mut self.rec {
            rec.end_group(id, discard);
        }
    }
}

/// Replay stream: tape entries come from a fixed buffer, masked to the
/// requested width. Reading past the end fails the attempt as invalid data.
#[derive(Debug)]
pub struct BufBitStream {
    buf: Vec<u64>,
    pos: usize,
    rec: Option<RecordedBits>,
}

impl BufBitStream {
    pub fn new(buf: Vec<u64>, record: bool) -> BufBitStream {
        BufBitStream {
            buf,
            pos: 0,
            rec: record.then(RecordedBits::default),
        }
    }

    pub fn take_record(&mut self) -> RecordedBits {
        self.rec.take().unwrap_or_default()
    }
}

impl BitStream for BufBitStream {
    fn draw_bits(&mut self, n: u32) -> u64 {
        assert!(n <= MAX_DRAW_BITS, "cannot draw {} bits", n);
        if self.pos >= self.buf.len() {
            raise_invalid_data("replay buffer overrun".to_string());
        }
        let v = self.buf[self.pos] & bitmask(n);
        self.pos += 1;
        if let Some(rec) = &mut self.rec {
            rec.data.push(v);
        }
        v
    }

    fn begin_group(&mut self, label: &str, standalone: bool) -> usize {
        match &mut self.rec {
            Some(rec) => rec.begin_group(label, standalone),
            None => 0,
        }
    }

    fn end_group(&mut self, id: usize, discard: bool) {
        if let Some(rec) = &mut self.rec {
            rec.end_group(id, discard);
        }
    }
}
