//! Primitive samplers over a bit stream.
//!
//! Everything here is deterministic in the stream: the same tape always
//! produces the same values. Distributions open groups around their draws so
//! that the shrinker can recognize the structure — a biased width choice, a
//! rejected sample, a repeat iteration — and rewrite it.

use crate::data::{bit_len, BitStream};
use crate::errors::raise_invalid_data;
use crate::SMALL;

pub(crate) const BIAS_LABEL: &str = "bias";
pub(crate) const INT_BITS_LABEL: &str = "intbits";
pub(crate) const COIN_FLIP_LABEL: &str = "coinflip";
pub(crate) const DIE_ROLL_LABEL: &str = "dieroll";
pub(crate) const REPEAT_LABEL: &str = "@repeat";

/// Uniform float in `[0, 1)` with 53 bits of precision.
pub fn gen_float01(s: &mut dyn BitStream) -> f64 {
    s.draw_bits(53) as f64 / (1u64 << 53) as f64
}

/// Geometric distribution with success probability `p`.
pub fn gen_geom(s: &mut dyn BitStream, p: f64) -> u64 {
    assert!(p > 0.0 && p <= 1.0, "invalid probability {}", p);

    let f = gen_float01(s);
    let n = f64::ln_1p(-f) / f64::ln_1p(-p);

    n as u64
}

/// Coin flip that is true with probability `p`.
pub fn flip_biased_coin(s: &mut dyn BitStream, p: f64) -> bool {
    assert!((0.0..=1.0).contains(&p), "invalid probability {}", p);

    let i = s.begin_group(COIN_FLIP_LABEL, false);
    let f = gen_float01(s);
    s.end_group(i, false);

    f >= 1.0 - p
}

fn gen_uint_n_width(s: &mut dyn BitStream, max: u64, bias: bool) -> (u64, u32) {
    let mut bitlen = bit_len(max);
    if bias {
        let i = s.begin_group(BIAS_LABEL, false);
        let m = f64::max(8.0, (bitlen as f64 + 48.0) / 7.0);
        let n = gen_geom(s, 1.0 / (m + 1.0));
        s.end_group(i, false);

        if n + 1 < bitlen as u64 {
            bitlen = (n + 1) as u32;
        }
    }

    loop {
        let i = s.begin_group(INT_BITS_LABEL, false);
        let u = s.draw_bits(bitlen);
        let ok = u <= max;
        s.end_group(i, !ok);
        if ok {
            return (u, bitlen);
        }
    }
}

/// Uniform draw from `[0, max]`. With `bias`, small bit widths are strongly
/// preferred, which keeps typical values small without excluding large ones.
pub fn gen_uint_n(s: &mut dyn BitStream, max: u64, bias: bool) -> u64 {
    gen_uint_n_width(s, max, bias).0
}

pub fn gen_uint_range(s: &mut dyn BitStream, min: u64, max: u64, bias: bool) -> u64 {
    assert!(min <= max, "invalid range [{}, {}]", min, max);

    min + gen_uint_n(s, max - min, bias)
}

/// Signed draw from `[min, max]`. Intervals crossing zero pick the sign
/// first, with a probability weighted so that the negative half is not
/// under-drawn when biased widths are in play.
pub fn gen_int_range(s: &mut dyn BitStream, min: i64, max: i64, bias: bool) -> i64 {
    assert!(min <= max, "invalid range [{}, {}]", min, max);

    let pos_min: u64;
    let mut neg_min = 0u64;
    let p_neg: f64;
    if min >= 0 {
        pos_min = min as u64;
        p_neg = 0.0;
    } else if max <= 0 {
        pos_min = 0;
        neg_min = max.unsigned_abs();
        p_neg = 1.0;
    } else {
        pos_min = 0;
        neg_min = 1;
        let mut pos = max as u64 + 1;
        let mut neg = min.unsigned_abs();
        if bias {
            pos = bit_len(pos) as u64;
            neg = bit_len(neg) as u64;
        }
        p_neg = neg as f64 / (neg as f64 + pos as f64);
    }

    if flip_biased_coin(s, p_neg) {
        (gen_uint_range(s, neg_min, min.unsigned_abs(), bias) as i64).wrapping_neg()
    } else {
        gen_uint_range(s, pos_min, max as u64, bias) as i64
    }
}

/// Uniform index into a collection of `n` elements.
pub fn gen_index(s: &mut dyn BitStream, n: usize, bias: bool) -> usize {
    assert!(n > 0, "cannot index into an empty collection");

    gen_uint_n(s, (n - 1) as u64, bias) as usize
}

/// Weighted discrete distribution over `weights.len()` outcomes, backed by a
/// flat lookup table of size `sum(weights)`.
#[derive(Debug, Clone)]
pub struct LoadedDie {
    table: Vec<usize>,
}

impl LoadedDie {
    pub fn new(weights: &[u32]) -> LoadedDie {
        assert!(!weights.is_empty(), "at least one weight is required");

        if weights.len() == 1 {
            return LoadedDie { table: vec![0] };
        }

        let mut table = Vec::new();
        for (n, &w) in weights.iter().enumerate() {
            assert!(w > 0 && w < 100, "weight {} out of (0, 100)", w);
            table.extend(std::iter::repeat(n).take(w as usize));
        }

        LoadedDie { table }
    }

    pub fn roll(&self, s: &mut dyn BitStream) -> usize {
        let i = s.begin_group(DIE_ROLL_LABEL, false);
        let ix = gen_index(s, self.table.len(), false);
        s.end_group(i, false);

        self.table[ix]
    }
}

/// Length controller for variable-size collections.
///
/// Each candidate element is wrapped in a standalone `@repeat` group so the
/// shrinker can delete whole elements. `more` decides whether to produce
/// another element; `reject` retracts the element just produced (a duplicate
/// key, for instance), marking its group as discarded.
#[derive(Debug, Clone)]
pub struct Repeat {
    min_count: usize,
    max_count: usize,
    avg_count: f64,
    p_continue: f64,
    count: usize,
    group: Option<usize>,
    rejected: bool,
    rejections: usize,
    force_stop: bool,
}

impl Repeat {
    pub fn new(min_count: usize, max_count: Option<usize>, avg_count: Option<f64>) -> Repeat {
        let max_count = max_count.unwrap_or(usize::MAX);
        assert!(min_count <= max_count, "invalid range [{}, {}]", min_count, max_count);
        let avg_count = avg_count.unwrap_or_else(|| {
            let min = min_count as f64;
            let max = max_count as f64;
            min + f64::min(f64::max(min, SMALL as f64), (max - min) / 2.0)
        });

        Repeat {
            min_count,
            max_count,
            avg_count,
            p_continue: 1.0 - 1.0 / (1.0 + avg_count - min_count as f64),
            count: 0,
            group: None,
            rejected: false,
            rejections: 0,
            force_stop: false,
        }
    }

    /// Accepted element count so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Expected element count, usable as a capacity hint.
    pub fn avg(&self) -> usize {
        self.avg_count.ceil() as usize
    }

    /// Decide whether to produce another element. The element's draws must
    /// happen between this call and the next one; the group stays open in
    /// between.
    pub fn more(&mut self, s: &mut dyn BitStream, label: &str) -> bool {
        if let Some(g) = self.group.take() {
            s.end_group(g, self.rejected);
        }

        let group = s.begin_group(&format!("{}{}", label, REPEAT_LABEL), true);
        self.group = Some(group);
        self.rejected = false;

        let mut p_cont = self.p_continue;
        if self.count < self.min_count {
            p_cont = 1.0;
        } else if self.force_stop || self.count >= self.max_count {
            p_cont = 0.0;
        }

        let cont = flip_biased_coin(s, p_cont);
        if cont {
            self.count += 1;
        } else {
            s.end_group(self.group.take().expect("repeat group just opened"), false);
        }

        cont
    }

    /// Retract the element produced since the last `more` call. Rejecting
    /// more than twice the accepted count aborts the attempt as invalid
    /// data, unless the minimum is already met, in which case the next
    /// `more` is forced to stop.
    pub fn reject(&mut self) {
        assert!(self.count > 0, "reject without a produced element");
        self.count -= 1;
        self.rejected = true;
        self.rejections += 1;

        if self.rejections > self.count * 2 {
            if self.count >= self.min_count {
                self.force_stop = true;
            } else {
                raise_invalid_data("too many rejections in repeat".to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BufBitStream, RandomBitStream};

    fn seeded() -> RandomBitStream {
        RandomBitStream::new(rand::random(), false)
    }

    #[test]
    fn float01_edges() {
        let mut zero = BufBitStream::new(vec![0], false);
        assert_eq!(gen_float01(&mut zero), 0.0);

        let mut max = BufBitStream::new(vec![u64::MAX], false);
        let f = gen_float01(&mut max);
        assert!(f < 1.0, "got impossible {}", f);
    }

    #[test]
    fn geom_edges() {
        let mut s = BufBitStream::new(vec![0], false);
        assert_eq!(gen_geom(&mut s, 0.1), 0);

        let mut s = BufBitStream::new(vec![0], false);
        assert_eq!(gen_geom(&mut s, 1.0), 0);
    }

    #[test]
    fn uint_n_stays_in_range() {
        let mut s = seeded();
        for max in [0u64, 1, 2, 5, 13, u64::MAX / 2, u64::MAX] {
            for bias in [false, true] {
                for _ in 0..200 {
                    assert!(gen_uint_n(&mut s, max, bias) <= max);
                }
            }
        }
    }

    #[test]
    fn uint_range_stays_in_range() {
        let mut s = seeded();
        let ranges = [
            (0u64, 0u64),
            (0, 1),
            (1, 3),
            (3, 7),
            (u64::MAX - 3, u64::MAX),
            (u64::MAX, u64::MAX),
        ];
        for (min, max) in ranges {
            for bias in [false, true] {
                for _ in 0..200 {
                    let u = gen_uint_range(&mut s, min, max, bias);
                    assert!(u >= min && u <= max, "{} out of [{}, {}]", u, min, max);
                }
            }
        }
    }

    #[test]
    fn int_range_stays_in_range() {
        let mut s = seeded();
        let ranges = [
            (0i64, 0i64),
            (0, 2),
            (1, 3),
            (-1, -1),
            (-3, 0),
            (-1, 1),
            (-7, -3),
            (-3, 7),
            (i64::MIN, i64::MIN + 3),
            (i64::MIN, i64::MIN),
            (i64::MAX - 3, i64::MAX),
            (i64::MIN, i64::MAX),
        ];
        for (min, max) in ranges {
            for bias in [false, true] {
                for _ in 0..200 {
                    let i = gen_int_range(&mut s, min, max, bias);
                    assert!(i >= min && i <= max, "{} out of [{}, {}]", i, min, max);
                }
            }
        }
    }

    #[test]
    fn rejected_samples_are_marked_discard() {
        // max 5 needs 3 bits; a replayed 7 is rejected before 2 is accepted
        let mut s = BufBitStream::new(vec![7, 2], true);
        assert_eq!(gen_uint_n(&mut s, 5, false), 2);

        let rec = s.take_record();
        let discards: Vec<bool> = rec
            .groups
            .iter()
            .filter(|g| g.label == INT_BITS_LABEL)
            .map(|g| g.discard)
            .collect();
        assert_eq!(discards, vec![true, false]);
    }

    fn run_repeat(s: &mut dyn BitStream, min: usize, max: Option<usize>, avg: Option<f64>) -> usize {
        let mut r = Repeat::new(min, max, avg);
        let mut n = 0;
        while r.more(s, "elem") {
            n += 1;
        }
        n
    }

    #[test]
    fn repeat_respects_bounds() {
        let mut s = seeded();
        let cases = [
            (0usize, Some(0usize)),
            (0, Some(1)),
            (1, Some(1)),
            (3, Some(3)),
            (3, Some(7)),
            (0, Some(10)),
            (1, Some(50)),
            (2, None),
        ];
        for (min, max) in cases {
            for _ in 0..300 {
                let n = run_repeat(&mut s, min, max, None);
                assert!(n >= min, "{} below minimum {}", n, min);
                if let Some(max) = max {
                    assert!(n <= max, "{} above maximum {}", n, max);
                }
            }
        }
    }

    #[test]
    #[ignore = "statistical, run explicitly"]
    fn repeat_empirical_mean() {
        let mut s = seeded();
        for avg in [1001.0f64, 1002.0, 1007.0, 1013.0, 1100.0, 2000.0] {
            let n = 5000;
            let mut total = 0usize;
            for _ in 0..n {
                total += run_repeat(&mut s, 1000, None, Some(avg));
            }
            let mu = total as f64 / n as f64;
            assert!(
                (mu - avg).abs() <= 0.5,
                "real avg {} vs desired {}",
                mu,
                avg
            );
        }
    }

    #[test]
    #[ignore = "statistical, run explicitly"]
    fn coin_flip_empirical_probability() {
        let mut s = seeded();
        for p in [0.0, 0.3, 0.5, 0.7, 1.0] {
            let n = 1000;
            let y = (0..n).filter(|_| flip_biased_coin(&mut s, p)).count();
            let mu = n as f64 * p;
            let sigma = (n as f64 * p * (1.0 - p)).sqrt();
            assert!(
                (y as f64 - mu).abs() <= 3.0 * sigma,
                "got {} of {} for p={}",
                y,
                n,
                p
            );
        }
    }

    #[test]
    #[ignore = "statistical, run explicitly"]
    fn loaded_die_empirical_weights() {
        let mut s = seeded();
        for weights in [vec![1u32], vec![1, 2], vec![3, 2, 1], vec![1, 2, 4, 2, 1]] {
            let die = LoadedDie::new(&weights);
            let n = 1000;
            let mut counts = vec![0usize; weights.len()];
            for _ in 0..n {
                counts[die.roll(&mut s)] += 1;
            }

            let total: u32 = weights.iter().sum();
            for (i, &w) in weights.iter().enumerate() {
                let p = w as f64 / total as f64;
                let mu = n as f64 * p;
                let sigma = (n as f64 * p * (1.0 - p)).sqrt();
                assert!(
                    (counts[i] as f64 - mu).abs() <= 3.0 * sigma,
                    "outcome {} drawn {} times of {}",
                    i,
                    counts[i],
                    n
                );
            }
        }
    }

    #[test]
    fn repeat_reject_over_budget_is_invalid_data() {
        use crate::errors::InvalidData;
        use std::panic::{catch_unwind, AssertUnwindSafe};

        let mut s = seeded();
        let payload = catch_unwind(AssertUnwindSafe(|| {
            let mut r = Repeat::new(2, None, None);
            loop {
                if r.more(&mut s, "elem") {
                    r.reject();
                }
            }
        }))
        .unwrap_err();
        assert!(payload.is::<InvalidData>());
    }

    #[test]
    fn repeat_reject_past_minimum_forces_stop() {
        let mut s = seeded();
        let mut r = Repeat::new(0, None, Some(1000.0));
        let mut accepted = 0;
        while r.more(&mut s, "elem") {
            if accepted < 1 {
                accepted += 1;
            } else {
                r.reject();
            }
        }
        assert_eq!(r.count(), accepted);
    }
}
