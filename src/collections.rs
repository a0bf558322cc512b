//! Collection generators built on the `Repeat` controller.
//!
//! Every element is drawn inside a standalone `@repeat` group, which is what
//! lets the shrinker delete individual elements instead of whole
//! collections.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::distributions::Repeat;
use crate::generator::Generator;

pub fn vec_of<V: fmt::Debug + 'static>(elem: Generator<V>) -> Generator<Vec<V>> {
    let label = format!("vec_of({})", elem.label());
    vec_gen(label, elem, 0, None)
}

pub fn vec_of_n<V: fmt::Debug + 'static>(
    elem: Generator<V>,
    min_len: usize,
    max_len: usize,
) -> Generator<Vec<V>> {
    let label = format!("vec_of_n({}, {}, {})", elem.label(), min_len, max_len);
    vec_gen(label, elem, min_len, Some(max_len))
}

pub fn vec_of_min<V: fmt::Debug + 'static>(
    elem: Generator<V>,
    min_len: usize,
) -> Generator<Vec<V>> {
    let label = format!("vec_of_min({}, {})", elem.label(), min_len);
    vec_gen(label, elem, min_len, None)
}

fn vec_gen<V: fmt::Debug + 'static>(
    label: String,
    elem: Generator<V>,
    min_len: usize,
    max_len: Option<usize>,
) -> Generator<Vec<V>> {
    Generator::from_fn(label, move |t| {
        let mut rep = Repeat::new(min_len, max_len, None);
        let mut v = Vec::with_capacity(rep.avg());
        while rep.more(t.bs(), elem.label()) {
            v.push(elem.value(t));
        }
        v
    })
}

/// Vector of elements that are distinct under `key`. Elements whose key was
/// already produced are rejected and redrawn, up to the repeat controller's
/// rejection budget.
pub fn vec_of_distinct_by<V, K, F>(
    elem: Generator<V>,
    min_len: usize,
    max_len: Option<usize>,
    key: F,
) -> Generator<Vec<V>>
where
    V: fmt::Debug + 'static,
    K: Hash + Eq + 'static,
    F: Fn(&V) -> K + 'static,
{
    let label = format!("vec_of_distinct_by({}, {})", elem.label(), min_len);
    Generator::from_fn(label, move |t| {
        let mut rep = Repeat::new(min_len, max_len, None);
        let mut seen = std::collections::HashSet::with_capacity(rep.avg());
        let mut v = Vec::with_capacity(rep.avg());
        while rep.more(t.bs(), elem.label()) {
            let e = elem.value(t);
            if seen.insert(key(&e)) {
                v.push(e);
            } else {
                rep.reject();
            }
        }
        v
    })
}

pub fn vec_of_distinct<V>(elem: Generator<V>) -> Generator<Vec<V>>
where
    V: Clone + Hash + Eq + fmt::Debug + 'static,
{
    vec_of_distinct_by(elem, 0, None, V::clone)
}

pub fn hash_map_of<K, V>(key: Generator<K>, val: Generator<V>) -> Generator<HashMap<K, V>>
where
    K: Hash + Eq + fmt::Debug + 'static,
    V: fmt::Debug + 'static,
{
    hash_map_gen(key, val, 0, None)
}

pub fn hash_map_of_n<K, V>(
    key: Generator<K>,
    val: Generator<V>,
    min_len: usize,
    max_len: usize,
) -> Generator<HashMap<K, V>>
where
    K: Hash + Eq + fmt::Debug + 'static,
    V: fmt::Debug + 'static,
{
    hash_map_gen(key, val, min_len, Some(max_len))
}

fn hash_map_gen<K, V>(
    key: Generator<K>,
    val: Generator<V>,
    min_len: usize,
    max_len: Option<usize>,
) -> Generator<HashMap<K, V>>
where
    K: Hash + Eq + fmt::Debug + 'static,
    V: fmt::Debug + 'static,
{
    let label = format!("hash_map_of({}, {})", key.label(), val.label());
    let elem_label = format!("{},{}", key.label(), val.label());
    Generator::from_fn(label, move |t| {
        let mut rep = Repeat::new(min_len, max_len, None);
        let mut m = HashMap::with_capacity(rep.avg());
        while rep.more(t.bs(), &elem_label) {
            let k = key.value(t);
            let v = val.value(t);
            if m.contains_key(&k) {
                rep.reject();
            } else {
                m.insert(k, v);
            }
        }
        m
    })
}

/// Fixed-size array. An empty array still consumes one zero-width draw, so
/// the generator stays anchored on the tape.
pub fn array_of<V: fmt::Debug + 'static, const N: usize>(
    elem: Generator<V>,
) -> Generator<[V; N]> {
    let label = format!("array_of({}, {})", N, elem.label());
    Generator::from_fn(label, move |t| {
        if N == 0 {
            t.bs().draw_bits(0);
        }
        std::array::from_fn(|_| elem.value(t))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RandomBitStream;
    use crate::distributions::REPEAT_LABEL;
    use crate::engine::run_once;
    use crate::integers::{i64_range, i64s, u8s};

    #[test]
    fn vec_of_n_respects_bounds() {
        let g = vec_of_n(i64s(), 2, 5);
        for seed in 0..50 {
            let v = g.example(seed).unwrap();
            assert!((2..=5).contains(&v.len()), "length {}", v.len());
        }
    }

    #[test]
    fn vec_of_min_has_no_upper_bound_surprises() {
        let g = vec_of_min(i64s(), 4);
        for seed in 0..20 {
            assert!(g.example(seed).unwrap().len() >= 4);
        }
    }

    #[test]
    fn elements_live_in_repeat_groups() {
        let g = vec_of_n(u8s(), 1, 4);
        let mut s = RandomBitStream::new(9, true);
        let len = std::cell::Cell::new(0);
        run_once(&mut s, |t| {
            len.set(g.draw(t, "v").len());
        });
        let len = len.get();

        let rec = s.take_record();
        assert!(rec.well_nested());
        let repeats = rec
            .groups
            .iter()
            .filter(|g| g.label.ends_with(REPEAT_LABEL))
            .count();
        // one group per element plus the final stop decision
        assert_eq!(repeats, len + 1);
        assert!(rec
            .groups
            .iter()
            .filter(|g| g.label.ends_with(REPEAT_LABEL))
            .all(|g| g.standalone));
    }

    #[test]
    fn distinct_vec_has_no_duplicates() {
        let g = vec_of_distinct(i64_range(0, 20));
        for seed in 0..30 {
            let v = g.example(seed).unwrap();
            let mut sorted = v.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), v.len(), "duplicates in {:?}", v);
        }
    }

    #[test]
    fn distinct_by_key_uses_the_key() {
        let g = vec_of_distinct_by(i64_range(-5, 5), 0, None, |v| v.abs());
        for seed in 0..30 {
            let v = g.example(seed).unwrap();
            let mut keys: Vec<i64> = v.iter().map(|v| v.abs()).collect();
            keys.sort_unstable();
            keys.dedup();
            assert_eq!(keys.len(), v.len(), "duplicate keys in {:?}", v);
        }
    }

    #[test]
    fn hash_map_respects_bounds_and_keys() {
        let g = hash_map_of_n(u8s(), i64s(), 1, 6);
        for seed in 0..30 {
            let m = g.example(seed).unwrap();
            assert!((1..=6).contains(&m.len()), "length {}", m.len());
        }
    }

    #[test]
    fn array_of_draws_exactly_n_elements() {
        let g = array_of::<u8, 3>(u8s());
        for seed in 0..10 {
            let a = g.example(seed).unwrap();
            assert_eq!(a.len(), 3);
        }
    }

    #[test]
    fn empty_array_still_draws_an_anchor() {
        let g = array_of::<u8, 0>(u8s());
        let mut s = RandomBitStream::new(2, true);
        run_once(&mut s, |t| {
            let a = g.draw(t, "a");
            assert!(a.is_empty());
        });
        assert_eq!(s.take_record().data, vec![0]);
    }
}
