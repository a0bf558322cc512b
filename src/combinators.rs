//! Generator combinators.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use once_cell::unsync::OnceCell;

use crate::distributions::{flip_biased_coin, gen_index};
use crate::engine::T;
use crate::errors::{raise_invalid_data, raise_stop_test, InvalidData};
use crate::generator::Generator;
use crate::SMALL;

pub(crate) const TRY_LABEL: &str = "try";

/// Generator that always yields clones of `v`.
///
/// The index draw has width zero, but it is still recorded: the entry gives
/// the shrinker a positional anchor even though no information is consumed.
pub fn just<V: Clone + fmt::Debug + 'static>(v: V) -> Generator<V> {
    let label = format!("just({:?})", v);
    sampled(label, vec![v])
}

/// Uniformly sample one of the given values.
pub fn sampled_from<V: Clone + fmt::Debug + 'static>(items: Vec<V>) -> Generator<V> {
    assert!(!items.is_empty(), "items should not be empty");
    let label = format!("sampled_from({} {})", items.len(), std::any::type_name::<V>());
    sampled(label, items)
}

fn sampled<V: Clone + fmt::Debug + 'static>(label: String, items: Vec<V>) -> Generator<V> {
    Generator::from_fn(label, move |t| {
        let i = gen_index(t.bs(), items.len(), true);
        items[i].clone()
    })
}

/// Draw an index, then delegate to that generator.
pub fn one_of<V: fmt::Debug + 'static>(gens: Vec<Generator<V>>) -> Generator<V> {
    assert!(!gens.is_empty(), "at least one generator should be specified");
    let labels: Vec<&str> = gens.iter().map(|g| g.label()).collect();
    let label = format!("one_of({})", labels.join(", "));
    Generator::from_fn(label, move |t| {
        let i = gen_index(t.bs(), gens.len(), true);
        gens[i].value(t)
    })
}

/// Generator defined by an arbitrary function over the running context.
///
/// The function may itself draw from other generators. Attempts that signal
/// invalid data are retried a bounded number of times, each wrapped in a
/// `try` group so rejected attempts can be pruned.
pub fn custom<V: fmt::Debug + 'static>(f: impl Fn(&mut T<'_>) -> V + 'static) -> Generator<V> {
    let label = format!("custom({})", std::any::type_name::<V>());
    Generator::from_fn(label, move |t| {
        find(t, SMALL, None, |t| maybe_value(&f, t))
    })
}

/// Lazily constructed generator, for recursive definitions. The factory runs
/// once, on first draw.
pub fn deferred<V: fmt::Debug + 'static>(
    make: impl Fn() -> Generator<V> + 'static,
) -> Generator<V> {
    let cell: OnceCell<Generator<V>> = OnceCell::new();
    let label = format!("deferred({})", std::any::type_name::<V>());
    Generator::from_fn(label, move |t| cell.get_or_init(&make).value(t))
}

/// `Some(value)` or `None`, with even odds.
pub fn option_of<V: fmt::Debug + 'static>(elem: Generator<V>) -> Generator<Option<V>> {
    let label = format!("option_of({})", elem.label());
    Generator::from_fn(label, move |t| {
        if flip_biased_coin(t.bs(), 0.5) {
            Some(elem.value(t))
        } else {
            None
        }
    })
}

impl<V: fmt::Debug + 'static> Generator<V> {
    /// Keep only values satisfying `pred`. After a bounded number of failed
    /// tries the whole attempt is rejected as invalid data.
    ///
    /// Prefer generators that always produce valid values over `filter`.
    pub fn filter(self, pred: impl Fn(&V) -> bool + 'static) -> Generator<V> {
        let label = format!("{}.filter(...)", self.label());
        Generator::from_fn(label, move |t| {
            find(t, SMALL, None, |t| {
                let v = self.value(t);
                pred(&v).then_some(v)
            })
        })
    }

    /// Like [`Generator::filter`], but an exhausted filter fails the test
    /// with `stop_message` instead of skipping the attempt.
    pub fn filter_or_fail(
        self,
        pred: impl Fn(&V) -> bool + 'static,
        stop_message: impl Into<String>,
    ) -> Generator<V> {
        let label = format!("{}.filter(...)", self.label());
        let stop_message = stop_message.into();
        Generator::from_fn(label, move |t| {
            find(t, SMALL, Some(&stop_message), |t| {
                let v = self.value(t);
                pred(&v).then_some(v)
            })
        })
    }

    /// Transform generated values with `f`. The group structure is that of
    /// the underlying generator alone.
    pub fn map<W: fmt::Debug + 'static>(self, f: impl Fn(V) -> W + 'static) -> Generator<W> {
        let label = format!("{}.map({})", self.label(), std::any::type_name::<W>());
        Generator::from_fn(label, move |t| f(self.value(t)))
    }

    /// Erase the value type, for heterogeneous `one_of`.
    pub fn as_any(self) -> Generator<AnyValue> {
        let label = self.label().to_string();
        Generator::from_fn(label, move |t| AnyValue::new(self.value(t)))
    }
}

/// Run `gen` up to `tries` times, marking failed tries as discarded. With
/// `stop` set, exhaustion fails the test with that message; otherwise it
/// rejects the attempt as invalid data.
pub(crate) fn find<V>(
    t: &mut T<'_>,
    tries: usize,
    stop: Option<&str>,
    mut gen: impl FnMut(&mut T<'_>) -> Option<V>,
) -> V {
    for _ in 0..tries {
        let id = t.begin_group(TRY_LABEL, false);
        let v = gen(t);
        let ok = v.is_some();
        t.end_group(id, !ok);

        if let Some(v) = v {
            return v;
        }
    }

    match stop {
        Some(msg) => raise_stop_test(msg.to_string()),
        None => raise_invalid_data(format!("failed to find suitable value in {} tries", tries)),
    }
}

// Invalid data raised inside a custom generator rejects that attempt only;
// everything else keeps unwinding.
fn maybe_value<V>(f: &impl Fn(&mut T<'_>) -> V, t: &mut T<'_>) -> Option<V> {
    match catch_unwind(AssertUnwindSafe(|| f(t))) {
        Ok(v) => Some(v),
        Err(payload) => {
            if payload.is::<InvalidData>() {
                None
            } else {
                resume_unwind(payload)
            }
        }
    }
}

/// A type-erased generated value, produced by [`Generator::as_any`].
pub struct AnyValue(Box<dyn AnyDebug>);

impl AnyValue {
    pub fn new<V: fmt::Debug + 'static>(v: V) -> AnyValue {
        AnyValue(Box::new(v))
    }

    pub fn downcast<V: 'static>(self) -> Result<V, AnyValue> {
        if self.0.as_any().is::<V>() {
            let v = self.0.into_any().downcast::<V>().expect("type just checked");
            Ok(*v)
        } else {
            Err(self)
        }
    }

    pub fn downcast_ref<V: 'static>(&self) -> Option<&V> {
        self.0.as_any().downcast_ref()
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_value(f)
    }
}

trait AnyDebug: Any {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<V: fmt::Debug + 'static> AnyDebug for V {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BufBitStream, RandomBitStream};
    use crate::engine::run_once;
    use crate::errors::ErrorKind;
    use crate::integers::{i64_range, i64s};

    #[test]
    fn just_always_yields_value_and_anchors_a_draw() {
        let g = just("x");
        let mut s = RandomBitStream::new(3, true);
        run_once(&mut s, |t| {
            assert_eq!(g.draw(t, "v"), "x");
        });
        // the biased width draw plus the zero-width index anchor
        let rec = s.take_record();
        assert_eq!(rec.data.len(), 2);
        assert_eq!(rec.data[1], 0);
    }

    #[test]
    fn sampled_from_picks_members() {
        let items = vec![2i64, 3, 5, 7];
        let g = sampled_from(items.clone());
        for seed in 0..20 {
            let v = g.example(seed).unwrap();
            assert!(items.contains(&v));
        }
    }

    #[test]
    fn one_of_delegates() {
        let g = one_of(vec![i64_range(0, 0), i64_range(10, 10)]);
        for seed in 0..20 {
            let v = g.example(seed).unwrap();
            assert!(v == 0 || v == 10);
        }
    }

    #[test]
    fn filter_marks_failed_tries_discarded() {
        let g = i64s().filter(|v| v % 2 == 0);

        // first seed whose filter does not exhaust its tries
        let mut seed = 0;
        let rec = loop {
            let mut s = RandomBitStream::new(seed, true);
            let err = run_once(&mut s, |t| {
                let v = g.draw(t, "even");
                assert_eq!(v % 2, 0);
            });
            if err.is_none() {
                break s.take_record();
            }
            seed += 1;
        };
        let tries: Vec<bool> = rec
            .groups
            .iter()
            .filter(|g| g.label == TRY_LABEL)
            .map(|g| g.discard)
            .collect();
        assert!(!tries.is_empty());
        assert_eq!(tries.last(), Some(&false));
        assert!(tries[..tries.len() - 1].iter().all(|&d| d));
    }

    #[test]
    fn filter_exhaustion_is_invalid_data() {
        let g = just(1i64).filter(|_| false);
        let mut s = RandomBitStream::new(1, false);
        let err = run_once(&mut s, |t| {
            g.draw(t, "v");
        })
        .expect("property should not pass");
        assert_eq!(err.kind, ErrorKind::InvalidData);
        assert!(err.message.contains("failed to find suitable value"));
    }

    #[test]
    fn filter_or_fail_exhaustion_stops_test() {
        let g = just(1i64).filter_or_fail(|_| false, "needs an even number");
        let mut s = RandomBitStream::new(1, false);
        let err = run_once(&mut s, |t| {
            g.draw(t, "v");
        })
        .expect("property should not pass");
        assert_eq!(err.kind, ErrorKind::StopTest);
        assert_eq!(err.message, "needs an even number");
    }

    #[test]
    fn map_transforms_and_keeps_group_structure() {
        let plain = i64_range(0, 100);
        let mapped = i64_range(0, 100).map(|v| v * 2);

        let mut s1 = RandomBitStream::new(11, true);
        run_once(&mut s1, |t| {
            plain.draw(t, "v");
        });
        let mut s2 = RandomBitStream::new(11, true);
        run_once(&mut s2, |t| {
            let v = mapped.draw(t, "v");
            assert_eq!(v % 2, 0);
        });

        // same tape: map adds no draws of its own
        assert_eq!(s1.take_record().data, s2.take_record().data);
    }

    #[test]
    fn custom_retries_invalid_data() {
        let g = custom(|t| {
            let v = i64_range(0, 1000).draw(t, "v");
            if v % 2 == 1 {
                t.skip_now();
            }
            v
        });
        for seed in 0..10 {
            assert_eq!(g.example(seed).unwrap() % 2, 0);
        }
    }

    #[test]
    fn custom_propagates_other_panics() {
        let g: Generator<i64> = custom(|_| panic!("this generator is not working"));
        let mut s = RandomBitStream::new(1, false);
        let err = run_once(&mut s, |t| {
            g.draw(t, "v");
        })
        .expect("property should not pass");
        assert_eq!(err.kind, ErrorKind::Panic);
        assert_eq!(err.message, "this generator is not working");
    }

    #[test]
    fn deferred_supports_recursive_generators() {
        #[derive(Debug)]
        enum Tree {
            Leaf(i64),
            Node(Box<Tree>),
        }

        fn leaf_of(t: &Tree) -> i64 {
            match t {
                Tree::Leaf(v) => *v,
                Tree::Node(inner) => leaf_of(inner),
            }
        }

        fn tree() -> Generator<Tree> {
            one_of(vec![
                i64_range(0, 10).map(Tree::Leaf),
                deferred(tree).map(|t| Tree::Node(Box::new(t))),
            ])
        }

        let g = tree();
        for seed in 0..20 {
            let v = g.example(seed).unwrap();
            assert!((0..=10).contains(&leaf_of(&v)));
        }
    }

    #[test]
    fn option_of_produces_both_variants() {
        let g = option_of(i64_range(1, 9));
        let (mut some, mut none) = (0, 0);
        for seed in 0..64 {
            match g.example(seed).unwrap() {
                Some(v) => {
                    assert!((1..=9).contains(&v));
                    some += 1;
                }
                None => none += 1,
            }
        }
        assert!(some > 0 && none > 0);
    }

    #[test]
    fn any_value_roundtrip() {
        let g = one_of(vec![i64_range(1, 1).as_any(), just("s").as_any()]);
        let mut seen_int = false;
        let mut seen_str = false;
        for seed in 0..64 {
            let v = g.example(seed).unwrap();
            if let Some(&i) = v.downcast_ref::<i64>() {
                assert_eq!(i, 1);
                seen_int = true;
            } else {
                assert_eq!(v.downcast::<&str>().unwrap(), "s");
                seen_str = true;
            }
        }
        assert!(seen_int && seen_str);
    }

    #[test]
    fn replayed_filter_consumes_discarded_draws() {
        // a replay that "retries" still walks the discarded draws
        let g = i64_range(0, 100).filter(|&v| v >= 50);

        use std::cell::Cell;

        let mut seed = 0;
        let (picked, tape) = loop {
            let mut s = RandomBitStream::new(seed, true);
            let picked = Cell::new(None);
            run_once(&mut s, |t| {
                picked.set(Some(g.draw(t, "v")));
            });
            if let Some(v) = picked.get() {
                break (v, s.take_record().data);
            }
            seed += 1;
        };

        let mut r = BufBitStream::new(tape, false);
        let replayed = Cell::new(None);
        let err = run_once(&mut r, |t| {
            replayed.set(Some(g.draw(t, "v")));
        });
        assert!(err.is_none());
        assert_eq!(replayed.get(), Some(picked));
    }
}
