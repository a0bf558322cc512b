//! The `Generator<V>` abstraction.
//!
//! A generator is an immutable value built ahead of time and reused across
//! property evaluations: a display label plus a function from a bit stream
//! to a value. The public wrapper opens a standalone group labeled with the
//! generator's label around every draw, so each top-level value corresponds
//! to exactly one group in the record — the invariant the shrinker's group
//! deletion pass relies on.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::data::RandomBitStream;
use crate::engine::{T, EXAMPLE_MAX_TRIES};
use crate::errors::{self, TestError};

/// Implementation object behind a [`Generator`]: just the draw function;
/// the label lives on the wrapper.
pub trait GeneratorImpl<V>: 'static {
    fn value(&self, t: &mut T<'_>) -> V;
}

struct ClosureGen<V> {
    f: Box<dyn Fn(&mut T<'_>) -> V>,
}

impl<V: 'static> GeneratorImpl<V> for ClosureGen<V> {
    fn value(&self, t: &mut T<'_>) -> V {
        (self.f)(t)
    }
}

/// A reusable recipe for drawing values of type `V` from a bit stream.
pub struct Generator<V> {
    label: Rc<str>,
    imp: Rc<dyn GeneratorImpl<V>>,
}

impl<V> Clone for Generator<V> {
    fn clone(&self) -> Self {
        Generator {
            label: Rc::clone(&self.label),
            imp: Rc::clone(&self.imp),
        }
    }
}

impl<V> fmt::Debug for Generator<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Generator({})", self.label)
    }
}

impl<V: 'static> Generator<V> {
    pub fn new(label: impl Into<String>, imp: impl GeneratorImpl<V>) -> Generator<V> {
        Generator {
            label: Rc::from(label.into()),
            imp: Rc::new(imp),
        }
    }

    pub(crate) fn from_fn(
        label: impl Into<String>,
        f: impl Fn(&mut T<'_>) -> V + 'static,
    ) -> Generator<V> {
        Generator::new(label, ClosureGen { f: Box::new(f) })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Produce one value, wrapped in a standalone group carrying this
    /// generator's label. Composite generator implementations call this on
    /// their inner generators; properties should use [`Generator::draw`].
    pub fn value(&self, t: &mut T<'_>) -> V {
        let id = t.begin_group(&self.label, true);
        let v = self.imp.value(t);
        t.end_group(id, false);
        v
    }
}

impl<V: fmt::Debug + 'static> Generator<V> {
    /// Draw a value as part of a property, logging and auditing it under
    /// `label`.
    pub fn draw(&self, t: &mut T<'_>, label: &str) -> V {
        t.helper();
        t.draw(self, label)
    }

    /// Produce one example value outside of any property, for exploring
    /// what a generator yields. Attempts that fail (an exhausted filter,
    /// say) are retried on an advancing stream up to a fixed budget.
    pub fn example(&self, seed: u64) -> Result<V, TestError> {
        let mut s = RandomBitStream::new(seed, false);
        let mut t = T::new(None, &mut s, false, Vec::new());

        let mut last_err = None;
        for _ in 0..EXAMPLE_MAX_TRIES {
            match self.recover_value(&mut t) {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.expect("at least one attempt was made"))
    }

    fn recover_value(&self, t: &mut T<'_>) -> Result<V, TestError> {
        let _guard = errors::capture_panics();
        catch_unwind(AssertUnwindSafe(|| self.value(t))).map_err(TestError::from_panic)
    }
}
