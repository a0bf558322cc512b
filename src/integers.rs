//! Boolean and integer generators for every primitive width.
//!
//! All integer generators draw through the biased samplers, so typical
//! values are small while the full range stays reachable.

use crate::distributions::{gen_int_range, gen_uint_range};
use crate::engine::T;
use crate::generator::Generator;

pub fn bools() -> Generator<bool> {
    Generator::from_fn("bools()", |t: &mut T<'_>| t.bs().draw_bits(1) == 1)
}

macro_rules! signed_gens {
    ($ty:ty, $full:ident, $range:ident, $min:ident, $max:ident) => {
        pub fn $full() -> Generator<$ty> {
            let label = concat!(stringify!($full), "()");
            Generator::from_fn(label, |t: &mut T<'_>| {
                gen_int_range(t.bs(), <$ty>::MIN as i64, <$ty>::MAX as i64, true) as $ty
            })
        }

        pub fn $range(min: $ty, max: $ty) -> Generator<$ty> {
            assert!(min <= max, "invalid range [{}, {}]", min, max);
            let label = format!(concat!(stringify!($range), "({}, {})"), min, max);
            Generator::from_fn(label, move |t: &mut T<'_>| {
                gen_int_range(t.bs(), min as i64, max as i64, true) as $ty
            })
        }

        pub fn $min(min: $ty) -> Generator<$ty> {
            let label = format!(concat!(stringify!($min), "({})"), min);
            Generator::from_fn(label, move |t: &mut T<'_>| {
                gen_int_range(t.bs(), min as i64, <$ty>::MAX as i64, true) as $ty
            })
        }

        pub fn $max(max: $ty) -> Generator<$ty> {
            let label = format!(concat!(stringify!($max), "({})"), max);
            Generator::from_fn(label, move |t: &mut T<'_>| {
                gen_int_range(t.bs(), <$ty>::MIN as i64, max as i64, true) as $ty
            })
        }
    };
}

macro_rules! unsigned_gens {
    ($ty:ty, $full:ident, $range:ident, $min:ident, $max:ident) => {
        pub fn $full() -> Generator<$ty> {
            let label = concat!(stringify!($full), "()");
            Generator::from_fn(label, |t: &mut T<'_>| {
                gen_uint_range(t.bs(), <$ty>::MIN as u64, <$ty>::MAX as u64, true) as $ty
            })
        }

        pub fn $range(min: $ty, max: $ty) -> Generator<$ty> {
            assert!(min <= max, "invalid range [{}, {}]", min, max);
            let label = format!(concat!(stringify!($range), "({}, {})"), min, max);
            Generator::from_fn(label, move |t: &mut T<'_>| {
                gen_uint_range(t.bs(), min as u64, max as u64, true) as $ty
            })
        }

        pub fn $min(min: $ty) -> Generator<$ty> {
            let label = format!(concat!(stringify!($min), "({})"), min);
            Generator::from_fn(label, move |t: &mut T<'_>| {
                gen_uint_range(t.bs(), min as u64, <$ty>::MAX as u64, true) as $ty
            })
        }

        pub fn $max(max: $ty) -> Generator<$ty> {
            let label = format!(concat!(stringify!($max), "({})"), max);
            Generator::from_fn(label, move |t: &mut T<'_>| {
                gen_uint_range(t.bs(), <$ty>::MIN as u64, max as u64, true) as $ty
            })
        }
    };
}

signed_gens!(i8, i8s, i8_range, i8_min, i8_max);
signed_gens!(i16, i16s, i16_range, i16_min, i16_max);
signed_gens!(i32, i32s, i32_range, i32_min, i32_max);
signed_gens!(i64, i64s, i64_range, i64_min, i64_max);
signed_gens!(isize, isizes, isize_range, isize_min, isize_max);

unsigned_gens!(u8, u8s, u8_range, u8_min, u8_max);
unsigned_gens!(u16, u16s, u16_range, u16_min, u16_max);
unsigned_gens!(u32, u32s, u32_range, u32_min, u32_max);
unsigned_gens!(u64, u64s, u64_range, u64_min, u64_max);
unsigned_gens!(usize, usizes, usize_range, usize_min, usize_max);
