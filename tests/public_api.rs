use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tapecheck::collections::{vec_of, vec_of_n};
use tapecheck::integers::{i64s, u8s};
use tapecheck::{
    check_with, replay, run_once, sampled_from, Config, RandomBitStream, StdTb, Tb,
};

fn quiet_cfg() -> Config {
    Config {
        no_fail_file: true,
        shrink_time: Duration::from_secs(5),
        ..Config::default()
    }
}

#[test]
fn sorting_is_idempotent() {
    check_with("sorting_is_idempotent", &quiet_cfg(), |t| {
        let mut v = vec_of(i64s()).draw(t, "v");
        v.sort_unstable();
        let w = v.clone();
        v.sort_unstable();
        assert_eq!(v, w);
    });
}

#[test]
fn concat_preserves_length() {
    check_with("concat_preserves_length", &quiet_cfg(), |t| {
        let a = vec_of(u8s()).draw(t, "a");
        let b = vec_of(u8s()).draw(t, "b");
        let mut c = a.clone();
        c.extend_from_slice(&b);
        assert_eq!(c.len(), a.len() + b.len());
    });
}

#[test]
fn failing_property_panics_the_test() {
    let res = catch_unwind(AssertUnwindSafe(|| {
        check_with("broken_sort", &quiet_cfg(), |t| {
            let v = vec_of_n(i64s(), 2, 8).draw(t, "v");
            let mut sorted = v.clone();
            sorted.sort_unstable();
            // wrong: input order is not always sorted order
            assert_eq!(v, sorted);
        });
    }));
    assert!(res.is_err(), "a falsifiable property must fail the test");
}

#[test]
fn skipped_cases_fail_the_check_when_exhausted() {
    let tb = StdTb::new("all_skipped");
    let res = catch_unwind(AssertUnwindSafe(|| {
        tapecheck::check_tb(&tb, &quiet_cfg(), |t| t.skip("never valid"));
    }));
    assert!(res.is_err());
    assert!(tb.failed());
}

#[test]
fn example_is_deterministic_per_seed() {
    let g = vec_of(i64s());
    assert_eq!(g.example(99).unwrap(), g.example(99).unwrap());
}

#[test]
fn replay_is_pure() {
    let g = sampled_from(vec!["a", "b", "c"]);

    let mut s = RandomBitStream::new(0x5eed, true);
    let first = Cell::new("");
    run_once(&mut s, |t| first.set(g.draw(t, "s")));

    let tape = s.take_record().data;
    for _ in 0..3 {
        let again = Cell::new("");
        let err = replay(&tape, |t| again.set(g.draw(t, "s")));
        assert!(err.is_none());
        assert_eq!(again.get(), first.get());
    }
}

#[test]
fn fail_file_replay_reproduces_failure() {
    use tapecheck::{save_fail_file, FAIL_FILE_VERSION};

    let prop = |t: &mut tapecheck::T<'_>| {
        let v = u8s().draw(t, "v");
        assert!(v != v, "always fails");
    };

    let mut s = RandomBitStream::new(7, true);
    let err = run_once(&mut s, prop);
    assert!(err.is_some());
    let tape = s.take_record().data;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("repro.fail");
    save_fail_file(&path, FAIL_FILE_VERSION, b"", 7, &tape).expect("save");

    let cfg = Config {
        fail_file: Some(path),
        ..quiet_cfg()
    };
    let res = catch_unwind(AssertUnwindSafe(|| {
        check_with("fail_file_replay", &cfg, prop);
    }));
    assert!(res.is_err(), "replayed fail file must fail the check");
}

#[test]
fn unknown_fail_file_version_is_ignored() {
    use tapecheck::save_fail_file;

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("stale.fail");
    save_fail_file(&path, "some-future-version", b"", 7, &[1, 2, 3]).expect("save");

    let cfg = Config {
        fail_file: Some(path),
        ..quiet_cfg()
    };
    // the stale file is skipped and the (true) property passes normally
    check_with("stale_fail_file", &cfg, |t| {
        let v = u8s().draw(t, "v");
        assert!(u16::from(v) < 256);
    });
}

#[test]
fn cleanup_and_cancellation_fire_for_every_case() {
    use std::rc::Rc;

    let runs = Cell::new(0usize);
    let cleanups = Rc::new(Cell::new(0usize));

    let cfg = Config {
        checks: 10,
        ..quiet_cfg()
    };
    check_with("cleanup_per_case", &cfg, |t| {
        runs.set(runs.get() + 1);
        let token = t.cancel_token();
        let counter = Rc::clone(&cleanups);
        t.cleanup(move || {
            assert!(token.is_cancelled(), "teardown cancels before cleanups");
            counter.set(counter.get() + 1);
        });
        u8s().draw(t, "x");
    });
    assert_eq!(runs.get(), 10);
    assert_eq!(cleanups.get(), 10);
}
