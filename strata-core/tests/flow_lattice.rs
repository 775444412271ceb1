/// Algebraic laws of the flow lattice, checked on random scalar states.
use miette::Result;
use proptest::{
    prelude::prop,
    test_runner::{Config, TestCaseError, TestRunner},
};
use strata_ast::{span, Type};
use strata_core::flow::{
    flow_lessthan_approx, is_unique_consumed, join_absrval, join_flow, make_unique_consumed,
    AbsRVal, FlowDict, FlowInfo, InitLevel, Root,
};

/// Scalar values plus consumed wrappers around them. Addresses are left
/// out: joining them escapes their targets, which is not a pure law.
fn value(code: u8) -> AbsRVal {
    let il = |all: bool| if all { InitLevel::AllIL } else { InitLevel::NoneIL };
    match code % 8 {
        0 => AbsRVal::Zero,
        1 => AbsRVal::NotZeroAll,
        2 | 3 => AbsRVal::UnknownR(il(code % 8 == 2)),
        4 | 5 => AbsRVal::Esc(il(code % 8 == 4)),
        _ => make_unique_consumed(
            span(usize::from(code / 8), 1),
            0,
            value(code / 8 % 6),
            false,
        ),
    }
}

/// A reachable state over parameter slots 0..4; `None` entries are absent.
fn state(codes: &[Option<u8>]) -> FlowInfo {
    let mut d = FlowDict::new();
    for (i, code) in codes.iter().enumerate() {
        if let Some(code) = code {
            d.insert(Root::InitParam(i, Type::sint()), value(*code));
        }
    }
    FlowInfo::Reachable(d)
}

fn runner() -> TestRunner {
    TestRunner::new(Config {
        cases: 256,
        ..Config::default()
    })
}

fn check(cond: bool, what: impl FnOnce() -> String) -> std::result::Result<(), TestCaseError> {
    if cond {
        Ok(())
    } else {
        Err(TestCaseError::fail(what()))
    }
}

fn fail(e: impl std::fmt::Display) -> miette::Report {
    miette::miette!("{e}")
}

#[test]
fn value_join_is_a_semilattice() -> Result<()> {
    runner()
        .run(&(0u8..48, 0u8..48, 0u8..48), |(a, b, c)| {
            let (a, b, c) = (value(a), value(b), value(c));
            check(join_absrval(&a, &a) == a, || format!("join not idempotent on {a}"))?;
            check(join_absrval(&a, &b) == join_absrval(&b, &a), || {
                format!("join not commutative on {a}, {b}")
            })?;
            let left = join_absrval(&join_absrval(&a, &b), &c);
            let right = join_absrval(&a, &join_absrval(&b, &c));
            check(left == right, || {
                format!("join not associative on {a}, {b}, {c}: {left} vs {right}")
            })
        })
        .map_err(fail)
}

#[test]
fn consumption_survives_any_join() -> Result<()> {
    runner()
        .run(&(6u8..48, 0u8..48), |(consumed, other)| {
            let consumed = value(if consumed % 8 < 6 { consumed | 7 } else { consumed });
            let joined = join_absrval(&consumed, &value(other));
            check(is_unique_consumed(&joined), || {
                format!("{consumed} joined into {joined}")
            })
        })
        .map_err(fail)
}

#[test]
fn join_is_an_upper_bound_of_both_states() -> Result<()> {
    let slots = prop::collection::vec(prop::option::of(0u8..48), 4);
    runner()
        .run(&(slots.clone(), slots), |(xs, ys)| {
            let (f1, f2) = (state(&xs), state(&ys));
            let j = join_flow(&f1, &f2);
            check(flow_lessthan_approx(&f1, &j), || format!("{f1} is not below {j}"))?;
            check(flow_lessthan_approx(&f2, &j), || format!("{f2} is not below {j}"))?;
            check(flow_lessthan_approx(&j, &j), || format!("{j} is not below itself"))
        })
        .map_err(fail)
}

#[test]
fn bottom_is_the_identity_of_join() -> Result<()> {
    let slots = prop::collection::vec(prop::option::of(0u8..48), 4);
    runner()
        .run(&slots, |xs| {
            let f = state(&xs);
            check(join_flow(&FlowInfo::Bottom, &f) == f, || format!("bottom joined with {f}"))?;
            check(join_flow(&f, &FlowInfo::Bottom) == f, || format!("{f} joined with bottom"))?;
            check(flow_lessthan_approx(&FlowInfo::Bottom, &f), || {
                format!("bottom is not below {f}")
            })
        })
        .map_err(fail)
}

#[test]
fn reachable_state_is_never_below_bottom() {
    let f = state(&[Some(1), None, Some(3), None]);
    assert!(!flow_lessthan_approx(&f, &FlowInfo::Bottom));
}

#[test]
fn root_missing_on_one_side_becomes_escaped_and_uninitialized() {
    let f1 = state(&[Some(1), None, None, None]);
    let f2 = state(&[None, None, None, None]);
    let j = join_flow(&f1, &f2);
    let d = j.dict().expect("join of reachable states is reachable");
    assert_eq!(
        d.get(&Root::InitParam(0, Type::sint())),
        Some(&AbsRVal::Esc(InitLevel::NoneIL))
    );
}
