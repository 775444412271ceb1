/// Type utilities on random types: compression, comparison and unification.
use proptest::{
    prelude::prop,
    test_runner::{Config, TestCaseError, TestRunner},
};
use strata_ast::{Kind, Ty, Type};
use strata_core::tcutil::{compress, free_evars, is_unique_pointer, typecmp, unify};
use strata_core::Ctx;

/// Builds a type from a preorder list of constructor codes.
fn build(codes: &mut std::slice::Iter<'_, u8>, depth: usize) -> Ty {
    let Some(code) = codes.next() else {
        return Type::sint();
    };
    if depth == 0 {
        return match code % 3 {
            0 => Type::sint(),
            1 => Type::uint(),
            _ => Type::char(),
        };
    }
    match code % 7 {
        0 => Type::sint(),
        1 => Type::char(),
        2 => Type::at(build(codes, depth - 1), Type::heap_rgn()),
        3 => Type::star(build(codes, depth - 1), Type::unique_rgn()),
        4 => Type::tuple(vec![build(codes, depth - 1), build(codes, depth - 1)]),
        5 => Type::fat(build(codes, depth - 1), Type::heap_rgn()),
        _ => Type::uint(),
    }
}

fn ty(codes: &[u8]) -> Ty {
    build(&mut codes.iter(), 3)
}

/// Wraps `t` in a chain of `links` evars, each resolved to the next.
fn behind_evars(ctx: &Ctx, t: &Ty, links: usize) -> Result<Ty, TestCaseError> {
    let mut head = t.clone();
    for _ in 0..links {
        let ev = Type::evar(Some(Kind::Any), None);
        if !unify(ctx, &ev, &head) {
            return Err(TestCaseError::fail(format!("fresh evar does not unify with {head}")));
        }
        head = ev;
    }
    Ok(head)
}

fn runner() -> TestRunner {
    TestRunner::new(Config {
        cases: 128,
        ..Config::default()
    })
}

#[test]
fn compression_is_idempotent_and_sees_through_evars() -> miette::Result<()> {
    let codes = prop::collection::vec(0u8..32, 1..12);
    runner()
        .run(&(codes, 0usize..4), |(codes, links)| {
            let ctx = Ctx::default();
            let t = ty(&codes);
            let wrapped = behind_evars(&ctx, &t, links)?;
            let once = compress(&wrapped);
            let twice = compress(&once);
            if !typecmp(&once, &twice) {
                return Err(TestCaseError::fail(format!("{once} compresses to {twice}")));
            }
            if !typecmp(&once, &t) {
                return Err(TestCaseError::fail(format!("{wrapped} compresses to {once}, not {t}")));
            }
            Ok(())
        })
        .map_err(|e| miette::miette!("{e}"))
}

#[test]
fn unification_is_reflexive_and_agrees_with_comparison() -> miette::Result<()> {
    let codes = prop::collection::vec(0u8..32, 1..12);
    runner()
        .run(&(codes.clone(), codes), |(a, b)| {
            let ctx = Ctx::default();
            let (t1, t2) = (ty(&a), ty(&b));
            if !typecmp(&t1, &t1) || !unify(&ctx, &t1, &t1) {
                return Err(TestCaseError::fail(format!("{t1} is not equal to itself")));
            }
            // Ground types unify exactly when they compare equal.
            let same = typecmp(&t1, &t2);
            if unify(&ctx, &t1, &t2) != same {
                return Err(TestCaseError::fail(format!(
                    "unify and typecmp disagree on {t1} and {t2}"
                )));
            }
            Ok(())
        })
        .map_err(|e| miette::miette!("{e}"))
}

#[test]
fn unified_evar_takes_the_other_side() {
    let ctx = Ctx::default();
    let ev = Type::evar(Some(Kind::Mem), None);
    let target = Type::at(Type::sint(), Type::unique_rgn());
    assert_eq!(free_evars(&ev).len(), 1);
    assert!(unify(&ctx, &ev, &target));
    assert!(is_unique_pointer(&ev));
    assert!(free_evars(&ev).is_empty());
    assert!(typecmp(&compress(&ev), &target));
}

#[test]
fn failed_unification_leaves_evars_unresolved() {
    let ctx = Ctx::default();
    let ev = Type::evar(Some(Kind::Mem), None);
    let pair = Type::tuple(vec![ev.clone(), Type::sint()]);
    let other = Type::tuple(vec![Type::char(), Type::at(Type::sint(), Type::heap_rgn())]);
    assert!(!unify(&ctx, &pair, &other));
    assert_eq!(free_evars(&ev).len(), 1, "evar was left bound after a failed unification");
}

#[test]
fn region_evar_cannot_take_a_value_type() {
    let ctx = Ctx::default();
    let ev = Type::evar(Some(Kind::Rgn), None);
    assert!(!unify(&ctx, &ev, &Type::sint()));
    assert!(unify(&ctx, &ev, &Type::heap_rgn()));
}
