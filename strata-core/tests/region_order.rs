/// The region partial order: nesting, declared constraints and cycles.
use miette::Result;
use proptest::test_runner::{Config, TestCaseError, TestRunner};
use strata_ast::{Kind, Tvar, Ty, Type};
use strata_core::rgnorder::{RgnOrderError, RgnPO};

fn rgn(name: &str) -> Tvar {
    Tvar::new(name, Kind::Rgn)
}

fn v(tv: &Tvar) -> Ty {
    Type::var(tv)
}

fn access(tv: &Tvar) -> Ty {
    Type::access_eff(Type::var(tv))
}

fn empty_effect() -> Ty {
    Type::join_eff(vec![])
}

/// The function region followed by `depth` nested region blocks.
fn nested(depth: usize) -> Result<(RgnPO, Vec<Tvar>)> {
    let fn_rgn = rgn("`f");
    let mut po = RgnPO::initial_fn_po(&[], &[], &empty_effect(), &fn_rgn)
        .map_err(|e| miette::miette!("{e}"))?;
    let mut chain = vec![fn_rgn];
    for i in 0..depth {
        let r = rgn(&format!("`b{i}"));
        po = po.add_youngest(&r, i % 2 == 0);
        chain.push(r);
    }
    Ok((po, chain))
}

#[test]
fn nesting_orders_regions_from_oldest_to_youngest() -> Result<()> {
    let mut runner = TestRunner::new(Config {
        cases: 32,
        ..Config::default()
    });
    runner
        .run(&(1usize..8, 0usize..8, 0usize..8), |(depth, i, j)| {
            let (po, chain) = nested(depth).map_err(|e| TestCaseError::fail(format!("{e}")))?;
            let (i, j) = (i % chain.len(), j % chain.len());
            let outlives = po.rgn_outlives_rgn(&v(&chain[i]), &v(&chain[j]));
            if outlives != (i <= j) {
                return Err(TestCaseError::fail(format!(
                    "{} outlives {} reported as {outlives} in {po}",
                    chain[i].name, chain[j].name
                )));
            }
            if !po.rgn_outlives_rgn(&Type::heap_rgn(), &v(&chain[j])) {
                return Err(TestCaseError::fail("the heap must outlive every region"));
            }
            if po.youngest() != &chain[chain.len() - 1] {
                return Err(TestCaseError::fail("youngest is not the last region opened"));
            }
            Ok(())
        })
        .map_err(|e| miette::miette!("{e}"))
}

#[test]
fn constraint_against_the_nesting_is_circular() -> Result<()> {
    let (po, chain) = nested(2)?;
    let err = po
        .add_outlives_constraint(&access(&chain[2]), &v(&chain[0]))
        .expect_err("the youngest region cannot outlive the oldest");
    assert!(matches!(err, RgnOrderError::Circular { .. }), "{err}");
    assert!(err.to_string().contains("circularity"));
    Ok(())
}

#[test]
fn constraint_on_an_unknown_region_is_rejected() -> Result<()> {
    let (po, chain) = nested(1)?;
    let stranger = rgn("`elsewhere");
    let err = po
        .add_outlives_constraint(&access(&chain[0]), &v(&stranger))
        .expect_err("`elsewhere is not in the order");
    assert!(matches!(err, RgnOrderError::UnknownRegion(_)), "{err}");
    let err = po
        .add_outlives_constraint(&access(&chain[0]), &Type::sint())
        .expect_err("int is not a region");
    assert!(matches!(err, RgnOrderError::NotARegion(_)), "{err}");
    Ok(())
}

#[test]
fn declared_parameter_constraints_are_transitive() -> Result<()> {
    let (a, b, c) = (rgn("`a"), rgn("`b"), rgn("`c"));
    let fn_rgn = rgn("`f");
    let po = RgnPO::initial_fn_po(
        &[a.clone(), b.clone(), c.clone()],
        &[(access(&a), v(&b)), (access(&b), v(&c))],
        &Type::join_eff(vec![access(&a), access(&b), access(&c)]),
        &fn_rgn,
    )
    .map_err(|e| miette::miette!("{e}"))?;

    assert!(po.rgn_outlives_rgn(&v(&a), &v(&c)));
    assert!(!po.rgn_outlives_rgn(&v(&c), &v(&a)));
    assert!(po.effect_outlives(&Type::join_eff(vec![access(&a), access(&b)]), &v(&c)));
    assert!(po.eff_outlives_eff(&access(&a), &Type::join_eff(vec![access(&b), access(&c)])));
    assert!(!po.eff_outlives_eff(&access(&c), &access(&b)));
    // Everything in the effect outlives the function's own region.
    assert!(po.rgn_outlives_rgn(&v(&c), &v(&fn_rgn)));
    Ok(())
}

#[test]
fn unordered_regions_relate_to_nothing_else() -> Result<()> {
    let (po, chain) = nested(1)?;
    let alias = rgn("`alias");
    let po = po.add_unordered(&alias);
    assert!(po.contains(&alias));
    assert!(!po.rgn_outlives_rgn(&v(&alias), &v(&chain[1])));
    assert!(!po.rgn_outlives_rgn(&v(&chain[0]), &v(&alias)));
    assert!(!po.is_region_resetable(&alias));
    assert!(po.is_region_resetable(&chain[1]));
    Ok(())
}

#[test]
fn satisfied_constraints_are_checked_against_the_order() -> Result<()> {
    let (po, chain) = nested(2)?;
    let ok = [(access(&chain[0]), v(&chain[2]))];
    let bad = [(access(&chain[2]), v(&chain[1]))];
    assert!(po.satisfies_constraints(&ok, &Type::heap_rgn(), false));
    assert!(!po.satisfies_constraints(&bad, &Type::heap_rgn(), false));
    Ok(())
}

#[test]
fn display_lists_every_region() -> Result<()> {
    let (po, _) = nested(2)?;
    let shown = po.to_string();
    assert!(shown.contains("`b0"), "{shown}");
    assert!(shown.contains("(resetable)"), "{shown}");
    assert!(shown.ends_with("youngest `b1]"), "{shown}");
    Ok(())
}
