/// Region lifetimes: pointers may only flow into regions they outlive.
use strata_ast::build::{Builder, FnSig};
use strata_ast::{Kind, Tvar, Ty, Type};
use strata_core::{Checker, ErrorKind};

fn int_in(rgn: &Tvar) -> Ty {
    Type::at(Type::sint(), Type::var(rgn))
}

#[test]
fn region_pointer_may_not_escape_to_a_heap_global() {
    let b = Builder::new();
    let r = Tvar::new("`r", Kind::Rgn);
    let global = b.global(
        "g",
        Type::star(Type::sint(), Type::heap_rgn()),
        Some(b.null()),
    );
    let body = b.region(
        &r,
        "h",
        false,
        b.exp_s(b.assign(b.var("g"), b.rnew(b.var("h"), b.int(3)))),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new()
        .check_program(&[global, d])
        .expect_err("the region dies before the global");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.count(ErrorKind::Region), 1);
    assert!(
        err.errors[0].message.contains("does not outlive"),
        "unexpected message: {}",
        err.errors[0].message
    );
}

#[test]
fn outer_region_pointer_may_be_stored_in_an_inner_region_pointer() {
    let b = Builder::new();
    let outer = Tvar::new("`outer", Kind::Rgn);
    let inner = Tvar::new("`inner", Kind::Rgn);
    let body = b.region(
        &outer,
        "ho",
        false,
        b.region(
            &inner,
            "hi",
            false,
            b.local(
                "q",
                int_in(&inner),
                Some(b.rnew(b.var("ho"), b.int(1))),
                b.exp_s(b.deref(b.var("q"))),
            ),
        ),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let warnings = Checker::new().check_program(&[d]).expect("outer outlives inner");
    assert!(warnings.is_empty());
}

#[test]
fn inner_region_pointer_may_not_be_stored_in_an_outer_region_pointer() {
    let b = Builder::new();
    let outer = Tvar::new("`outer", Kind::Rgn);
    let inner = Tvar::new("`inner", Kind::Rgn);
    let body = b.region(
        &outer,
        "ho",
        false,
        b.region(
            &inner,
            "hi",
            false,
            b.local(
                "q",
                int_in(&outer),
                Some(b.rnew(b.var("hi"), b.int(1))),
                b.skip(),
            ),
        ),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new()
        .check_program(&[d])
        .expect_err("inner does not outlive outer");
    assert_eq!(err.count(ErrorKind::Region), 1, "{:?}", err.errors);
}

#[test]
fn reset_of_a_plain_region_is_reported() {
    let b = Builder::new();
    let r = Tvar::new("`r", Kind::Rgn);
    let body = b.region(&r, "h", false, b.reset_region(b.var("h")));
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new().check_program(&[d]).expect_err("`r is not resetable");
    assert_eq!(err.errors.len(), 1);
    assert_eq!(err.errors[0].kind, ErrorKind::Region);
    assert!(err.errors[0].message.contains("not resetable"));
}

#[test]
fn reset_invalidates_pointers_into_the_region() {
    let b = Builder::new();
    let r = Tvar::new("`r", Kind::Rgn);
    let body = b.region(
        &r,
        "h",
        true,
        b.local(
            "p",
            int_in(&r),
            Some(b.rnew(b.var("h"), b.int(3))),
            b.seq(vec![
                b.exp_s(b.deref(b.var("p"))),
                b.reset_region(b.var("h")),
                b.exp_s(b.deref(b.var("p"))),
            ]),
        ),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new()
        .check_program(&[d])
        .expect_err("p dangles after the reset");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.errors[0].kind, ErrorKind::Flow);
}

#[test]
fn region_variable_cannot_be_reopened() {
    let b = Builder::new();
    let r = Tvar::new("`r", Kind::Rgn);
    let body = b.region(&r, "h", false, b.region(&r, "h2", false, b.skip()));
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new().check_program(&[d]).expect_err("`r is opened twice");
    assert!(
        err.errors.iter().any(|e| e.message.contains("already in scope")),
        "{:?}",
        err.errors
    );
}

#[test]
fn region_parameters_are_ordered_by_declared_constraints() {
    let b = Builder::new();
    let r1 = Tvar::new("`r1", Kind::Rgn);
    let r2 = Tvar::new("`r2", Kind::Rgn);
    let sig = FnSig::new(Type::void())
        .tvar(&r1)
        .tvar(&r2)
        .param("long_lived", int_in(&r1))
        .outlives(Type::access_eff(Type::var(&r1)), Type::var(&r2));
    let body = b.local(
        "short",
        int_in(&r2),
        Some(b.var("long_lived")),
        b.skip(),
    );
    let d = b.fn_decl_sig("f", sig, body);

    let warnings = Checker::new()
        .check_program(&[d])
        .expect("`r1 outlives `r2 by assumption");
    assert!(warnings.is_empty());
}
