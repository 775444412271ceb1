/// Consumption of unique pointers across branches, loops and calls.
use strata_ast::build::{Builder, FnSig};
use strata_ast::{DeclRef, FnAttr, Kind, StmtRef, Ty, Tvar, Type};
use strata_core::{Checker, ErrorKind};

fn uptr() -> Ty {
    Type::at(Type::sint(), Type::unique_rgn())
}

fn sink(b: &Builder) -> DeclRef {
    b.fn_decl("sink", vec![("q", uptr())], Type::void(), b.skip())
}

fn consume_p(b: &Builder) -> StmtRef {
    b.exp_s(b.call_named("sink", vec![b.var("p")]))
}

fn owner(b: &Builder, body: StmtRef) -> DeclRef {
    b.fn_decl("f", vec![("p", uptr()), ("c", Type::sint())], Type::void(), body)
}

#[test]
fn consuming_twice_is_reported() {
    let b = Builder::new();
    let f = owner(&b, b.seq(vec![consume_p(&b), consume_p(&b)]));

    let err = Checker::new()
        .check_program(&[sink(&b), f])
        .expect_err("p is consumed twice");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.count(ErrorKind::Unique), 1);
    assert!(
        err.errors[0].message.contains("may have already been consumed"),
        "unexpected message: {}",
        err.errors[0].message
    );
}

#[test]
fn consuming_on_both_branches_is_fine() {
    let b = Builder::new();
    let f = owner(&b, b.if_(b.var("c"), consume_p(&b), consume_p(&b)));

    let warnings = Checker::new()
        .check_program(&[sink(&b), f])
        .expect("each path consumes p once");
    assert!(warnings.is_empty());
}

#[test]
fn consuming_after_a_consuming_join_is_reported() {
    let b = Builder::new();
    let moved = b.var("p");
    let f = owner(
        &b,
        b.seq(vec![
            b.if_(b.var("c"), consume_p(&b), consume_p(&b)),
            b.exp_s(b.call_named("sink", vec![moved.clone()])),
        ]),
    );

    let err = Checker::new()
        .check_program(&[sink(&b), f])
        .expect_err("p is consumed after the join");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.errors[0].kind, ErrorKind::Unique);
    assert_eq!(err.errors[0].span, moved.span);
}

#[test]
fn consumption_on_one_branch_survives_the_join() {
    let b = Builder::new();
    let f = owner(
        &b,
        b.seq(vec![b.if_(b.var("c"), consume_p(&b), b.skip()), consume_p(&b)]),
    );

    let err = Checker::new()
        .check_program(&[sink(&b), f])
        .expect_err("p may be consumed on the then branch");
    assert_eq!(err.count(ErrorKind::Unique), 1);
}

#[test]
fn consuming_inside_a_loop_is_reported() {
    let b = Builder::new();
    let f = owner(&b, b.while_(b.var("c"), consume_p(&b)));

    let err = Checker::new()
        .check_program(&[sink(&b), f])
        .expect_err("the second iteration consumes p again");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert!(
        err.errors[0]
            .message
            .contains("consumed in a previous loop iteration"),
        "unexpected message: {}",
        err.errors[0].message
    );
}

#[test]
fn deref_after_consumption_is_reported() {
    let b = Builder::new();
    let f = owner(&b, b.seq(vec![consume_p(&b), b.exp_s(b.deref(b.var("p")))]));

    let err = Checker::new()
        .check_program(&[sink(&b), f])
        .expect_err("p is dereferenced after it was moved");
    assert_eq!(err.errors.len(), 1);
    assert!(err.errors[0].message.contains("dereference of consumed unique pointer"));
}

#[test]
fn reassignment_makes_a_pointer_live_again() {
    let b = Builder::new();
    let f = b.fn_decl(
        "f",
        vec![("p", uptr()), ("fresh", uptr())],
        Type::void(),
        b.seq(vec![
            consume_p(&b),
            b.exp_s(b.assign(b.var("p"), b.var("fresh"))),
            consume_p(&b),
        ]),
    );
    let warnings = Checker::new()
        .check_program(&[sink(&b), f])
        .expect("p holds a new pointer before the second call");
    assert!(warnings.is_empty());
}

#[test]
fn refilling_on_one_branch_keeps_the_pointer_live_after_the_join() {
    let b = Builder::new();
    let f = b.fn_decl(
        "f",
        vec![("p", uptr()), ("fresh", uptr()), ("c", Type::sint())],
        Type::void(),
        b.seq(vec![
            b.if_(
                b.var("c"),
                b.seq(vec![
                    consume_p(&b),
                    b.exp_s(b.assign(b.var("p"), b.var("fresh"))),
                ]),
                b.skip(),
            ),
            consume_p(&b),
        ]),
    );

    assert!(Checker::new().check_program(&[sink(&b), f]).is_ok());
}

#[test]
fn noconsume_parameter_may_not_be_consumed() {
    let b = Builder::new();
    let borrower = b.fn_decl_sig(
        "peek",
        FnSig::new(Type::void())
            .param("p", uptr())
            .attr(FnAttr::Noconsume(0)),
        b.exp_s(b.deref(b.var("p"))),
    );
    let thief = b.fn_decl_sig(
        "steal",
        FnSig::new(Type::void())
            .param("p", uptr())
            .attr(FnAttr::Noconsume(0)),
        consume_p(&b),
    );

    let err = Checker::new()
        .check_program(&[sink(&b), borrower, thief])
        .expect_err("steal consumes its noconsume parameter");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert!(err.errors[0].message.contains("noconsume parameter"));
}

#[test]
fn passing_to_a_noconsume_parameter_keeps_ownership() {
    let b = Builder::new();
    let peek = b.fn_decl_sig(
        "peek",
        FnSig::new(Type::void())
            .param("q", uptr())
            .attr(FnAttr::Noconsume(0)),
        b.skip(),
    );
    let f = owner(
        &b,
        b.seq(vec![
            b.exp_s(b.call_named("peek", vec![b.var("p")])),
            b.exp_s(b.call_named("peek", vec![b.var("p")])),
            consume_p(&b),
        ]),
    );

    assert!(Checker::new().check_program(&[sink(&b), peek, f]).is_ok());
}

fn may_fail(b: &Builder) -> DeclRef {
    b.fn_decl("may_fail", vec![], Type::void(), b.skip())
}

#[test]
fn consumption_in_a_try_body_is_visible_in_the_handler() {
    let b = Builder::new();
    let again = b.var("p");
    let f = owner(
        &b,
        b.try_catch(
            consume_p(&b),
            vec![b.clause(
                b.pwild(),
                None,
                b.exp_s(b.call_named("sink", vec![again.clone()])),
            )],
        ),
    );

    let err = Checker::new()
        .check_program(&[sink(&b), f])
        .expect_err("sink may throw after taking p");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.errors[0].kind, ErrorKind::Unique);
    assert_eq!(err.errors[0].span, again.span);
}

#[test]
fn handler_consumption_reaches_the_code_after_the_try() {
    let b = Builder::new();
    let after = b.var("p");
    let f = owner(
        &b,
        b.seq(vec![
            b.try_catch(
                b.exp_s(b.call_named("may_fail", vec![])),
                vec![b.clause(b.pwild(), None, consume_p(&b))],
            ),
            b.exp_s(b.call_named("sink", vec![after.clone()])),
        ]),
    );

    let err = Checker::new()
        .check_program(&[sink(&b), may_fail(&b), f])
        .expect_err("the handler path already moved p");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.errors[0].span, after.span);
}

#[test]
fn alias_scope_left_by_an_exception_gives_the_pointer_back() {
    let b = Builder::new();
    let r = Tvar::new("`r", Kind::Rgn);
    let borrowed = b.let_(
        b.palias(&r, "q", Type::at(Type::sint(), Type::var(&r))),
        b.var("p"),
        b.exp_s(b.call_named("may_fail", vec![])),
    );
    let f = owner(
        &b,
        b.try_catch(borrowed, vec![b.clause(b.pwild(), None, consume_p(&b))]),
    );

    let warnings = Checker::new()
        .check_program(&[sink(&b), may_fail(&b), f])
        .expect("p is only lent to q inside the try body");
    assert!(warnings.is_empty(), "{warnings:?}");
}
