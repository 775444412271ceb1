/// Definite initialization and NULL tracking through whole functions.
use strata_ast::build::{Builder, FnSig};
use strata_ast::{FnAttr, Primop, Type};
use strata_core::{Checker, ErrorKind};

#[test]
fn deref_of_uninitialized_local_is_reported() {
    let b = Builder::new();
    let body = b.local(
        "p",
        Type::at(Type::sint(), Type::heap_rgn()),
        None,
        b.exp_s(b.deref(b.var("p"))),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new()
        .check_program(&[d])
        .expect_err("expected an initialization error");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.count(ErrorKind::Flow), 1);
    assert!(
        err.errors[0].message.contains("uninitialized"),
        "unexpected message: {}",
        err.errors[0].message
    );
}

#[test]
fn assignment_initializes_before_use() {
    let b = Builder::new();
    let body = b.local(
        "p",
        Type::at(Type::sint(), Type::heap_rgn()),
        None,
        b.seq(vec![
            b.exp_s(b.assign(b.var("p"), b.new_(b.int(3)))),
            b.exp_s(b.deref(b.var("p"))),
        ]),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let warnings = Checker::new().check_program(&[d]).expect("program should check");
    assert!(warnings.is_empty(), "{warnings:?}");
}

#[test]
fn initialized_only_on_one_branch_is_reported() {
    let b = Builder::new();
    let body = b.local(
        "x",
        Type::sint(),
        None,
        b.seq(vec![
            b.if_(b.var("c"), b.exp_s(b.assign(b.var("x"), b.int(1))), b.skip()),
            b.ret(Some(b.var("x"))),
        ]),
    );
    let d = b.fn_decl("f", vec![("c", Type::sint())], Type::sint(), body);

    let err = Checker::new()
        .check_program(&[d])
        .expect_err("x is not initialized on the else branch");
    assert_eq!(err.count(ErrorKind::Flow), 1, "{:?}", err.errors);
    assert!(err.errors[0].message.contains("may not be fully initialized"));
}

#[test]
fn deref_of_null_is_reported() {
    let b = Builder::new();
    let body = b.local(
        "p",
        Type::star(Type::sint(), Type::heap_rgn()),
        Some(b.null()),
        b.exp_s(b.deref(b.var("p"))),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new().check_program(&[d]).expect_err("NULL dereference");
    assert_eq!(err.errors.len(), 1);
    assert_eq!(err.errors[0].kind, ErrorKind::Flow);
    assert!(err.errors[0].message.contains("NULL"));
}

#[test]
fn non_void_function_must_return_on_every_path() {
    let b = Builder::new();
    let missing = b.fn_decl(
        "f",
        vec![("c", Type::sint())],
        Type::sint(),
        b.if_(b.var("c"), b.ret(Some(b.int(1))), b.skip()),
    );
    let complete = b.fn_decl(
        "g",
        vec![("c", Type::sint())],
        Type::sint(),
        b.if_(b.var("c"), b.ret(Some(b.int(1))), b.ret(Some(b.int(2)))),
    );

    let err = Checker::new()
        .check_program(&[missing, complete])
        .expect_err("f falls off its end");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert!(
        err.errors[0].message.contains("function f may not return a value"),
        "unexpected message: {}",
        err.errors[0].message
    );
}

#[test]
fn initializes_attribute_requires_a_write() {
    let b = Builder::new();
    let ptr = Type::at(Type::sint(), Type::heap_rgn());
    let lazy = b.fn_decl_sig(
        "lazy",
        FnSig::new(Type::void())
            .param("out", ptr.clone())
            .attr(FnAttr::Initializes(0)),
        b.skip(),
    );
    let eager = b.fn_decl_sig(
        "eager",
        FnSig::new(Type::void())
            .param("out", ptr)
            .attr(FnAttr::Initializes(0)),
        b.exp_s(b.assign(b.deref(b.var("out")), b.int(1))),
    );

    let err = Checker::new()
        .check_program(&[lazy, eager])
        .expect_err("lazy never writes through out");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert!(err.errors[0].message.contains("initializes attribute violated"));
}

#[test]
fn comparison_operands_must_be_initialized() {
    let b = Builder::new();
    let body = b.local(
        "x",
        Type::sint(),
        None,
        b.exp_s(b.prim(Primop::Lt, vec![b.var("x"), b.int(3)])),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new().check_program(&[d]).expect_err("x is read uninitialized");
    assert_eq!(err.count(ErrorKind::Flow), 1);
}

#[test]
fn switch_clause_may_not_fall_off_its_end() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![
            b.clause(b.pint(1), None, b.exp_s(b.assign(b.var("x"), b.int(2)))),
            b.clause(b.pwild(), None, b.skip()),
        ],
    );
    let d = b.fn_decl("f", vec![("x", Type::sint())], Type::void(), sw);

    let err = Checker::new().check_program(&[d]).expect_err("implicit fallthru");
    assert_eq!(err.errors.len(), 1);
    assert!(err.errors[0].message.contains("implicitly fallthru"));
}

#[test]
fn switch_clauses_ending_in_break_are_fine() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![
            b.clause(
                b.pint(1),
                None,
                b.seq(vec![b.exp_s(b.assign(b.var("x"), b.int(2))), b.break_()]),
            ),
            b.clause(b.pwild(), None, b.skip()),
        ],
    );
    let d = b.fn_decl("f", vec![("x", Type::sint())], Type::void(), sw);

    assert!(Checker::new().check_program(&[d]).is_ok());
}

fn unique_int() -> strata_ast::Ty {
    Type::at(Type::sint(), Type::unique_rgn())
}

#[test]
fn moving_an_uninitialized_unique_pointer_is_reported() {
    let b = Builder::new();
    let sink = b.fn_decl("sink", vec![("q", unique_int())], Type::void(), b.skip());
    let arg = b.var("p");
    let body = b.local(
        "p",
        unique_int(),
        None,
        b.exp_s(b.call_named("sink", vec![arg.clone()])),
    );
    let d = b.fn_decl("f", vec![], Type::void(), body);

    let err = Checker::new()
        .check_program(&[sink, d])
        .expect_err("p is passed before it is written");
    assert_eq!(err.errors.len(), 1, "{:?}", err.errors);
    assert_eq!(err.errors[0].kind, ErrorKind::Flow);
    assert_eq!(err.errors[0].span, arg.span);
    assert!(err.errors[0].message.contains("may not be fully initialized"));
}

#[test]
fn returning_an_uninitialized_unique_pointer_is_reported() {
    let b = Builder::new();
    let body = b.local("p", unique_int(), None, b.ret(Some(b.var("p"))));
    let d = b.fn_decl("f", vec![], unique_int(), body);

    let err = Checker::new()
        .check_program(&[d])
        .expect_err("p is returned before it is written");
    assert_eq!(err.count(ErrorKind::Flow), 1, "{:?}", err.errors);
    assert!(err.errors[0].message.contains("may not be fully initialized"));
}

#[test]
fn unique_pointer_written_before_the_move_is_fine() {
    let b = Builder::new();
    let sink = b.fn_decl("sink", vec![("q", unique_int())], Type::void(), b.skip());
    let body = b.local(
        "p",
        unique_int(),
        None,
        b.seq(vec![
            b.exp_s(b.assign(b.var("p"), b.var("fresh"))),
            b.exp_s(b.call_named("sink", vec![b.var("p")])),
        ]),
    );
    let d = b.fn_decl("f", vec![("fresh", unique_int())], Type::void(), body);

    let warnings = Checker::new().check_program(&[sink, d]).expect("p holds fresh");
    assert!(warnings.is_empty(), "{warnings:?}");
}
