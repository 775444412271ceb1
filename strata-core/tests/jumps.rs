/// Jump resolution: loops, labels and switch fallthru.
use strata_ast::build::Builder;
use strata_ast::{DeclRef, Primop, StmtRef, Type};
use strata_core::{Checker, ErrorKind};

fn void_fn(b: &Builder, body: StmtRef) -> DeclRef {
    b.fn_decl("f", vec![("x", Type::sint())], Type::void(), body)
}

#[test]
fn break_and_continue_need_an_enclosing_loop() {
    let b = Builder::new();
    let d = void_fn(&b, b.seq(vec![b.break_(), b.continue_()]));

    let err = Checker::new().check_program(&[d]).expect_err("both jumps dangle");
    assert_eq!(err.count(ErrorKind::Jump), 2, "{:?}", err.errors);
    assert!(err.errors.iter().any(|e| e.message.contains("break not in a loop")));
    assert!(err.errors.iter().any(|e| e.message.contains("continue not in a loop")));
}

#[test]
fn break_inside_a_switch_leaves_the_switch() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![
            b.clause(b.pint(0), None, b.break_()),
            b.clause(b.pwild(), None, b.skip()),
        ],
    );
    let d = void_fn(&b, b.while_(b.var("x"), b.seq(vec![sw, b.break_()])));

    assert!(Checker::new().check_program(&[d]).is_ok());
}

#[test]
fn continue_inside_a_switch_needs_a_loop() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![
            b.clause(b.pint(0), None, b.continue_()),
            b.clause(b.pwild(), None, b.skip()),
        ],
    );
    let d = void_fn(&b, sw);

    let err = Checker::new().check_program(&[d]).expect_err("no loop to continue");
    assert_eq!(err.count(ErrorKind::Jump), 1);
}

#[test]
fn backward_goto_forms_a_loop() {
    let b = Builder::new();
    let body = b.label(
        "again",
        b.if_(
            b.prim(Primop::Gt, vec![b.var("x"), b.int(0)]),
            b.seq(vec![
                b.exp_s(b.assign_op(b.var("x"), Primop::Minus, b.int(1))),
                b.goto("again"),
            ]),
            b.skip(),
        ),
    );
    let d = void_fn(&b, body);

    assert!(Checker::new().check_program(&[d]).is_ok());
}

#[test]
fn goto_to_an_undefined_label_is_reported() {
    let b = Builder::new();
    let d = void_fn(&b, b.seq(vec![b.goto("exit"), b.label("done", b.skip())]));

    let err = Checker::new().check_program(&[d]).expect_err("no label exit");
    assert_eq!(err.errors.len(), 1);
    assert_eq!(err.errors[0].kind, ErrorKind::Jump);
    assert!(err.errors[0].message.contains("label exit undefined"));
}

#[test]
fn repeated_label_is_reported() {
    let b = Builder::new();
    let d = void_fn(
        &b,
        b.seq(vec![b.label("here", b.skip()), b.label("here", b.skip())]),
    );

    let err = Checker::new().check_program(&[d]).expect_err("label here twice");
    assert!(err.errors[0].message.contains("repeated label here"));
}

#[test]
fn explicit_fallthru_reaches_the_next_clause() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![
            b.clause(b.pint(0), None, b.fallthru()),
            b.clause(b.pint(1), None, b.break_()),
            b.clause(b.pwild(), None, b.skip()),
        ],
    );
    let d = void_fn(&b, sw);

    assert!(Checker::new().check_program(&[d]).is_ok());
}

#[test]
fn fallthru_out_of_the_last_clause_is_reported() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![b.clause(b.pwild(), None, b.fallthru())],
    );
    let d = void_fn(&b, sw);

    let err = Checker::new().check_program(&[d]).expect_err("nothing to fall into");
    assert!(err.errors[0].message.contains("fallthru not in a non-last case"));
}

#[test]
fn fallthru_into_a_binding_clause_is_reported() {
    let b = Builder::new();
    let sw = b.switch(
        b.var("x"),
        vec![
            b.clause(b.pint(0), None, b.fallthru()),
            b.clause(b.pvar("y"), None, b.exp_s(b.var("y"))),
        ],
    );
    let d = void_fn(&b, sw);

    let err = Checker::new().check_program(&[d]).expect_err("y would be unbound");
    assert_eq!(err.errors.len(), 1);
    assert_eq!(err.errors[0].kind, ErrorKind::Jump);
}
