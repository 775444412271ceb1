//! Statement checking.
//!
//! Besides typing, this pass resolves every jump to its target statement and
//! records the try depth of each statement; the flow engine relies on both.

use strata_ast::{ClauseRef, DeclKind, DeclRef, Kind, StmtKind, StmtRef, Type};

use super::expr::tc_test;
use super::pat::{PatResult, tc_pat};
use super::{fresh_evar, mismatch, tc_decl, tc_exp};
use crate::ctx::Ctx;
use crate::error::ErrorKind;
use crate::tcenv::Tenv;
use crate::tcutil::{
    check_type, coerce_assign, coerce_use, handle_region, is_void, tvar_kind, unify,
};

pub(crate) fn tc_stmt(ctx: &Ctx, te: &Tenv, s: &StmtRef) {
    s.try_depth.set(te.try_depth());
    match &s.kind {
        StmtKind::Skip => {}
        StmtKind::Exp(e) => {
            tc_exp(ctx, te, None, e);
        }
        StmtKind::Seq(a, b) => {
            tc_stmt(ctx, te, a);
            tc_stmt(ctx, te, b);
        }
        StmtKind::Return(eopt) => tc_return(ctx, te, s, eopt.as_ref()),
        StmtKind::IfThenElse(c, then, els) => {
            tc_test(ctx, te, c, "if guard");
            tc_stmt(ctx, te, then);
            tc_stmt(ctx, te, els);
        }
        StmtKind::While(cond, body) => {
            tc_test(ctx, te, &cond.exp, "while guard");
            tc_stmt(ctx, &te.set_in_loop(s, &cond.point), body);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            tc_exp(ctx, te, None, init);
            tc_test(ctx, te, &cond.exp, "for guard");
            tc_exp(ctx, te, None, &step.exp);
            tc_stmt(ctx, &te.set_in_loop(s, &step.point), body);
        }
        StmtKind::Do(body, cond) => {
            tc_stmt(ctx, &te.set_in_loop(s, &cond.point), body);
            tc_test(ctx, te, &cond.exp, "do-while guard");
        }
        StmtKind::Break(_) => te.process_break(ctx, s),
        StmtKind::Continue(_) => te.process_continue(ctx, s),
        StmtKind::Goto(label, _) => te.process_goto(s, label),
        StmtKind::Fallthru(_) => {
            if te.process_fallthru(ctx, s).is_some_and(|vars| !vars.is_empty()) {
                ctx.error(
                    ErrorKind::Jump,
                    s.span,
                    "fallthru into a case whose pattern binds variables",
                );
            }
        }
        StmtKind::Switch(scrut, clauses) => {
            let t = tc_exp(ctx, te, None, scrut);
            let results = clauses
                .iter()
                .map(|c| {
                    let r = tc_pat(ctx, te, &c.pat, &t);
                    *c.pat_vars.borrow_mut() = Some(r.vars.clone());
                    r
                })
                .collect();
            tc_clauses(ctx, &te.set_in_switch(s), clauses, results);
        }
        StmtKind::TryCatch(body, clauses) => {
            tc_stmt(ctx, &te.enter_try(), body);
            let results = clauses
                .iter()
                .map(|c| {
                    let r = tc_pat(ctx, te, &c.pat, &fresh_evar(Kind::Mem));
                    *c.pat_vars.borrow_mut() = Some(r.vars.clone());
                    r
                })
                .collect();
            tc_clauses(ctx, te, clauses, results);
        }
        StmtKind::Decl(d, body) => tc_local_decl(ctx, te, d, body),
        StmtKind::Label(label, body) => {
            te.add_label(ctx, label, s);
            tc_stmt(ctx, te, body);
        }
        StmtKind::Region {
            tvar,
            vd,
            resetable,
            body,
        } => {
            if tvar_kind(tvar, Kind::Rgn) != Kind::Rgn {
                ctx.error(
                    ErrorKind::Kind,
                    s.span,
                    format!("region variable {} must have region kind", tvar.name),
                );
            }
            if te.lookup_type_vars().contains(tvar) {
                ctx.error(
                    ErrorKind::Region,
                    s.span,
                    format!("region {} is already in scope", tvar.name),
                );
            }
            let env = te.new_named_block(tvar, *resetable);
            let handle = Type::rgn_handle(Type::var(tvar));
            let vt = vd.ty();
            if !unify(ctx, &vt, &handle) {
                mismatch(
                    ctx,
                    vd.span,
                    format!("region handle {} has type {vt} but {handle} was expected", vd.name),
                );
            }
            tc_stmt(ctx, &env.add_local_var(vd), body);
        }
        StmtKind::ResetRegion(h) => {
            let t = tc_exp(ctx, te, None, h);
            match handle_region(&t) {
                Some(r) => te.check_rgn_accessible(ctx, s.span, &r),
                None => ctx.error(
                    ErrorKind::Type,
                    h.span,
                    format!("reset_region expects a region handle but found {t}"),
                ),
            }
        }
    }
}

fn tc_return(ctx: &Ctx, te: &Tenv, s: &StmtRef, eopt: Option<&strata_ast::ExpRef>) {
    let rt = te.return_typ();
    match eopt {
        None => {
            if !is_void(&rt) {
                ctx.error(
                    ErrorKind::Type,
                    s.span,
                    format!("must return a value of type {rt}"),
                );
            }
        }
        Some(e) if is_void(&rt) => {
            tc_exp(ctx, te, None, e);
            ctx.error(
                ErrorKind::Type,
                s.span,
                "returns a value in a function with void return type",
            );
        }
        Some(e) => {
            let t = tc_exp(ctx, te, Some(&rt), e);
            if !coerce_use(ctx, te, e, &rt) {
                mismatch(
                    ctx,
                    s.span,
                    format!("returns a value of type {t} but requires {rt}"),
                );
            }
        }
    }
}

/// Bodies of switch or catch clauses. A clause may fall through into the
/// next one; its pattern variables and alias regions are in scope in its
/// guard and body.
fn tc_clauses(ctx: &Ctx, te: &Tenv, clauses: &[ClauseRef], results: Vec<PatResult>) {
    for (i, (c, r)) in clauses.iter().zip(results).enumerate() {
        let next = clauses.get(i + 1).map(|n| {
            let vars = n.pat_vars.borrow().clone().unwrap_or_default();
            (n.body.clone(), vars)
        });
        let mut env = te.set_fallthru(next);
        for tv in &r.regions {
            env = env.add_region(tv);
        }
        for vd in &r.vars {
            env = env.add_pat_var(vd);
        }
        if let Some(g) = &c.guard {
            tc_test(ctx, &env, g, "switch clause guard");
        }
        tc_stmt(ctx, &env, &c.body);
    }
}

fn tc_local_decl(ctx: &Ctx, te: &Tenv, d: &DeclRef, body: &StmtRef) {
    match &d.kind {
        DeclKind::Var(vd) => {
            let t = vd.ty();
            check_type(ctx, te, vd.span, &[], Kind::Mem, true, &t);
            if let Some(init) = &vd.initializer {
                let ti = tc_exp(ctx, te, Some(&t), init);
                if !coerce_assign(ctx, te, init, &t) {
                    mismatch(
                        ctx,
                        init.span,
                        format!(
                            "{} declared with type {t} but initialized with type {ti}",
                            vd.name
                        ),
                    );
                }
            }
            tc_stmt(ctx, &te.add_local_var(vd), body);
        }
        DeclKind::Let {
            pat,
            pat_vars,
            init,
        } => {
            let ti = tc_exp(ctx, te, None, init);
            let r = tc_pat(ctx, te, pat, &ti);
            *pat_vars.borrow_mut() = Some(r.vars.clone());
            let mut env = te.clone();
            for tv in &r.regions {
                env = env.add_region(tv);
            }
            for vd in &r.vars {
                env = env.add_pat_var(vd);
            }
            tc_stmt(ctx, &env, body);
        }
        DeclKind::Fn(fd) => {
            ctx.error(
                ErrorKind::Type,
                d.span,
                format!("nested function {} is not supported", fd.name),
            );
            tc_stmt(ctx, te, body);
        }
        DeclKind::Aggr(_) | DeclKind::Datatype(_) | DeclKind::Enum(_) | DeclKind::Typedef(_) => {
            tc_decl(ctx, te, d);
            tc_stmt(ctx, te, body);
        }
        DeclKind::Namespace(..) | DeclKind::Using(..) => {
            ctx.error(
                ErrorKind::Type,
                d.span,
                "namespace declarations are only allowed at top level",
            );
            tc_stmt(ctx, te, body);
        }
    }
}

#[cfg(test)]
mod tests {
    use strata_ast::build::Builder;
    use strata_ast::{Tvar, Ty};

    use super::*;
    use crate::tc::tc;

    fn check(decls: &[DeclRef]) -> Ctx {
        let ctx = Ctx::default();
        tc(&ctx, &Tenv::new(), decls);
        ctx
    }

    fn int_at(rgn: Ty) -> Ty {
        Type::at(Type::sint(), rgn)
    }

    #[test]
    fn break_outside_loop_is_a_jump_error() {
        let b = Builder::new();
        let d = b.fn_decl("f", vec![], Type::void(), b.break_());
        let errors = check(&[d]).errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::Jump);
    }

    #[test]
    fn loop_jumps_are_resolved() {
        let b = Builder::new();
        let brk = b.break_();
        let cont = b.continue_();
        let lp = b.while_(b.int(1), b.seq(vec![cont.clone(), brk.clone()]));
        let d = b.fn_decl("f", vec![], Type::void(), lp.clone());
        assert!(check(&[d]).errors().is_empty());
        let StmtKind::Break(t) = &brk.kind else { unreachable!() };
        assert!(std::rc::Rc::ptr_eq(&t.get().unwrap(), &lp));
        let (StmtKind::Continue(t), StmtKind::While(cond, _)) = (&cont.kind, &lp.kind) else {
            unreachable!()
        };
        assert!(std::rc::Rc::ptr_eq(&t.get().unwrap(), &cond.point));
    }

    #[test]
    fn forward_goto_finds_its_label() {
        let b = Builder::new();
        let goto = b.goto("out");
        let target = b.label("out", b.skip());
        let d = b.fn_decl("f", vec![], Type::void(), b.seq(vec![goto.clone(), target.clone()]));
        assert!(check(&[d]).errors().is_empty());
        assert!(std::rc::Rc::ptr_eq(&goto.jump_target().unwrap().get().unwrap(), &target));
    }

    #[test]
    fn missing_label_is_reported() {
        let b = Builder::new();
        let d = b.fn_decl("f", vec![], Type::void(), b.goto("nowhere"));
        let errors = check(&[d]).errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("nowhere"));
    }

    #[test]
    fn return_type_is_enforced() {
        let b = Builder::new();
        let d = b.fn_decl("f", vec![], Type::void(), b.ret(Some(b.int(1))));
        let g = b.fn_decl("g", vec![], Type::sint(), b.ret(None));
        let errors = check(&[d, g]).errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Type));
    }

    #[test]
    fn region_block_types_its_handle() {
        let b = Builder::new();
        let r = Tvar::new("`r", Kind::Rgn);
        let body = b.local(
            "p",
            int_at(Type::var(&r)),
            Some(b.rnew(b.var("h"), b.int(3))),
            b.exp_s(b.deref(b.var("p"))),
        );
        let d = b.fn_decl("f", vec![], Type::void(), b.region(&r, "h", false, body));
        let ctx = check(&[d]);
        assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
    }

    #[test]
    fn try_depth_is_recorded() {
        let b = Builder::new();
        let inner = b.exp_s(b.int(0));
        let s = b.try_catch(inner.clone(), vec![b.clause(b.pwild(), None, b.skip())]);
        let d = b.fn_decl("f", vec![], Type::void(), s);
        assert!(check(&[d]).errors().is_empty());
        assert_eq!(inner.try_depth.get(), 1);
    }

    #[test]
    fn switch_binds_pattern_variables() {
        let b = Builder::new();
        let clause = b.clause(
            b.ptuple(vec![b.pvar("a"), b.pwild()]),
            None,
            b.ret(Some(b.var("a"))),
        );
        let sw = b.switch(b.var("t"), vec![clause.clone()]);
        let d = b.fn_decl(
            "f",
            vec![("t", Type::tuple(vec![Type::sint(), Type::char()]))],
            Type::sint(),
            sw,
        );
        let ctx = check(&[d]);
        assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
        assert_eq!(clause.pat_vars.borrow().as_ref().map(Vec::len), Some(1));
    }
}
