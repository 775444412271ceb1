//! The checker driver.
//!
//! Declarations are processed in order. A function's signature is checked
//! and registered before its body, so recursion works; its body is then
//! type-checked, postponed region checks are replayed, and, when the body
//! produced no errors, the flow engine runs over it.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use strata_ast::{
    AggrDecl, AggrKind, Binding, DatatypeDecl, DeclKind, DeclRef, EnumDecl, ExpKind, ExpRef,
    FnDecl, FnInfo, Kind, QualName, Span, Ty, Type, TypedefDecl, VarDecl, VarRef,
};

use crate::ctx::Ctx;
use crate::error::{ErrorKind, impos};
use crate::flow;
use crate::tcenv::{Resolved, Tenv};
use crate::tcutil::{
    check_fn_type, check_type, coerce_assign, eval_const_uint, explain_failure, is_bits_only,
    is_integral, unify,
};

mod expr;
mod pat;
mod stmt;

pub(crate) use expr::tc_exp;
pub(crate) use stmt::tc_stmt;

/// Checks a compilation unit in `te`. Diagnostics go to `ctx`.
pub fn tc(ctx: &Ctx, te: &Tenv, decls: &[DeclRef]) {
    tc_decls(ctx, te, decls);
    report_unused(ctx, te);
}

fn tc_decls(ctx: &Ctx, te: &Tenv, decls: &[DeclRef]) {
    for d in decls {
        if ctx.should_stop() {
            tracing::warn!(errors = ctx.error_count(), "checking stopped early");
            return;
        }
        tc_decl(ctx, te, d);
    }
}

fn report_unused(ctx: &Ctx, te: &Tenv) {
    for fd in te.unused_statics() {
        ctx.warn(
            fd.span,
            format!("static function {} was declared but never used", fd.name),
        );
    }
}

/// An unconstrained evar of kind `k`.
pub(crate) fn fresh_evar(k: Kind) -> Ty {
    Type::evar(Some(k), None)
}

/// Records a type error, appending why the last unification failed.
pub(crate) fn mismatch(ctx: &Ctx, span: Span, what: impl fmt::Display) {
    let why = explain_failure(ctx);
    let msg = if why.is_empty() {
        what.to_string()
    } else {
        format!("{what}; {why}")
    };
    ctx.error(ErrorKind::Type, span, msg);
}

pub(crate) fn tc_decl(ctx: &Ctx, te: &Tenv, d: &DeclRef) {
    match &d.kind {
        DeclKind::Var(vd) => tc_global(ctx, te, vd),
        DeclKind::Fn(fd) => tc_fndecl(ctx, te, fd),
        DeclKind::Let { .. } => ctx.error(
            ErrorKind::Type,
            d.span,
            "let declarations are only allowed inside functions",
        ),
        DeclKind::Aggr(ad) => tc_aggrdecl(ctx, te, ad),
        DeclKind::Datatype(dd) => tc_datatypedecl(ctx, te, dd),
        DeclKind::Enum(ed) => tc_enumdecl(ctx, te, ed),
        DeclKind::Typedef(td) => tc_typedefdecl(ctx, te, td),
        DeclKind::Namespace(name, ds) => {
            let inner = te.enter_ns(name);
            tc_decls(ctx, &inner, ds);
            report_unused(ctx, &inner);
        }
        DeclKind::Using(q, ds) => match te.resolve_namespace(q) {
            Some(path) => tc_decls(ctx, &te.add_using(path), ds),
            None => ctx.error(ErrorKind::Name, d.span, format!("unknown namespace {q}")),
        },
    }
}

/// Expressions a global may be initialized with.
fn is_const_exp(e: &ExpRef) -> bool {
    match &*e.kind.borrow() {
        ExpKind::Const(_)
        | ExpKind::Sizeoftyp(_)
        | ExpKind::Sizeofexp(_)
        | ExpKind::Enum(..)
        | ExpKind::AnonEnum(..) => true,
        ExpKind::Var(_, Binding::Fun(_)) => true,
        ExpKind::Address(inner) => matches!(
            &*inner.kind.borrow(),
            ExpKind::Var(_, Binding::Global(_) | Binding::Fun(_))
        ),
        ExpKind::Cast(_, inner, ..)
        | ExpKind::NoInstantiate(inner)
        | ExpKind::Instantiate(inner, _) => is_const_exp(inner),
        ExpKind::Tuple(es) | ExpKind::Array(es) | ExpKind::Datatype(es, ..) => {
            es.iter().all(is_const_exp)
        }
        ExpKind::Aggregate { fields, .. } | ExpKind::AnonStruct(_, fields) => {
            fields.iter().all(|f| is_const_exp(&f.exp))
        }
        ExpKind::Primop(_, args) => args.iter().all(is_const_exp),
        _ => false,
    }
}

fn tc_global(ctx: &Ctx, te: &Tenv, vd: &VarRef) {
    let t = vd.ty();
    check_type(ctx, te, vd.span, &[], Kind::Mem, false, &t);
    if let Some(init) = &vd.initializer {
        let ti = tc_exp(ctx, te, Some(&t), init);
        if !coerce_assign(ctx, te, init, &t) {
            mismatch(
                ctx,
                init.span,
                format!("{} was declared with type {t} but initialized with type {ti}", vd.name),
            );
        } else if !is_const_exp(init) {
            ctx.error(
                ErrorKind::Type,
                init.span,
                format!("initializer of global {} is not a constant expression", vd.name),
            );
        }
    }
    *vd.rgn.borrow_mut() = Some(Type::heap_rgn());
    let g = te.current_genv();
    let previous = g
        .ordinaries
        .borrow()
        .get(&vd.name.name)
        .map(|(r, _)| r.clone());
    match previous {
        Some(Resolved::Var(Binding::Global(old))) => {
            if !unify(ctx, &old.ty(), &t) {
                mismatch(
                    ctx,
                    vd.span,
                    format!("redeclaration of {} at a different type", vd.name),
                );
                return;
            }
        }
        Some(_) => {
            ctx.error(ErrorKind::Name, vd.span, format!("redeclaration of {}", vd.name));
            return;
        }
        None => {}
    }
    g.add_ordinary(&vd.name.name, Resolved::Var(Binding::Global(vd.clone())));
}

fn fn_type_of(fd: &FnDecl) -> Ty {
    Rc::new(Type::Fn(FnInfo {
        tvars: fd.tvars.clone(),
        effect: RefCell::new(fd.effect.borrow().clone()),
        ret_tq: fd.ret_tq,
        ret: fd.ret.clone(),
        args: fd.args.clone(),
        c_varargs: fd.c_varargs,
        cyc_varargs: fd.cyc_varargs.clone(),
        rgn_po: fd.rgn_po.clone(),
        attributes: fd.attributes.clone(),
    }))
}

fn tc_fndecl(ctx: &Ctx, te: &Tenv, fd: &Rc<FnDecl>) {
    tracing::debug!(function = %fd.name, "checking function");
    let before = ctx.error_count();

    let ft = fn_type_of(fd);
    check_fn_type(ctx, te, fd.span, &ft);
    let effect = match &*ft {
        Type::Fn(info) => info.effect.borrow().clone(),
        _ => None,
    }
    .unwrap_or_else(|| impos(format!("function {} has no effect after checking", fd.name)));
    *fd.effect.borrow_mut() = Some(effect.clone());
    *fd.fn_ty.borrow_mut() = Some(ft);

    let g = te.current_genv();
    if g.ordinaries.borrow().contains_key(&fd.name.name) {
        ctx.error(ErrorKind::Name, fd.span, format!("redeclaration of {}", fd.name));
    }
    g.add_ordinary(&fd.name.name, Resolved::Var(Binding::Fun(Rc::downgrade(fd))));

    let mut seen = HashSet::new();
    let params: Vec<VarRef> = fd
        .args
        .iter()
        .enumerate()
        .map(|(i, a)| {
            let name = a.name.clone().unwrap_or_else(|| format!("_arg{i}"));
            if !seen.insert(name.clone()) {
                ctx.error(
                    ErrorKind::Name,
                    fd.span,
                    format!("parameter {name} of {} is declared twice", fd.name),
                );
            }
            Rc::new(VarDecl {
                span: fd.span,
                sc: strata_ast::Scope::Public,
                name: QualName::local(name),
                tq: a.tq,
                ty: RefCell::new(a.ty.clone()),
                initializer: None,
                rgn: RefCell::new(None),
                escapes: Cell::new(false),
            })
        })
        .collect();
    *fd.param_vardecls.borrow_mut() = Some(params.clone());

    let fte = te.new_fenv(ctx, fd, &effect, &params);
    tc_stmt(ctx, &fte, &fd.body);
    fte.check_delayed(ctx);
    fte.all_labels_resolved(ctx);

    if ctx.error_count() == before && !ctx.should_stop() {
        flow::analyze_fn(ctx, fd, &fte.fenv().region_order);
    }
    tracing::debug!(
        function = %fd.name,
        errors = ctx.error_count() - before,
        "function checked"
    );
}

fn tc_aggrdecl(ctx: &Ctx, te: &Tenv, ad: &Rc<AggrDecl>) {
    let g = te.current_genv();
    let existing = g.aggrdecls.borrow().get(&ad.name.name).cloned();
    if let Some(old) = &existing {
        if old.kind != ad.kind {
            ctx.error(
                ErrorKind::Type,
                ad.span,
                format!("{} was previously declared as a {}", ad.name, old.kind),
            );
            return;
        }
        if ad.imp.is_none() {
            return;
        }
        if old.imp.is_some() && !Rc::ptr_eq(old, ad) {
            ctx.error(
                ErrorKind::Name,
                ad.span,
                format!("redeclaration of {} {}", ad.kind, ad.name),
            );
            return;
        }
    }
    g.aggrdecls
        .borrow_mut()
        .insert(ad.name.name.clone(), ad.clone());

    let Some(imp) = &ad.imp else { return };
    let mut bound = ad.tvars.clone();
    bound.extend(imp.exist_vars.iter().cloned());
    let mut seen = HashSet::new();
    for f in &imp.fields {
        if !seen.insert(f.name.as_str()) {
            ctx.error(
                ErrorKind::Type,
                ad.span,
                format!("duplicate member {} in {} {}", f.name, ad.kind, ad.name),
            );
        }
        check_type(ctx, te, ad.span, &bound, Kind::Mem, false, &f.ty);
        if let Some(w) = &f.width {
            tc_exp(ctx, te, None, w);
            if !is_integral(&f.ty) {
                ctx.error(
                    ErrorKind::Type,
                    w.span,
                    format!("bitfield {} must have integral type", f.name),
                );
            } else if eval_const_uint(w).is_none() {
                ctx.error(
                    ErrorKind::Type,
                    w.span,
                    format!("width of bitfield {} is not constant", f.name),
                );
            }
        }
        if ad.kind == AggrKind::Union && !imp.tagged && !is_bits_only(&f.ty) {
            ctx.error(
                ErrorKind::Type,
                ad.span,
                format!(
                    "member {} of union {} contains pointers; only tagged unions may",
                    f.name, ad.name
                ),
            );
        }
    }
    for (eff, rgn) in &imp.rgn_po {
        check_type(ctx, te, ad.span, &bound, Kind::Eff, false, eff);
        check_type(ctx, te, ad.span, &bound, Kind::Rgn, false, rgn);
    }
}

fn tc_datatypedecl(ctx: &Ctx, te: &Tenv, dd: &Rc<DatatypeDecl>) {
    let g = te.current_genv();
    let existing = g.datatypedecls.borrow().get(&dd.name.name).cloned();
    if let Some(old) = &existing {
        if dd.fields.is_none() {
            return;
        }
        if old.fields.is_some() && !old.is_extensible && !Rc::ptr_eq(old, dd) {
            ctx.error(
                ErrorKind::Name,
                dd.span,
                format!("redeclaration of datatype {}", dd.name),
            );
            return;
        }
    }
    g.datatypedecls
        .borrow_mut()
        .insert(dd.name.name.clone(), dd.clone());

    let Some(fields) = &dd.fields else { return };
    let mut seen = HashSet::new();
    for f in fields {
        if !seen.insert(f.name.name.as_str()) {
            ctx.error(
                ErrorKind::Name,
                f.span,
                format!("duplicate constructor {} in datatype {}", f.name, dd.name),
            );
            continue;
        }
        for (_, t) in &f.typs {
            check_type(ctx, te, f.span, &dd.tvars, Kind::Mem, false, t);
        }
        g.add_ordinary(&f.name.name, Resolved::Datatype(dd.clone(), f.clone()));
    }
}

fn tc_enumdecl(ctx: &Ctx, te: &Tenv, ed: &Rc<EnumDecl>) {
    let g = te.current_genv();
    let existing = g.enumdecls.borrow().get(&ed.name.name).cloned();
    if let Some(old) = &existing {
        if ed.fields.is_none() {
            return;
        }
        if old.fields.is_some() && !Rc::ptr_eq(old, ed) {
            ctx.error(
                ErrorKind::Name,
                ed.span,
                format!("redeclaration of enum {}", ed.name),
            );
            return;
        }
    }
    g.enumdecls
        .borrow_mut()
        .insert(ed.name.name.clone(), ed.clone());

    let Some(fields) = &ed.fields else { return };
    for (i, f) in fields.iter().enumerate() {
        if let Some(tag) = &f.tag {
            tc_exp(ctx, te, Some(&Type::uint()), tag);
            if eval_const_uint(tag).is_none() {
                ctx.error(
                    ErrorKind::Type,
                    tag.span,
                    format!("tag of enum field {} is not a constant", f.name),
                );
            }
        }
        g.add_ordinary(&f.name.name, Resolved::Enum(ed.clone(), i));
    }
}

fn tc_typedefdecl(ctx: &Ctx, te: &Tenv, td: &Rc<TypedefDecl>) {
    let g = te.current_genv();
    if g.typedefs.borrow().contains_key(&td.name.name) {
        ctx.error(
            ErrorKind::Name,
            td.span,
            format!("redeclaration of typedef {}", td.name),
        );
        return;
    }
    if let Some(defn) = &td.defn {
        check_type(ctx, te, td.span, &td.tvars, td.kind.unwrap_or(Kind::Any), false, defn);
    }
    g.typedefs
        .borrow_mut()
        .insert(td.name.name.clone(), td.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::build::{Builder, FnSig};
    use strata_ast::{FnAttr, Scope};

    fn run(decls: &[DeclRef]) -> Ctx {
        let ctx = Ctx::default();
        tc(&ctx, &Tenv::new(), decls);
        ctx
    }

    #[test]
    fn params_are_recorded_and_typed() {
        let b = Builder::new();
        let body = b.ret(Some(b.var("x")));
        let d = b.fn_decl("id", vec![("x", Type::sint())], Type::sint(), body);
        let ctx = run(std::slice::from_ref(&d));
        assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
        let DeclKind::Fn(fd) = &d.kind else { panic!() };
        let params = fd.param_vardecls.borrow().clone().unwrap_or_default();
        assert_eq!(params.len(), 1);
        assert!(fd.fn_ty().is_some());
        assert!(fd.effect.borrow().is_some());
    }

    #[test]
    fn unused_static_function_is_a_warning() {
        let b = Builder::new();
        let sig = FnSig::new(Type::void()).scope(Scope::Static);
        let d = b.fn_decl_sig("helper", sig, b.skip());
        let ctx = run(&[d]);
        let diag = ctx.into_diagnostics();
        let warnings = diag.into_result().expect("no errors");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("helper"));
    }

    #[test]
    fn global_initializer_must_be_constant() {
        let b = Builder::new();
        let f = b.fn_decl("f", vec![], Type::sint(), b.ret(Some(b.int(1))));
        let g = b.global("g", Type::sint(), Some(b.call_named("f", vec![])));
        let ctx = run(&[f, g]);
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("not a constant"));
    }

    #[test]
    fn duplicate_struct_member_is_reported() {
        let b = Builder::new();
        let d = b.struct_decl("S", vec![("a", Type::sint()), ("a", Type::char())]);
        let ctx = run(&[d]);
        assert_eq!(ctx.errors().len(), 1);
        assert!(ctx.errors()[0].message.contains("duplicate member a"));
    }

    #[test]
    fn flow_is_skipped_after_type_errors() {
        let b = Builder::new();
        // `*p` on an uninitialized pointer would be a flow error, but the
        // bad return already fails the function.
        let body = b.local(
            "p",
            Type::at(Type::sint(), Type::heap_rgn()),
            None,
            b.seq(vec![
                b.exp_s(b.deref(b.var("p"))),
                b.ret(Some(b.null())),
            ]),
        );
        let d = b.fn_decl("f", vec![], Type::sint(), body);
        let ctx = run(&[d]);
        let errors = ctx.errors();
        assert!(errors.iter().all(|e| e.kind == ErrorKind::Type), "{errors:?}");
    }

    #[test]
    fn noconsume_index_must_name_a_pointer() {
        let b = Builder::new();
        let sig = FnSig::new(Type::void())
            .param("n", Type::sint())
            .attr(FnAttr::Noconsume(0));
        let d = b.fn_decl_sig("f", sig, b.skip());
        let ctx = run(&[d]);
        assert_eq!(ctx.errors().len(), 1);
    }
}
