//! Pattern checking for `let`, `switch` and `catch`.

use std::rc::Rc;

use strata_ast::{
    Kind, PatKind, PatRef, PtrAtts, PtrInfo, QualName, Tvar, Ty, Type, VarDecl, VarRef,
};

use super::{fresh_evar, mismatch};
use crate::ctx::Ctx;
use crate::error::ErrorKind;
use crate::tcenv::{Resolved, Tenv};
use crate::tcutil::{
    aggr_inst, compress, is_float, is_integral, is_pointer_type, is_unique_pointer, substitute,
    tvar_kind, unify,
};

/// Variables a pattern binds and the alias regions it introduces.
#[derive(Debug, Default)]
pub(crate) struct PatResult {
    pub vars: Vec<VarRef>,
    pub regions: Vec<Tvar>,
}

/// Checks `p` against the type of the value it matches.
pub(crate) fn tc_pat(ctx: &Ctx, te: &Tenv, p: &PatRef, t: &Ty) -> PatResult {
    let mut out = PatResult::default();
    pat(ctx, te, p, t, &mut out);
    out
}

/// Rewrites identifiers and calls into the constructs they name.
fn resolve(ctx: &Ctx, te: &Tenv, p: &PatRef) {
    let new = match &*p.kind.borrow() {
        PatKind::UnknownId(q) => Some(match te.lookup_ordinary(q) {
            Some(Resolved::Enum(ed, i)) => PatKind::Enum(ed, i),
            Some(Resolved::AnonEnum(t, i)) => {
                let name = match &*compress(&t) {
                    Type::AnonEnum(fs) => fs.get(i).map(|f| f.name.name.clone()),
                    _ => None,
                }
                .unwrap_or_else(|| q.name.clone());
                PatKind::AnonEnum(t, name)
            }
            Some(Resolved::Datatype(dd, df)) => PatKind::Datatype(dd, df, Vec::new()),
            _ => PatKind::Var(VarDecl::new(
                p.span,
                QualName::local(q.name.clone()),
                fresh_evar(Kind::Any),
                None,
            )),
        }),
        PatKind::UnknownCall(q, ps) => Some(match te.lookup_ordinary(q) {
            Some(Resolved::Datatype(dd, df)) => PatKind::Datatype(dd, df, ps.clone()),
            _ => match te.lookup_aggrdecl(q) {
                Some(ad) => PatKind::Aggr {
                    name: Some(q.clone()),
                    fields: ps.iter().map(|p| (None, p.clone())).collect(),
                    decl: Some(ad),
                },
                None => {
                    ctx.error(ErrorKind::Name, p.span, format!("{q} is not a constructor"));
                    PatKind::Wild
                }
            },
        }),
        _ => None,
    };
    if let Some(k) = new {
        *p.kind.borrow_mut() = k;
    }
}

fn bind(ctx: &Ctx, p: &PatRef, vd: &VarRef, out: &mut PatResult) {
    if out.vars.iter().any(|v| v.name.name == vd.name.name) {
        ctx.error(
            ErrorKind::Name,
            p.span,
            format!("pattern binds {} more than once", vd.name),
        );
    }
    out.vars.push(vd.clone());
}

/// Unifies the matched type with `shape`, reporting `what` on failure.
fn expect(ctx: &Ctx, p: &PatRef, t: &Ty, shape: &Ty, what: &str) -> bool {
    if unify(ctx, t, shape) {
        return true;
    }
    mismatch(ctx, p.span, format!("{what} pattern used to match a value of type {t}"));
    false
}

fn pat(ctx: &Ctx, te: &Tenv, p: &PatRef, t: &Ty, out: &mut PatResult) {
    resolve(ctx, te, p);
    *p.ty.borrow_mut() = Some(t.clone());
    let kind = p.kind.borrow();
    match &*kind {
        PatKind::Wild => {}
        PatKind::Var(vd) => {
            let vt = vd.ty();
            if !unify(ctx, &vt, t) {
                mismatch(
                    ctx,
                    p.span,
                    format!("pattern variable {} has type {vt} but matches a {t}", vd.name),
                );
            }
            bind(ctx, p, vd, out);
        }
        PatKind::Alias(tv, vd) => {
            if tvar_kind(tv, Kind::Rgn) != Kind::Rgn {
                ctx.error(
                    ErrorKind::Kind,
                    p.span,
                    format!("alias variable {} must have region kind", tv.name),
                );
            }
            let ct = compress(t);
            match &*ct {
                Type::Pointer(pi) if is_unique_pointer(&ct) => {
                    let alias_ty = Rc::new(Type::Pointer(PtrInfo {
                        elt: pi.elt.clone(),
                        elt_tq: pi.elt_tq,
                        atts: PtrAtts {
                            rgn: Type::var(tv),
                            ..pi.atts.clone()
                        },
                    }));
                    let vt = vd.ty();
                    if !unify(ctx, &vt, &alias_ty) {
                        mismatch(
                            ctx,
                            p.span,
                            format!("alias {} has type {vt} but {alias_ty} was expected", vd.name),
                        );
                    }
                }
                _ => ctx.error(
                    ErrorKind::Type,
                    p.span,
                    format!("alias pattern requires a unique pointer but found {t}"),
                ),
            }
            out.regions.push(tv.clone());
            bind(ctx, p, vd, out);
        }
        PatKind::Tuple(ps) => {
            let elts: Vec<Ty> = match &*compress(t) {
                Type::Tuple(ts) if ts.len() == ps.len() => {
                    ts.iter().map(|(_, t)| t.clone()).collect()
                }
                _ => {
                    let fresh: Vec<Ty> = ps.iter().map(|_| fresh_evar(Kind::Mem)).collect();
                    if !expect(ctx, p, t, &Type::tuple(fresh.clone()), "tuple") {
                        return;
                    }
                    fresh
                }
            };
            for (sub, et) in ps.iter().zip(&elts) {
                pat(ctx, te, sub, et, out);
            }
        }
        PatKind::Pointer(inner) => {
            let (elt, rgn) = match &*compress(t) {
                Type::Pointer(pi) => (pi.elt.clone(), pi.atts.rgn.clone()),
                _ => {
                    let (elt, rgn) = (fresh_evar(Kind::Any), fresh_evar(Kind::Rgn));
                    if !expect(ctx, p, t, &Type::at(elt.clone(), rgn.clone()), "pointer") {
                        return;
                    }
                    (elt, rgn)
                }
            };
            te.check_rgn_accessible(ctx, p.span, &rgn);
            pat(ctx, te, inner, &elt, out);
        }
        PatKind::Aggr { name, fields, decl } => {
            let ad = decl
                .clone()
                .or_else(|| name.as_ref().and_then(|q| te.lookup_aggrdecl(q)))
                .or_else(|| match &*compress(t) {
                    Type::Aggr(info) => info.decl(),
                    _ => None,
                });
            let Some(ad) = ad else {
                ctx.error(
                    ErrorKind::Type,
                    p.span,
                    format!("cannot determine the struct matched against {t}"),
                );
                return;
            };
            let Some(imp) = &ad.imp else {
                ctx.error(
                    ErrorKind::Type,
                    p.span,
                    format!("cannot match against abstract {} {}", ad.kind, ad.name),
                );
                return;
            };
            let targs: Vec<Ty> = ad
                .tvars
                .iter()
                .map(|tv| fresh_evar(tvar_kind(tv, Kind::Box)))
                .collect();
            if !expect(ctx, p, t, &Type::aggr_known(&ad, targs.clone()), &ad.kind.to_string()) {
                return;
            }
            let inst = aggr_inst(&Some(ad.clone()), &targs);
            for (pos, (fname, sub)) in fields.iter().enumerate() {
                let field = match fname {
                    Some(n) => ad.field(n).map(|(_, f)| f),
                    None => imp.fields.get(pos),
                };
                match field {
                    Some(f) => pat(ctx, te, sub, &substitute(&inst, &f.ty), out),
                    None => ctx.error(
                        ErrorKind::Type,
                        sub.span,
                        format!("{} {} has no such member", ad.kind, ad.name),
                    ),
                }
            }
        }
        PatKind::Datatype(dd, df, ps) => {
            let targs: Vec<Ty> = dd
                .tvars
                .iter()
                .map(|tv| fresh_evar(tvar_kind(tv, Kind::Box)))
                .collect();
            if !expect(ctx, p, t, &Type::datatype_known(dd, targs.clone()), "datatype") {
                return;
            }
            if ps.len() != df.typs.len() {
                ctx.error(
                    ErrorKind::Type,
                    p.span,
                    format!(
                        "constructor {} has {} argument(s) but the pattern has {}",
                        df.name,
                        df.typs.len(),
                        ps.len()
                    ),
                );
            }
            let inst: Vec<_> = dd.tvars.iter().cloned().zip(targs).collect();
            for (sub, (_, ft)) in ps.iter().zip(&df.typs) {
                pat(ctx, te, sub, &substitute(&inst, ft), out);
            }
        }
        PatKind::Null => {
            if !is_pointer_type(t) {
                expect(
                    ctx,
                    p,
                    t,
                    &Type::star(fresh_evar(Kind::Any), fresh_evar(Kind::Rgn)),
                    "NULL",
                );
            }
        }
        PatKind::Int(..) | PatKind::Char(_) => {
            if !is_integral(t) {
                expect(ctx, p, t, &Type::sint(), "integer");
            }
        }
        PatKind::Float(_) => {
            if !is_float(t) {
                expect(
                    ctx,
                    p,
                    t,
                    &Type::float(strata_ast::FloatKind::Double),
                    "floating-point",
                );
            }
        }
        PatKind::Enum(ed, _) => {
            expect(ctx, p, t, &Type::enum_known(ed), "enum");
        }
        PatKind::AnonEnum(et, _) => {
            expect(ctx, p, t, et, "enum");
        }
        PatKind::UnknownId(_) | PatKind::UnknownCall(..) => {
            crate::error::impos("pattern left unresolved after resolution")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::build::Builder;
    use strata_ast::DeclKind;

    fn fenv(b: &Builder, ctx: &Ctx) -> Tenv {
        let d = b.fn_decl("f", vec![], Type::void(), b.skip());
        let DeclKind::Fn(fd) = &d.kind else { unreachable!() };
        Tenv::new().new_fenv(ctx, fd, &Type::join_eff(vec![]), &[])
    }

    #[test]
    fn tuple_pattern_binds_components() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = fenv(&b, &ctx);
        let p = b.ptuple(vec![b.pvar("a"), b.pwild(), b.pid("c")]);
        let t = Type::tuple(vec![Type::sint(), Type::char(), Type::uint()]);
        let res = tc_pat(&ctx, &te, &p, &t);
        assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
        let names: Vec<_> = res.vars.iter().map(|v| v.name.name.clone()).collect();
        assert_eq!(names, ["a", "c"]);
        assert!(is_integral(&res.vars[1].ty()));
    }

    #[test]
    fn repeated_binding_is_reported() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = fenv(&b, &ctx);
        let p = b.ptuple(vec![b.pvar("x"), b.pvar("x")]);
        tc_pat(&ctx, &te, &p, &Type::tuple(vec![Type::sint(), Type::sint()]));
        let errors = ctx.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("more than once"));
    }

    #[test]
    fn alias_pattern_needs_unique_pointer() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = fenv(&b, &ctx);
        let tv = Tvar::new("`a", Kind::Rgn);
        let alias_ty = Type::star(Type::sint(), Type::var(&tv));
        let p = b.palias(&tv, "y", alias_ty);
        let res = tc_pat(&ctx, &te, &p, &Type::star(Type::sint(), Type::unique_rgn()));
        assert!(ctx.errors().is_empty(), "{:?}", ctx.errors());
        assert_eq!(res.regions, vec![tv.clone()]);

        let p = b.palias(&tv, "z", Type::star(Type::sint(), Type::var(&tv)));
        tc_pat(&ctx, &te, &p, &Type::star(Type::sint(), Type::heap_rgn()));
        assert_eq!(ctx.errors().len(), 1);
    }

    #[test]
    fn unknown_constructor_is_a_name_error() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = fenv(&b, &ctx);
        let p = b.pcall("Nope", vec![b.pwild()]);
        tc_pat(&ctx, &te, &p, &Type::sint());
        assert_eq!(ctx.errors()[0].kind, ErrorKind::Name);
        assert!(matches!(&*p.kind.borrow(), PatKind::Wild));
    }
}
