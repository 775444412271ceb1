use std::cell::RefCell;
use std::rc::Rc;

use strata_ast::{
    Bounds, Coercion, Decl, DeclKind, Exp, ExpKind, ExpRef, FloatKind, IntSize, Kind, Pat,
    PatKind, PtrAtts, PtrInfo, QualName, Sign, Stmt, StmtKind, Tvar, Ty, Type, VarDecl,
};

use super::{
    compress, conref_def, is_arithmetic, is_integral, is_nullable_pointer,
    is_pointer_type, is_unique_pointer, is_zero, typecmp, unify, unify_conref,
};
use crate::ctx::Ctx;
use crate::error::{ErrorKind, impos};
use crate::tcenv::Tenv;

/// Rewrites `e` in place into `(t) e`, keeping its span.
pub(crate) fn insert_cast(e: &ExpRef, t: &Ty, c: Coercion) {
    let inner = Exp::new(e.replace_kind(ExpKind::Const(strata_ast::Cnst::Null)), e.span);
    if let Some(old) = e.ty() {
        inner.set_ty(old);
    }
    *inner.annot.borrow_mut() = *e.annot.borrow();
    e.replace_kind(ExpKind::Cast(t.clone(), inner, false, c));
    e.set_ty(t.clone());
}

fn int_rank(t: &Ty) -> Option<(u8, bool)> {
    match &*compress(t) {
        Type::Int(sign, size) => {
            let rank = match size {
                IntSize::Char => 1,
                IntSize::Short => 2,
                IntSize::Int => 3,
                IntSize::Long => 4,
                IntSize::LongLong => 5,
            };
            Some((rank, *sign == Sign::Unsigned))
        }
        Type::Enum(..) | Type::AnonEnum(_) => Some((3, false)),
        _ => None,
    }
}

fn float_rank(t: &Ty) -> Option<u8> {
    match &*compress(t) {
        Type::Float(FloatKind::Float) => Some(6),
        Type::Float(FloatKind::Double) => Some(7),
        Type::Float(FloatKind::LongDouble) => Some(8),
        _ => None,
    }
}

fn arith_rank(t: &Ty) -> u8 {
    float_rank(t)
        .or_else(|| int_rank(t).map(|(r, _)| r))
        .unwrap_or(0)
}

/// Usual arithmetic conversions: the wider type, unsigned on a tie.
pub(crate) fn max_arithmetic_type(t1: &Ty, t2: &Ty) -> Ty {
    let (c1, c2) = (compress(t1), compress(t2));
    let r1 = arith_rank(&c1).max(3);
    let r2 = arith_rank(&c2).max(3);
    if r1 > r2 {
        return if float_rank(&c1).is_some() { c1 } else { promote(&c1) };
    }
    if r2 > r1 {
        return if float_rank(&c2).is_some() { c2 } else { promote(&c2) };
    }
    if float_rank(&c1).is_some() {
        return c1;
    }
    let unsigned = int_rank(&c1).is_some_and(|(_, u)| u) || int_rank(&c2).is_some_and(|(_, u)| u);
    let size = match r1 {
        4 => IntSize::Long,
        5 => IntSize::LongLong,
        _ => IntSize::Int,
    };
    Type::int(if unsigned { Sign::Unsigned } else { Sign::Signed }, size)
}

/// Integer promotion: anything narrower than `int` becomes `int`.
fn promote(t: &Ty) -> Ty {
    match int_rank(t) {
        Some((r, _)) if r < 3 => Type::sint(),
        Some(_) if matches!(&**t, Type::Enum(..) | Type::AnonEnum(_)) => Type::sint(),
        _ => t.clone(),
    }
}

/// `t1` converts to `t2` without loss or warning.
pub fn silent_castable(ctx: &Ctx, te: &Tenv, t1: &Ty, t2: &Ty) -> bool {
    if typecmp(t1, t2) {
        return true;
    }
    if let (Some((r1, u1)), Some((r2, u2))) = (int_rank(t1), int_rank(t2)) {
        return r1 < r2 || (r1 == r2 && u1 == u2);
    }
    if let (Some(r1), Some(r2)) = (arith_rank_opt_float(t1), float_rank(t2)) {
        return r1 <= r2;
    }
    if is_pointer_type(t1) && is_pointer_type(t2) {
        return subtype(ctx, te, &[], t1, t2);
    }
    unify(ctx, t1, t2)
}

fn arith_rank_opt_float(t: &Ty) -> Option<u8> {
    float_rank(t).or_else(|| int_rank(t).map(|(r, _)| r))
}

/// The coercion an explicit cast from `t1` to `t2` needs, or `None` when
/// the cast is illegal.
pub fn castable(ctx: &Ctx, te: &Tenv, t1: &Ty, t2: &Ty) -> Option<Coercion> {
    if unify(ctx, t1, t2) {
        return Some(Coercion::NoCoercion);
    }
    if is_arithmetic(t1) && is_arithmetic(t2) {
        return Some(Coercion::Other);
    }
    let (c1, c2) = (compress(t1), compress(t2));
    match (&*c1, &*c2) {
        (Type::Pointer(p1), Type::Pointer(p2)) => {
            let n1 = conref_def(true, &p1.atts.nullable);
            let n2 = conref_def(true, &p2.atts.nullable);
            let elts_ok = unify(ctx, &p1.elt, &p2.elt)
                || (super::is_bits_only(&p1.elt) && super::is_bits_only(&p2.elt))
                || matches!(&*compress(&p2.elt), Type::Void);
            let rgn_ok = unify(ctx, &p1.atts.rgn, &p2.atts.rgn)
                || te.region_outlives(&p1.atts.rgn, &p2.atts.rgn);
            if !elts_ok || !rgn_ok {
                return None;
            }
            Some(if n1 && !n2 {
                Coercion::NullCheck
            } else {
                Coercion::Other
            })
        }
        // Thin pointers may be viewed as integers.
        (Type::Pointer(_), Type::Int(_, IntSize::Int | IntSize::Long))
            if super::is_thin_pointer(&c1) =>
        {
            Some(Coercion::Other)
        }
        (Type::Datatype(_), Type::Datatype(_)) | (Type::DatatypeField(_), Type::Datatype(_)) => {
            subtype(ctx, te, &[], &c1, &c2).then_some(Coercion::NoCoercion)
        }
        _ => None,
    }
}

/// Structural subtyping. `assume` lists pairs already taken to be related,
/// which cuts recursion through aggregate types.
pub fn subtype(ctx: &Ctx, te: &Tenv, assume: &[(Ty, Ty)], t1: &Ty, t2: &Ty) -> bool {
    if typecmp(t1, t2) {
        return true;
    }
    if assume
        .iter()
        .any(|(a, b)| typecmp(a, t1) && typecmp(b, t2))
    {
        return true;
    }
    let (c1, c2) = (compress(t1), compress(t2));
    match (&*c1, &*c2) {
        (Type::Pointer(p1), Type::Pointer(p2)) => {
            if !p1.elt_tq.leq(p2.elt_tq) {
                return false;
            }
            // Non-null may be used as nullable, never the reverse.
            let n1 = conref_def(true, &p1.atts.nullable);
            let n2 = conref_def(true, &p2.atts.nullable);
            if n1 && !n2 {
                return false;
            }
            let bounds_ok = match (
                conref_def(Bounds::Upper(1), &p1.atts.bounds),
                conref_def(Bounds::Upper(1), &p2.atts.bounds),
            ) {
                (Bounds::Fat, Bounds::Fat) => true,
                (Bounds::Upper(a), Bounds::Upper(b)) => a >= b,
                _ => false,
            };
            if !bounds_ok
                || conref_def(false, &p1.atts.zero_term) != conref_def(false, &p2.atts.zero_term)
            {
                return false;
            }
            if !(unify(ctx, &p1.atts.rgn, &p2.atts.rgn)
                || te.region_outlives(&p1.atts.rgn, &p2.atts.rgn))
            {
                return false;
            }
            let mut assume = assume.to_vec();
            assume.push((c1.clone(), c2.clone()));
            // Element types may only vary under a const view.
            if p2.elt_tq.is_const {
                subtype(ctx, te, &assume, &p1.elt, &p2.elt)
            } else {
                unify(ctx, &p1.elt, &p2.elt)
            }
        }
        (Type::Tuple(ts1), Type::Tuple(ts2)) => {
            // A longer tuple may be viewed through a prefix.
            ts1.len() >= ts2.len()
                && ts1.iter().zip(ts2).all(|((q1, a), (q2, b))| {
                    q1 == q2 && (q2.is_const && subtype(ctx, te, assume, a, b) || unify(ctx, a, b))
                })
        }
        (Type::DatatypeField(f), Type::Datatype(d)) => {
            let parent = match &*f.field.borrow() {
                strata_ast::DatatypeFieldRef::Known(w, _) => w.upgrade(),
                strata_ast::DatatypeFieldRef::Unknown { .. } => None,
            };
            match (parent, d.decl()) {
                (Some(p), Some(q)) if Rc::ptr_eq(&p, &q) => {
                    f.targs.len() == d.targs.len()
                        && f.targs.iter().zip(&d.targs).all(|(a, b)| unify(ctx, a, b))
                }
                _ => false,
            }
        }
        _ => unify(ctx, &c1, &c2),
    }
}

fn narrower(t1: &Ty, t2: &Ty) -> bool {
    arith_rank(t2) < arith_rank(t1)
}

/// Makes `e` usable where a `t2` is expected, inserting a cast when a
/// conversion is needed. Returns `false` when no conversion exists; the
/// caller reports the type error.
pub fn coerce_use(ctx: &Ctx, te: &Tenv, e: &ExpRef, t2: &Ty) -> bool {
    let Some(t1) = e.ty() else {
        impos("coercing an expression that was never typed")
    };
    if unify(ctx, &t1, t2) {
        return true;
    }
    let (c1, c2) = (compress(&t1), compress(t2));
    if is_arithmetic(&c1) && is_arithmetic(&c2) {
        if narrower(&c1, &c2) {
            ctx.warn(e.span, format!("implicit cast to shorter type {c2}"));
        }
        insert_cast(e, &c2, Coercion::Other);
        return true;
    }
    if is_zero(e) && is_pointer_type(&c2) {
        if is_nullable_pointer(&c2) {
            insert_cast(e, &c2, Coercion::NoCoercion);
            return true;
        }
        return false;
    }
    match (&*c1, &*c2) {
        (Type::Pointer(p1), Type::Pointer(p2)) => coerce_pointer(ctx, te, e, p1, p2, &c2),
        _ => false,
    }
}

fn coerce_pointer(
    ctx: &Ctx,
    te: &Tenv,
    e: &ExpRef,
    p1: &PtrInfo,
    p2: &PtrInfo,
    t2: &Ty,
) -> bool {
    if !p1.elt_tq.leq(p2.elt_tq) || !unify(ctx, &p1.elt, &p2.elt) {
        return false;
    }
    if !unify_conref(&p1.atts.zero_term, &p2.atts.zero_term) {
        return false;
    }
    let mut coercion = Coercion::NoCoercion;
    if !unify_conref(&p1.atts.nullable, &p2.atts.nullable) {
        let n1 = conref_def(true, &p1.atts.nullable);
        let n2 = conref_def(true, &p2.atts.nullable);
        if n1 && !n2 {
            ctx.warn(e.span, "inserted null check due to implicit cast from * to @ type");
            coercion = Coercion::NullCheck;
        } else {
            coercion = Coercion::Other;
        }
    }
    if !unify_conref(&p1.atts.bounds, &p2.atts.bounds) {
        match (
            conref_def(Bounds::Upper(1), &p1.atts.bounds),
            conref_def(Bounds::Upper(1), &p2.atts.bounds),
        ) {
            (Bounds::Upper(a), Bounds::Upper(b)) if a < b => return false,
            (Bounds::Fat, Bounds::Upper(_)) => {
                ctx.warn(e.span, "implicit cast from fat pointer to thin pointer");
            }
            _ => {}
        }
        if coercion == Coercion::NoCoercion {
            coercion = Coercion::Other;
        }
    }
    let r1 = compress(&p1.atts.rgn);
    let r2 = compress(&p2.atts.rgn);
    if !unify(ctx, &r1, &r2) {
        if te.region_outlives(&r1, &r2) {
            if coercion == Coercion::NoCoercion {
                coercion = Coercion::Other;
            }
        } else {
            // Reported here so the caller does not add a type error.
            ctx.error(
                ErrorKind::Region,
                e.span,
                format!(
                    "pointer into region {r1} used where a pointer into region {r2} is expected, \
                     and {r1} does not outlive {r2}"
                ),
            );
            return true;
        }
    }
    if coercion != Coercion::NoCoercion {
        insert_cast(e, t2, coercion);
    }
    true
}

pub fn coerce_arg(ctx: &Ctx, te: &Tenv, e: &ExpRef, t2: &Ty) -> bool {
    coerce_use(ctx, te, e, t2)
}

pub fn coerce_assign(ctx: &Ctx, te: &Tenv, e: &ExpRef, t2: &Ty) -> bool {
    coerce_use(ctx, te, e, t2)
}

/// Conditions: any scalar. An unconstrained evar becomes `int`.
pub fn coerce_to_bool(ctx: &Ctx, e: &ExpRef) -> bool {
    let Some(t) = e.ty() else { return false };
    let t = compress(&t);
    match &*t {
        Type::Evar(_) => unify(ctx, &t, &Type::sint()),
        _ => is_arithmetic(&t) || is_pointer_type(&t),
    }
}

/// Converts an index or count to `unsigned int`.
pub fn coerce_uint_type(ctx: &Ctx, e: &ExpRef) -> bool {
    let Some(t) = e.ty() else { return false };
    if unify(ctx, &t, &Type::uint()) {
        return true;
    }
    if is_integral(&t) {
        insert_cast(e, &Type::uint(), Coercion::Other);
        return true;
    }
    false
}

/// Brings two arithmetic operands to their common type; returns it.
pub fn coerce_arithmetic(e1: &ExpRef, e2: &ExpRef) -> Option<Ty> {
    let t1 = e1.ty()?;
    let t2 = e2.ty()?;
    if !is_arithmetic(&t1) || !is_arithmetic(&t2) {
        return None;
    }
    let t = max_arithmetic_type(&t1, &t2);
    for (e, te) in [(e1, &t1), (e2, &t2)] {
        if !typecmp(te, &t) {
            insert_cast(e, &t, Coercion::Other);
        }
    }
    Some(t)
}

/// Lets a unique pointer `e` be passed where a pointer into the region
/// evar `target_rgn` is expected without consuming it: `e` becomes
/// `({ let alias<'a> T *'a x = e; x; })` and the evar is fixed to the fresh
/// region `'a`, which the caller must make accessible.
pub fn insert_alias(ctx: &Ctx, e: &ExpRef, target_rgn: &Ty) -> Option<Tvar> {
    let t1 = e.ty()?;
    if !is_unique_pointer(&t1) {
        return None;
    }
    if !matches!(&*compress(target_rgn), Type::Evar(_)) {
        return None;
    }
    let Type::Pointer(p) = &*compress(&t1) else {
        return None;
    };
    let name = ctx.fresh_alias_name();
    let tv = Tvar::new(format!("`{name}"), Kind::Rgn);
    let alias_ty = Rc::new(Type::Pointer(PtrInfo {
        elt: p.elt.clone(),
        elt_tq: p.elt_tq,
        atts: PtrAtts {
            rgn: Type::var(&tv),
            ..p.atts.clone()
        },
    }));
    if !unify(ctx, target_rgn, &Type::var(&tv)) {
        return None;
    }
    let span = e.span;
    let vd = VarDecl::new(span, QualName::local(name.clone()), alias_ty.clone(), None);
    let pat = Pat::new(PatKind::Alias(tv.clone(), vd.clone()), span);
    *pat.ty.borrow_mut() = Some(t1.clone());
    let init = Exp::new(e.replace_kind(ExpKind::Const(strata_ast::Cnst::Null)), span);
    init.set_ty(t1);
    let decl = Decl::new(
        DeclKind::Let {
            pat,
            pat_vars: RefCell::new(Some(vec![vd.clone()])),
            init,
        },
        span,
    );
    let use_alias = Exp::typed(
        ExpKind::Var(QualName::local(name), strata_ast::Binding::Pat(vd)),
        span,
        alias_ty.clone(),
    );
    let body = Stmt::new(StmtKind::Exp(use_alias), span);
    let s = Stmt::new(StmtKind::Decl(decl, body), span);
    e.replace_kind(ExpKind::StmtExp(s));
    e.set_ty(alias_ty);
    tracing::trace!(region = %tv.name, "inserted alias for unique argument");
    Some(tv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::build::Builder;
    use strata_ast::DeclKind;

    fn typed(b: &Builder, t: Ty) -> ExpRef {
        let e = b.var("x");
        e.set_ty(t);
        e
    }

    fn fenv(b: &Builder, ctx: &Ctx) -> Tenv {
        let d = b.fn_decl("f", vec![], Type::void(), b.skip());
        let DeclKind::Fn(fd) = &d.kind else { unreachable!() };
        Tenv::new().new_fenv(ctx, fd, &Type::join_eff(vec![]), &[])
    }

    #[test]
    fn arithmetic_use_inserts_cast() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = Tenv::new();
        let e = typed(&b, Type::char());
        assert!(coerce_use(&ctx, &te, &e, &Type::sint()));
        assert!(matches!(&*e.kind.borrow(), ExpKind::Cast(_, _, false, Coercion::Other)));
        assert!(ctx.into_diagnostics().warnings().is_empty());
    }

    #[test]
    fn nullable_to_non_null_inserts_check() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = Tenv::new();
        let e = typed(&b, Type::star(Type::sint(), Type::heap_rgn()));
        assert!(coerce_use(&ctx, &te, &e, &Type::at(Type::sint(), Type::heap_rgn())));
        assert!(matches!(&*e.kind.borrow(), ExpKind::Cast(_, _, false, Coercion::NullCheck)));
        assert_eq!(ctx.into_diagnostics().warnings().len(), 1);
    }

    #[test]
    fn younger_region_does_not_coerce_to_older() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = fenv(&b, &ctx);
        let r = Tvar::new("`r", Kind::Rgn);
        let inner = te.new_named_block(&r, false);

        let young = typed(&b, Type::star(Type::sint(), Type::var(&r)));
        assert!(coerce_use(&ctx, &inner, &young, &Type::star(Type::sint(), te.parameter_rgn())));
        assert_eq!(ctx.error_count(), 1);

        let old = typed(&b, Type::star(Type::sint(), te.parameter_rgn()));
        assert!(coerce_use(&ctx, &inner, &old, &Type::star(Type::sint(), Type::var(&r))));
        assert_eq!(ctx.error_count(), 1);
    }

    #[test]
    fn subtype_respects_nullability_and_const() {
        let ctx = Ctx::default();
        let te = Tenv::new();
        let at = Type::at(Type::sint(), Type::heap_rgn());
        let star = Type::star(Type::sint(), Type::heap_rgn());
        assert!(subtype(&ctx, &te, &[], &at, &star));
        assert!(!subtype(&ctx, &te, &[], &star, &at));
    }

    #[test]
    fn silent_casts_only_widen() {
        let ctx = Ctx::default();
        let te = Tenv::new();
        assert!(silent_castable(&ctx, &te, &Type::char(), &Type::sint()));
        assert!(!silent_castable(&ctx, &te, &Type::sint(), &Type::char()));
        assert!(silent_castable(&ctx, &te, &Type::sint(), &Type::float(FloatKind::Double)));
        let at = Type::at(Type::sint(), Type::heap_rgn());
        let star = Type::star(Type::sint(), Type::heap_rgn());
        assert!(silent_castable(&ctx, &te, &at, &star));
        assert!(!silent_castable(&ctx, &te, &star, &at));
    }

    #[test]
    fn arithmetic_conversions_pick_wider_type() {
        let t = max_arithmetic_type(&Type::char(), &Type::uint());
        assert!(typecmp(&t, &Type::uint()));
        let t = max_arithmetic_type(&Type::sint(), &Type::float(FloatKind::Double));
        assert!(typecmp(&t, &Type::float(FloatKind::Double)));
    }

    #[test]
    fn alias_fixes_region_evar() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let e = typed(&b, Type::star(Type::sint(), Type::unique_rgn()));
        let rgn = Type::evar(Some(Kind::Rgn), None);
        let tv = insert_alias(&ctx, &e, &rgn).unwrap();
        assert!(matches!(&*e.kind.borrow(), ExpKind::StmtExp(_)));
        assert!(typecmp(&rgn, &Type::var(&tv)));
        assert!(!is_unique_pointer(&e.ty().unwrap()));
    }
}
