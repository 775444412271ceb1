use std::rc::Rc;

use strata_ast::{Conref, Evar, FnInfo, Kind, Tvar, Ty, Type};

use super::{
    compress, compress_conref, conref_val, eval_const_uint, free_evars, free_tvars,
    normalize_effect, subst_fn_info, tvar_kind, type_kind, typecmp,
};
use crate::ctx::{Ctx, UnifyFailure};

/// The innermost pair of types that failed to unify.
struct Mismatch {
    t1: Ty,
    t2: Ty,
    reason: Option<String>,
}

type Unified = Result<(), Mismatch>;

fn fail(t1: &Ty, t2: &Ty, reason: Option<&str>) -> Unified {
    Err(Mismatch {
        t1: t1.clone(),
        t2: t2.clone(),
        reason: reason.map(str::to_string),
    })
}

/// Unification state: every in-place write is recorded so a failed
/// unification leaves the types exactly as it found them.
struct Unifier {
    undo: Vec<Box<dyn FnOnce()>>,
}

impl Unifier {
    fn new() -> Self {
        Self { undo: Vec::new() }
    }

    fn rollback(self) {
        for u in self.undo.into_iter().rev() {
            u();
        }
    }

    fn set_resolved(&mut self, ev: &Rc<Evar>, t: Ty) {
        let old = ev.resolved.replace(Some(t));
        let ev = ev.clone();
        self.undo.push(Box::new(move || {
            *ev.resolved.borrow_mut() = old;
        }));
    }

    fn set_kind(&mut self, ev: &Rc<Evar>, k: Kind) {
        let old = ev.kind.replace(Some(k));
        let ev = ev.clone();
        self.undo.push(Box::new(move || {
            *ev.kind.borrow_mut() = old;
        }));
    }

    fn set_deps(&mut self, ev: &Rc<Evar>, deps: Vec<Tvar>) {
        let old = ev.deps.replace(Some(deps));
        let ev = ev.clone();
        self.undo.push(Box::new(move || {
            *ev.deps.borrow_mut() = old;
        }));
    }

    fn conref<T: Clone + PartialEq + 'static>(&mut self, c1: &Conref<T>, c2: &Conref<T>) -> bool {
        let r1 = compress_conref(c1);
        let r2 = compress_conref(c2);
        if r1.ptr_eq(&r2) {
            return true;
        }
        match (conref_val(&r1), conref_val(&r2)) {
            (Some(a), Some(b)) => a == b,
            (None, _) => self.forward(&r1, &r2),
            (Some(_), None) => self.forward(&r2, &r1),
        }
    }

    fn forward<T: Clone + 'static>(&mut self, from: &Conref<T>, to: &Conref<T>) -> bool {
        let old = from.constraint();
        match from.forward_to(to) {
            Ok(true) => {
                let from = from.clone();
                self.undo.push(Box::new(move || from.restore(old)));
                true
            }
            Ok(false) => false,
            Err(e) => crate::error::impos(e),
        }
    }

    /// Binds `ev` to `t` after the kind, occurs and dependency checks.
    fn bind(&mut self, ev: &Rc<Evar>, evar_ty: &Ty, t: &Ty) -> Unified {
        if let Some(k) = *ev.kind.borrow() {
            if !type_kind(t).leq(k) {
                return fail(evar_ty, t, Some("kinds differ"));
            }
        }
        let inner = free_evars(t);
        if inner.iter().any(|e| matches!(&**e, Type::Evar(x) if x.id == ev.id)) {
            return fail(evar_ty, t, Some("occurs check"));
        }
        let deps = ev.deps.borrow().clone();
        if let Some(deps) = deps {
            if let Some(tv) = free_tvars(t).into_iter().find(|tv| !deps.contains(tv)) {
                let reason = format!("type variable {} would escape its scope", tv.name);
                return fail(evar_ty, t, Some(&reason));
            }
            // Evars inside `t` inherit the restriction.
            for e in &inner {
                let Type::Evar(x) = &**e else { continue };
                let narrowed = match &*x.deps.borrow() {
                    Some(theirs) => theirs.iter().filter(|tv| deps.contains(tv)).cloned().collect(),
                    None => deps.clone(),
                };
                self.set_deps(x, narrowed);
            }
        }
        self.set_resolved(ev, t.clone());
        Ok(())
    }

    fn evar_evar(&mut self, ev1: &Rc<Evar>, t1: &Ty, ev2: &Rc<Evar>, t2: &Ty) -> Unified {
        let k1 = *ev1.kind.borrow();
        let k2 = *ev2.kind.borrow();
        let merged = match (k1, k2) {
            (Some(a), Some(b)) if a.leq(b) => Some(a),
            (Some(a), Some(b)) if b.leq(a) => Some(b),
            (Some(_), Some(_)) => return fail(t1, t2, Some("kinds differ")),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        if let Some(k) = merged {
            if k2 != Some(k) {
                self.set_kind(ev2, k);
            }
        }
        let d1 = ev1.deps.borrow().clone();
        let d2 = ev2.deps.borrow().clone();
        let deps = match (d1, d2) {
            (Some(a), Some(b)) => Some(a.into_iter().filter(|tv| b.contains(tv)).collect()),
            (Some(a), None) => Some(a),
            (None, _) => None,
        };
        if let Some(deps) = deps {
            self.set_deps(ev2, deps);
        }
        self.set_resolved(ev1, t2.clone());
        Ok(())
    }

    fn all(&mut self, ts1: &[Ty], ts2: &[Ty], whole1: &Ty, whole2: &Ty) -> Unified {
        if ts1.len() != ts2.len() {
            return fail(whole1, whole2, Some("different number of type arguments"));
        }
        for (a, b) in ts1.iter().zip(ts2) {
            self.unify(a, b)?;
        }
        Ok(())
    }

    fn unify(&mut self, t1: &Ty, t2: &Ty) -> Unified {
        let t1 = compress(t1);
        let t2 = compress(t2);
        if Rc::ptr_eq(&t1, &t2) {
            return Ok(());
        }
        match (&*t1, &*t2) {
            (Type::Evar(a), Type::Evar(b)) if a.id == b.id => return Ok(()),
            (Type::Evar(a), Type::Evar(b)) => return self.evar_evar(a, &t1, b, &t2),
            (Type::Evar(a), _) => {
                if type_kind(&t2) == Kind::Eff && a.kind.borrow().is_some_and(|k| k == Kind::Eff) {
                    return self.effects(&t1, &t2);
                }
                return self.bind(a, &t1, &t2);
            }
            (_, Type::Evar(b)) => {
                if type_kind(&t1) == Kind::Eff && b.kind.borrow().is_some_and(|k| k == Kind::Eff) {
                    return self.effects(&t1, &t2);
                }
                return self.bind(b, &t2, &t1);
            }
            _ => {}
        }
        match (&*t1, &*t2) {
            (Type::Void, Type::Void)
            | (Type::HeapRgn, Type::HeapRgn)
            | (Type::UniqueRgn, Type::UniqueRgn) => Ok(()),
            (Type::Var(a), Type::Var(b)) => {
                if a == b {
                    Ok(())
                } else {
                    fail(&t1, &t2, Some("type variables differ"))
                }
            }
            (Type::Int(s1, z1), Type::Int(s2, z2)) => {
                if s1 == s2 && z1 == z2 {
                    Ok(())
                } else {
                    fail(&t1, &t2, None)
                }
            }
            (Type::Float(a), Type::Float(b)) => {
                if a == b {
                    Ok(())
                } else {
                    fail(&t1, &t2, None)
                }
            }
            (Type::Pointer(p1), Type::Pointer(p2)) => {
                self.unify(&p1.elt, &p2.elt)?;
                if p1.elt_tq != p2.elt_tq {
                    return fail(&t1, &t2, Some("qualifiers differ"));
                }
                self.unify(&p1.atts.rgn, &p2.atts.rgn).or_else(|m| {
                    let reason = format!(
                        "pointer regions {} and {} differ",
                        compress(&p1.atts.rgn),
                        compress(&p2.atts.rgn)
                    );
                    Err(Mismatch {
                        reason: Some(m.reason.unwrap_or(reason)),
                        ..m
                    })
                })?;
                if !self.conref(&p1.atts.nullable, &p2.atts.nullable) {
                    return fail(&t1, &t2, Some("nullability differs"));
                }
                if !self.conref(&p1.atts.bounds, &p2.atts.bounds) {
                    return fail(&t1, &t2, Some("pointer bounds differ"));
                }
                if !self.conref(&p1.atts.zero_term, &p2.atts.zero_term) {
                    return fail(&t1, &t2, Some("zero-termination differs"));
                }
                Ok(())
            }
            (Type::Array(a1), Type::Array(a2)) => {
                self.unify(&a1.elt, &a2.elt)?;
                if a1.tq != a2.tq {
                    return fail(&t1, &t2, Some("qualifiers differ"));
                }
                if !self.conref(&a1.zero_term, &a2.zero_term) {
                    return fail(&t1, &t2, Some("zero-termination differs"));
                }
                let n1 = a1.num_elts.as_ref().map(eval_const_uint);
                let n2 = a2.num_elts.as_ref().map(eval_const_uint);
                match (n1, n2) {
                    (None, None) => Ok(()),
                    (Some(Some(x)), Some(Some(y))) if x == y => Ok(()),
                    _ => fail(&t1, &t2, Some("array sizes differ")),
                }
            }
            (Type::Fn(f1), Type::Fn(f2)) => self.functions(f1, f2, &t1, &t2),
            (Type::Tuple(ts1), Type::Tuple(ts2)) => {
                if ts1.len() != ts2.len() {
                    return fail(&t1, &t2, Some("tuples have different sizes"));
                }
                for ((q1, a), (q2, b)) in ts1.iter().zip(ts2) {
                    if q1 != q2 {
                        return fail(&t1, &t2, Some("qualifiers differ"));
                    }
                    self.unify(a, b)?;
                }
                Ok(())
            }
            (Type::Aggr(a1), Type::Aggr(a2)) => {
                let same = match (a1.decl(), a2.decl()) {
                    (Some(d1), Some(d2)) => Rc::ptr_eq(&d1, &d2),
                    _ => {
                        let (k1, n1) = a1.kind_and_name();
                        let (k2, n2) = a2.kind_and_name();
                        k1 == k2 && n1.same(&n2)
                    }
                };
                if !same {
                    return fail(&t1, &t2, Some("different aggregate types"));
                }
                self.all(&a1.targs, &a2.targs, &t1, &t2)
            }
            (Type::AnonAggr(k1, fs1), Type::AnonAggr(k2, fs2)) => {
                if k1 != k2 || fs1.len() != fs2.len() {
                    return fail(&t1, &t2, None);
                }
                for (x, y) in fs1.iter().zip(fs2) {
                    if x.name != y.name || x.tq != y.tq {
                        return fail(&t1, &t2, Some("field names differ"));
                    }
                    self.unify(&x.ty, &y.ty)?;
                }
                Ok(())
            }
            (Type::Enum(a, _), Type::Enum(b, _)) => {
                if a.same(b) {
                    Ok(())
                } else {
                    fail(&t1, &t2, Some("different enum types"))
                }
            }
            (Type::AnonEnum(a), Type::AnonEnum(b)) => {
                if a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.name.same(&y.name)) {
                    Ok(())
                } else {
                    fail(&t1, &t2, Some("(qualified) enum fields differ"))
                }
            }
            (Type::Datatype(d1), Type::Datatype(d2)) => {
                match (d1.decl(), d2.decl()) {
                    (Some(x), Some(y)) if Rc::ptr_eq(&x, &y) => {}
                    _ => return fail(&t1, &t2, Some("different datatypes")),
                }
                self.all(&d1.targs, &d2.targs, &t1, &t2)
            }
            (Type::DatatypeField(d1), Type::DatatypeField(d2)) => {
                let same = match (&*d1.field.borrow(), &*d2.field.borrow()) {
                    (
                        strata_ast::DatatypeFieldRef::Known(_, x),
                        strata_ast::DatatypeFieldRef::Known(_, y),
                    ) => Rc::ptr_eq(x, y),
                    _ => false,
                };
                if !same {
                    return fail(&t1, &t2, Some("different datatype fields"));
                }
                self.all(&d1.targs, &d2.targs, &t1, &t2)
            }
            (Type::RgnHandle(r1), Type::RgnHandle(r2)) => self.unify(r1, r2),
            (
                Type::AccessEff(_) | Type::JoinEff(_) | Type::RgnsEff(_),
                _,
            )
            | (
                _,
                Type::AccessEff(_) | Type::JoinEff(_) | Type::RgnsEff(_),
            ) => self.effects(&t1, &t2),
            (Type::Typedef(a), Type::Typedef(b)) if a.name.same(&b.name) => {
                self.all(&a.args, &b.args, &t1, &t2)
            }
            _ => fail(&t1, &t2, None),
        }
    }

    fn functions(&mut self, f1: &FnInfo, f2: &FnInfo, t1: &Ty, t2: &Ty) -> Unified {
        if f1.tvars.len() != f2.tvars.len() {
            return fail(t1, t2, Some("functions have different numbers of type parameters"));
        }
        for (a, b) in f1.tvars.iter().zip(&f2.tvars) {
            if tvar_kind(a, Kind::Box) != tvar_kind(b, Kind::Box) {
                return fail(t1, t2, Some("type parameter kinds differ"));
            }
        }
        // Rename the second function's binders to the first's.
        let inst: Vec<(Tvar, Ty)> = f2
            .tvars
            .iter()
            .cloned()
            .zip(f1.tvars.iter().map(Type::var))
            .collect();
        let renamed;
        let f2 = if inst.is_empty() {
            f2
        } else {
            renamed = subst_fn_info(&inst, f2);
            &renamed
        };
        if f1.args.len() != f2.args.len() {
            return fail(t1, t2, Some("functions have different numbers of arguments"));
        }
        if f1.c_varargs != f2.c_varargs {
            return fail(t1, t2, Some("only one function takes C varargs"));
        }
        self.unify(&f1.ret, &f2.ret)?;
        if f1.ret_tq != f2.ret_tq {
            return fail(t1, t2, Some("return type qualifiers differ"));
        }
        for (a, b) in f1.args.iter().zip(&f2.args) {
            if a.tq != b.tq {
                return fail(t1, t2, Some("argument qualifiers differ"));
            }
            self.unify(&a.ty, &b.ty)?;
        }
        match (&f1.cyc_varargs, &f2.cyc_varargs) {
            (None, None) => {}
            (Some(v1), Some(v2)) => {
                if v1.inject != v2.inject {
                    return fail(t1, t2, Some("varargs injection differs"));
                }
                self.unify(&v1.ty, &v2.ty)?;
            }
            _ => return fail(t1, t2, Some("only one function takes varargs")),
        }
        let e1 = f1.effect.borrow().clone();
        let e2 = f2.effect.borrow().clone();
        match (e1, e2) {
            (Some(a), Some(b)) => self
                .unify(&a, &b)
                .or_else(|_| fail(t1, t2, Some("function effects do not match")))?,
            (None, None) => {}
            _ => return fail(t1, t2, Some("function effects do not match")),
        }
        let po_subset = |xs: &[(Ty, Ty)], ys: &[(Ty, Ty)]| {
            xs.iter()
                .all(|(e, r)| ys.iter().any(|(e2, r2)| typecmp(e, e2) && typecmp(r, r2)))
        };
        if !po_subset(&f1.rgn_po, &f2.rgn_po) || !po_subset(&f2.rgn_po, &f1.rgn_po) {
            return fail(t1, t2, Some("region orders differ"));
        }
        let attr_subset =
            |xs: &FnInfo, ys: &FnInfo| xs.attributes.iter().all(|a| ys.attributes.contains(a));
        if !attr_subset(f1, f2) || !attr_subset(f2, f1) {
            return fail(t1, t2, Some("function attributes differ"));
        }
        Ok(())
    }

    /// Effects unify as sets; effect evars on either side absorb the atoms
    /// the other side has and they lack.
    fn effects(&mut self, t1: &Ty, t2: &Ty) -> Unified {
        let a1 = normalize_effect(t1);
        let a2 = normalize_effect(t2);
        let not_in = |xs: &[Ty], ys: &[Ty]| -> Vec<Ty> {
            xs.iter()
                .filter(|x| !ys.iter().any(|y| typecmp(x, y)))
                .cloned()
                .collect()
        };
        let only1 = not_in(&a1, &a2);
        let only2 = not_in(&a2, &a1);
        let split = |xs: Vec<Ty>| -> (Vec<Ty>, Vec<Ty>) {
            xs.into_iter().partition(|t| matches!(&**t, Type::Evar(_)))
        };
        let (evs1, conc1) = split(only1);
        let (evs2, conc2) = split(only2);
        let evar = |t: &Ty| -> Rc<Evar> {
            match &**t {
                Type::Evar(ev) => ev.clone(),
                _ => crate::error::impos("effect evar expected"),
            }
        };
        match (evs1.first(), evs2.first()) {
            (None, None) => {
                if conc1.is_empty() && conc2.is_empty() {
                    Ok(())
                } else {
                    fail(t1, t2, Some("effects differ"))
                }
            }
            (Some(e1), None) => {
                if !conc1.is_empty() {
                    return fail(t1, t2, Some("effects differ"));
                }
                self.bind(&evar(e1), e1, &Type::join_eff(conc2))?;
                for e in &evs1[1..] {
                    self.bind(&evar(e), e, &Type::join_eff(Vec::new()))?;
                }
                Ok(())
            }
            (None, Some(e2)) => {
                if !conc2.is_empty() {
                    return fail(t1, t2, Some("effects differ"));
                }
                self.bind(&evar(e2), e2, &Type::join_eff(conc1))?;
                for e in &evs2[1..] {
                    self.bind(&evar(e), e, &Type::join_eff(Vec::new()))?;
                }
                Ok(())
            }
            (Some(e1), Some(e2)) => {
                let (x1, x2) = (evar(e1), evar(e2));
                let deps = match (x1.deps.borrow().clone(), x2.deps.borrow().clone()) {
                    (Some(a), Some(b)) => Some(a.into_iter().filter(|tv| b.contains(tv)).collect()),
                    (Some(a), None) | (None, Some(a)) => Some(a),
                    (None, None) => None,
                };
                let rest = Type::evar(Some(Kind::Eff), deps);
                let mut j1 = conc2;
                j1.push(rest.clone());
                let mut j2 = conc1;
                j2.push(rest);
                self.bind(&x1, e1, &Type::join_eff(j1))?;
                self.bind(&x2, e2, &Type::join_eff(j2))?;
                for e in evs1[1..].iter().chain(&evs2[1..]) {
                    self.bind(&evar(e), e, &Type::join_eff(Vec::new()))?;
                }
                Ok(())
            }
        }
    }
}

/// Unifies `t1` and `t2`, resolving evars and constraint cells in place.
/// On failure nothing is changed and the reason is kept for
/// [`explain_failure`].
pub fn unify(ctx: &Ctx, t1: &Ty, t2: &Ty) -> bool {
    let mut u = Unifier::new();
    match u.unify(t1, t2) {
        Ok(()) => {
            *ctx.unify_failure.borrow_mut() = None;
            true
        }
        Err(m) => {
            u.rollback();
            tracing::trace!(t1 = %m.t1, t2 = %m.t2, reason = ?m.reason, "unification failed");
            *ctx.unify_failure.borrow_mut() = Some(UnifyFailure {
                t1: m.t1,
                t2: m.t2,
                reason: m.reason,
            });
            false
        }
    }
}

pub fn unify_conref<T: Clone + PartialEq + 'static>(c1: &Conref<T>, c2: &Conref<T>) -> bool {
    Unifier::new().conref(c1, c2)
}

/// Describes the most recent unification failure, or `""` when the last
/// unification succeeded.
pub fn explain_failure(ctx: &Ctx) -> String {
    match &*ctx.unify_failure.borrow() {
        None => String::new(),
        Some(f) => match &f.reason {
            Some(r) => format!("{} and {} are not compatible: {r}", f.t1, f.t2),
            None => format!("{} and {} are not compatible", f.t1, f.t2),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::{IntSize, Sign};

    #[test]
    fn evar_resolves_and_failure_rolls_back() {
        let ctx = Ctx::default();
        let e = Type::evar(Some(Kind::Box), None);
        let pair = Type::tuple(vec![e.clone(), Type::char()]);
        let other = Type::tuple(vec![Type::sint(), Type::sint()]);
        assert!(!unify(&ctx, &pair, &other));
        // The first component was bound before the second failed.
        assert!(matches!(&*compress(&e), Type::Evar(_)));
        assert!(explain_failure(&ctx).contains("not compatible"));

        assert!(unify(&ctx, &e, &Type::sint()));
        assert!(matches!(&*compress(&e), Type::Int(Sign::Signed, IntSize::Int)));
        assert!(explain_failure(&ctx).is_empty());
    }

    #[test]
    fn occurs_check_fails() {
        let ctx = Ctx::default();
        let e = Type::evar(None, None);
        let p = Type::star(e.clone(), Type::heap_rgn());
        assert!(!unify(&ctx, &e, &p));
        assert!(explain_failure(&ctx).contains("occurs check"));
    }

    #[test]
    fn dependency_check_prevents_escape() {
        let ctx = Ctx::default();
        let a = Tvar::new("a", Kind::Box);
        let b = Tvar::new("b", Kind::Box);
        let e = Type::evar(Some(Kind::Box), Some(vec![a.clone()]));
        assert!(!unify(&ctx, &e, &Type::var(&b)));
        assert!(explain_failure(&ctx).contains("escape"));
        assert!(unify(&ctx, &e, &Type::var(&a)));
    }

    #[test]
    fn kinds_are_respected() {
        let ctx = Ctx::default();
        let e = Type::evar(Some(Kind::Rgn), None);
        assert!(!unify(&ctx, &e, &Type::sint()));
        assert!(unify(&ctx, &e, &Type::heap_rgn()));
    }

    #[test]
    fn conrefs_forward_and_roll_back() {
        let ctx = Ctx::default();
        let p1 = Type::pointer(
            Type::sint(),
            Type::heap_rgn(),
            Default::default(),
            Conref::empty(),
            Conref::eq(strata_ast::Bounds::Upper(1)),
            Conref::eq(false),
        );
        let p2 = Type::at(Type::sint(), Type::heap_rgn());
        assert!(unify(&ctx, &p1, &p2));
        let Type::Pointer(pi) = &*p1 else { unreachable!() };
        assert_eq!(conref_val(&pi.atts.nullable), Some(false));

        // Nullability is forwarded before the bounds mismatch is found.
        let p3 = Type::pointer(
            Type::sint(),
            Type::heap_rgn(),
            Default::default(),
            Conref::empty(),
            Conref::eq(strata_ast::Bounds::Fat),
            Conref::eq(false),
        );
        let p4 = Type::at(Type::sint(), Type::heap_rgn());
        assert!(!unify(&ctx, &p3, &p4));
        let Type::Pointer(pi) = &*p3 else { unreachable!() };
        assert_eq!(conref_val(&pi.atts.nullable), None);
    }

    #[test]
    fn effect_evar_absorbs_missing_atoms() {
        let ctx = Ctx::default();
        let r = Tvar::new("`r", Kind::Rgn);
        let s = Tvar::new("`s", Kind::Rgn);
        let ev = Type::evar(Some(Kind::Eff), None);
        let e1 = Type::join_eff(vec![Type::access_eff(Type::var(&r)), ev.clone()]);
        let e2 = Type::join_eff(vec![
            Type::access_eff(Type::var(&r)),
            Type::access_eff(Type::var(&s)),
        ]);
        assert!(unify(&ctx, &e1, &e2));
        assert!(typecmp(&e1, &e2));

        let closed = Type::access_eff(Type::var(&r));
        assert!(!unify(&ctx, &closed, &e2));
    }

    #[test]
    fn functions_unify_up_to_renaming() {
        let ctx = Ctx::default();
        let mk = |tv: &Tvar| {
            Rc::new(Type::Fn(FnInfo {
                tvars: vec![tv.clone()],
                effect: std::cell::RefCell::new(Some(Type::join_eff(vec![]))),
                ret_tq: Default::default(),
                ret: Type::var(tv),
                args: vec![strata_ast::FnArg {
                    name: None,
                    tq: Default::default(),
                    ty: Type::var(tv),
                }],
                c_varargs: false,
                cyc_varargs: None,
                rgn_po: vec![],
                attributes: vec![],
            }))
        };
        let a = Tvar::new("a", Kind::Box);
        let b = Tvar::new("b", Kind::Box);
        assert!(unify(&ctx, &mk(&a), &mk(&b)));
    }
}
