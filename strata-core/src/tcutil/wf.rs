use std::rc::Rc;

use strata_ast::{
    AggrRef, CopyOptions, DatatypeFieldRef, DatatypeRef, FnAttr, FnInfo, Kind, KindBound, Span,
    Tvar, Ty, Type, copy_type,
};

use super::{
    compress, eval_const_uint, free_evars, free_tvars, is_pointer_type, substitute, tvar_kind,
    type_kind,
};
use crate::ctx::Ctx;
use crate::error::ErrorKind;
use crate::tcenv::Tenv;

struct Wf<'a> {
    ctx: &'a Ctx,
    te: &'a Tenv,
    span: Span,
    bound: Vec<Tvar>,
    free: Vec<Tvar>,
    allow_evars: bool,
}

impl Wf<'_> {
    fn kind_error(&self, t: &Ty, has: Kind, expected: Kind) {
        self.ctx.error(
            ErrorKind::Kind,
            self.span,
            format!("type {t} has kind {has} but as used here needs kind {expected}"),
        );
    }

    fn tvar(&mut self, tv: &Tvar, expected: Kind) {
        let bound = tv.bound();
        match bound {
            KindBound::Unknown => *tv.kind.borrow_mut() = KindBound::Eq(expected),
            KindBound::Less(k) if expected.leq(k) => {
                *tv.kind.borrow_mut() = KindBound::Eq(expected)
            }
            KindBound::Less(k) if k.leq(expected) => *tv.kind.borrow_mut() = KindBound::Eq(k),
            KindBound::Less(k) => self.kind_error(&Type::var(tv), k, expected),
            KindBound::Eq(k) => {
                if !k.leq(expected) {
                    self.kind_error(&Type::var(tv), k, expected);
                }
            }
        }
        if !self.bound.contains(tv) && !self.free.contains(tv) {
            self.free.push(tv.clone());
        }
    }

    fn evar(&mut self, t: &Ty, expected: Kind) {
        let Type::Evar(ev) = &**t else { return };
        if !self.allow_evars {
            self.ctx
                .error(ErrorKind::Type, self.span, "type must be written out here");
            return;
        }
        let current = *ev.kind.borrow();
        match current {
            None => *ev.kind.borrow_mut() = Some(expected),
            // Refine to the more specific kind.
            Some(k) if expected.leq(k) => *ev.kind.borrow_mut() = Some(expected),
            Some(k) if k.leq(expected) => {}
            Some(k) => self.kind_error(t, k, expected),
        }
    }

    fn check_kind(&self, t: &Ty, expected: Kind) {
        let k = type_kind(t);
        if !k.leq(expected) {
            self.kind_error(t, k, expected);
        }
    }

    fn targs(&mut self, what: &str, tvars: &[Tvar], targs: &[Ty]) {
        if tvars.len() != targs.len() {
            self.ctx.error(
                ErrorKind::Type,
                self.span,
                format!(
                    "{what} expects {} type argument(s) but was given {}",
                    tvars.len(),
                    targs.len()
                ),
            );
        }
        for (tv, t) in tvars.iter().zip(targs) {
            self.ty(t, tvar_kind(tv, Kind::Box));
        }
    }

    fn ty(&mut self, t: &Ty, expected: Kind) {
        let t = compress(t);
        match &*t {
            Type::Evar(_) => self.evar(&t, expected),
            Type::Var(tv) => self.tvar(tv, expected),
            Type::Void | Type::Int(..) | Type::Float(_) | Type::HeapRgn | Type::UniqueRgn => {
                self.check_kind(&t, expected)
            }
            Type::AnonEnum(_) => self.check_kind(&t, expected),
            Type::Pointer(p) => {
                self.ty(&p.elt, Kind::Any);
                self.ty(&p.atts.rgn, Kind::Rgn);
                self.check_kind(&t, expected);
            }
            Type::Array(a) => {
                self.ty(&a.elt, Kind::Mem);
                if let Some(n) = &a.num_elts {
                    if eval_const_uint(n).is_none() {
                        self.ctx.error(
                            ErrorKind::Type,
                            self.span,
                            format!("array bounds expression {n} is not constant"),
                        );
                    }
                }
                self.check_kind(&t, expected);
            }
            Type::Fn(f) => {
                self.function(f);
                self.check_kind(&t, expected);
            }
            Type::Tuple(ts) => {
                for (_, t) in ts {
                    self.ty(t, Kind::Mem);
                }
                self.check_kind(&t, expected);
            }
            Type::AnonAggr(_, fields) => {
                for f in fields {
                    self.ty(&f.ty, Kind::Mem);
                }
                self.check_kind(&t, expected);
            }
            Type::Aggr(info) => {
                let unresolved = match &*info.aggr.borrow() {
                    AggrRef::Unknown(k, name) => Some((*k, name.clone())),
                    AggrRef::Known(_) => None,
                };
                if let Some((kind, name)) = unresolved {
                    match self.te.lookup_aggrdecl(&name) {
                        Some(d) if d.kind == kind => {
                            *info.aggr.borrow_mut() = AggrRef::Known(Rc::downgrade(&d));
                        }
                        Some(d) => {
                            self.ctx.error(
                                ErrorKind::Type,
                                self.span,
                                format!("{name} is a {} but is used as a {kind}", d.kind),
                            );
                            return;
                        }
                        None => {
                            self.ctx.error(
                                ErrorKind::Name,
                                self.span,
                                format!("unbound {kind} {name}"),
                            );
                            return;
                        }
                    }
                }
                if let Some(d) = info.decl() {
                    self.targs(&format!("{} {}", d.kind, d.name), &d.tvars, &info.targs);
                }
                self.check_kind(&t, expected);
            }
            Type::Enum(name, slot) => {
                if slot.borrow().is_none() {
                    match self.te.lookup_enumdecl(name) {
                        Some(d) => *slot.borrow_mut() = Some(d),
                        None => {
                            self.ctx.error(
                                ErrorKind::Name,
                                self.span,
                                format!("unbound enum {name}"),
                            );
                            return;
                        }
                    }
                }
                self.check_kind(&t, expected);
            }
            Type::Datatype(info) => {
                let unresolved = match &*info.dt.borrow() {
                    DatatypeRef::Unknown { name, .. } => Some(name.clone()),
                    DatatypeRef::Known(_) => None,
                };
                if let Some(name) = unresolved {
                    match self.te.lookup_datatypedecl(&name) {
                        Some(d) => *info.dt.borrow_mut() = DatatypeRef::Known(Rc::downgrade(&d)),
                        None => {
                            self.ctx.error(
                                ErrorKind::Name,
                                self.span,
                                format!("unbound datatype {name}"),
                            );
                            return;
                        }
                    }
                }
                if let Some(d) = info.decl() {
                    self.targs(&format!("datatype {}", d.name), &d.tvars, &info.targs);
                }
                self.check_kind(&t, expected);
            }
            Type::DatatypeField(info) => {
                let unresolved = match &*info.field.borrow() {
                    DatatypeFieldRef::Unknown {
                        dt_name,
                        field_name,
                    } => Some((dt_name.clone(), field_name.clone())),
                    DatatypeFieldRef::Known(..) => None,
                };
                if let Some((dt_name, field_name)) = unresolved {
                    let found = self.te.lookup_datatypedecl(&dt_name).and_then(|d| {
                        let field = d
                            .fields
                            .as_ref()?
                            .iter()
                            .find(|f| f.name.name == field_name.name)
                            .cloned()?;
                        Some((d, field))
                    });
                    match found {
                        Some((d, field)) => {
                            *info.field.borrow_mut() =
                                DatatypeFieldRef::Known(Rc::downgrade(&d), field);
                        }
                        None => {
                            self.ctx.error(
                                ErrorKind::Name,
                                self.span,
                                format!("unbound datatype field {dt_name}.{field_name}"),
                            );
                            return;
                        }
                    }
                }
                let dt = match &*info.field.borrow() {
                    DatatypeFieldRef::Known(w, _) => w.upgrade(),
                    DatatypeFieldRef::Unknown { .. } => None,
                };
                if let Some(d) = dt {
                    self.targs(&format!("datatype {}", d.name), &d.tvars, &info.targs);
                }
                self.check_kind(&t, expected);
            }
            Type::RgnHandle(r) => {
                self.ty(r, Kind::Rgn);
                self.check_kind(&t, expected);
            }
            Type::AccessEff(r) => {
                self.ty(r, Kind::Rgn);
                self.check_kind(&t, expected);
            }
            Type::JoinEff(es) => {
                for e in es {
                    self.ty(e, Kind::Eff);
                }
                self.check_kind(&t, expected);
            }
            Type::RgnsEff(inner) => {
                self.ty(inner, Kind::Any);
                self.check_kind(&t, expected);
            }
            Type::Typedef(td) => {
                let decl = match self.te.lookup_typedefdecl(&td.name) {
                    Some(d) => d,
                    None => {
                        self.ctx.error(
                            ErrorKind::Name,
                            self.span,
                            format!("unbound typedef name {}", td.name),
                        );
                        return;
                    }
                };
                self.targs(&format!("typedef {}", td.name), &decl.tvars, &td.args);
                *td.decl.borrow_mut() = Some(decl.clone());
                match &decl.defn {
                    Some(defn) => {
                        let inst: Vec<(Tvar, Ty)> = decl
                            .tvars
                            .iter()
                            .cloned()
                            .zip(td.args.iter().cloned())
                            .collect();
                        // Each use gets its own copy of any evars in the definition.
                        let body = copy_type(
                            defn,
                            CopyOptions {
                                share_evars: false,
                                ..CopyOptions::default()
                            },
                        );
                        let expanded = substitute(&inst, &body);
                        *td.expanded.borrow_mut() = Some(expanded.clone());
                        self.ty(&expanded, expected);
                    }
                    None => self.check_kind(&t, expected),
                }
            }
        }
    }

    fn function(&mut self, f: &FnInfo) {
        for tv in &f.tvars {
            if tv.bound() == KindBound::Unknown {
                *tv.kind.borrow_mut() = KindBound::Eq(Kind::Box);
            }
        }
        let mark = self.bound.len();
        self.bound.extend(f.tvars.iter().cloned());
        self.ty(&f.ret, Kind::Mem);
        for a in &f.args {
            self.ty(&a.ty, Kind::Mem);
        }
        if let Some(v) = &f.cyc_varargs {
            self.ty(&v.ty, Kind::Mem);
        }
        for (e, r) in &f.rgn_po {
            self.ty(e, Kind::Eff);
            self.ty(r, Kind::Rgn);
        }
        for attr in &f.attributes {
            let (name, i) = match attr {
                FnAttr::Noconsume(i) => ("noconsume", *i),
                FnAttr::Initializes(i) => ("initializes", *i),
                _ => continue,
            };
            if f.args.get(i).is_none_or(|a| !is_pointer_type(&a.ty)) {
                self.ctx.error(
                    ErrorKind::Type,
                    self.span,
                    format!("{name} attribute index {i} does not refer to a pointer parameter"),
                );
            }
        }
        let declared = f.effect.borrow().clone();
        match declared {
            Some(e) => self.ty(&e, Kind::Eff),
            None => {
                let deps = self.bound.clone();
                *f.effect.borrow_mut() = Some(default_fn_effect(f, deps));
            }
        }
        self.bound.truncate(mark);
    }
}

/// The effect of a function type without a written one: a fresh effect
/// evar joined with access to every region, and the regions of every type
/// variable, its arguments and result mention.
pub fn default_fn_effect(f: &FnInfo, deps: Vec<Tvar>) -> Ty {
    let mut atoms = vec![Type::evar(Some(Kind::Eff), Some(deps))];
    let mut mentioned: Vec<Ty> = f.args.iter().map(|a| a.ty.clone()).collect();
    mentioned.push(f.ret.clone());
    if let Some(v) = &f.cyc_varargs {
        mentioned.push(v.ty.clone());
    }
    let mut seen: Vec<Tvar> = Vec::new();
    for t in &mentioned {
        for tv in free_tvars(t) {
            if seen.contains(&tv) {
                continue;
            }
            seen.push(tv.clone());
            atoms.push(match tvar_kind(&tv, Kind::Box) {
                Kind::Rgn => Type::access_eff(Type::var(&tv)),
                Kind::Eff => Type::var(&tv),
                Kind::Int => continue,
                _ => Type::rgns_eff(Type::var(&tv)),
            });
        }
        for ev in free_evars(t) {
            if type_kind(&ev) == Kind::Rgn {
                atoms.push(Type::access_eff(ev));
            }
        }
    }
    Type::join_eff(atoms)
}

/// Checks `t`, resolving names and expanding typedefs in place. Returns the
/// type variables `t` uses that are neither in `bound` nor in scope.
pub fn check_valid_type(
    ctx: &Ctx,
    te: &Tenv,
    span: Span,
    bound: &[Tvar],
    expected: Kind,
    allow_evars: bool,
    t: &Ty,
) -> Vec<Tvar> {
    let mut bound_all = te.lookup_type_vars();
    bound_all.extend(bound.iter().cloned());
    let mut wf = Wf {
        ctx,
        te,
        span,
        bound: bound_all,
        free: Vec::new(),
        allow_evars,
    };
    wf.ty(t, expected);
    wf.free
}

/// [`check_valid_type`], reporting every unbound type variable.
pub fn check_type(
    ctx: &Ctx,
    te: &Tenv,
    span: Span,
    bound: &[Tvar],
    expected: Kind,
    allow_evars: bool,
    t: &Ty,
) {
    for tv in check_valid_type(ctx, te, span, bound, expected, allow_evars, t) {
        ctx.error(
            ErrorKind::Name,
            span,
            format!("unbound type variable {}", tv.name),
        );
    }
}

/// Checks a function type built from a declaration; its own type
/// parameters are bound.
pub fn check_fn_type(ctx: &Ctx, te: &Tenv, span: Span, t: &Ty) {
    check_type(ctx, te, span, &[], Kind::Mem, true, t);
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::build::Builder;
    use strata_ast::{DeclKind, QualName};

    fn fn_ty(tvars: Vec<Tvar>, ret: Ty, args: Vec<Ty>) -> Ty {
        Rc::new(Type::Fn(FnInfo {
            tvars,
            effect: std::cell::RefCell::new(None),
            ret_tq: Default::default(),
            ret,
            args: args
                .into_iter()
                .map(|ty| strata_ast::FnArg {
                    name: None,
                    tq: Default::default(),
                    ty,
                })
                .collect(),
            c_varargs: false,
            cyc_varargs: None,
            rgn_po: vec![],
            attributes: vec![],
        }))
    }

    #[test]
    fn unbound_tvar_is_reported() {
        let ctx = Ctx::default();
        let te = Tenv::new();
        let a = Tvar::new("a", Kind::Box);
        check_type(&ctx, &te, strata_ast::span(0, 1), &[], Kind::Mem, true, &Type::var(&a));
        assert_eq!(ctx.error_count(), 1);
    }

    #[test]
    fn default_effect_mentions_regions_of_arguments() {
        let ctx = Ctx::default();
        let te = Tenv::new();
        let r = Tvar::new("`r", Kind::Rgn);
        let t = fn_ty(vec![r.clone()], Type::void(), vec![Type::star(Type::sint(), Type::var(&r))]);
        check_fn_type(&ctx, &te, strata_ast::span(0, 1), &t);
        assert_eq!(ctx.error_count(), 0);
        let Type::Fn(f) = &*t else { unreachable!() };
        let eff = f.effect.borrow().clone().unwrap();
        let atoms = super::super::normalize_effect(&eff);
        assert!(atoms.iter().any(|a| super::super::typecmp(a, &Type::access_eff(Type::var(&r)))));
        assert!(atoms.iter().any(|a| matches!(&**a, Type::Evar(_))));
    }

    #[test]
    fn typedef_expands_with_arguments() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = Tenv::new();
        let a = Tvar::new("a", Kind::Box);
        let d = b.typedef("ptr_t", vec![a.clone()], Type::star(Type::var(&a), Type::heap_rgn()));
        let DeclKind::Typedef(td) = &d.kind else { unreachable!() };
        te.current_genv()
            .typedefs
            .borrow_mut()
            .insert("ptr_t".into(), td.clone());

        let t = Type::typedef(QualName::local("ptr_t"), vec![Type::sint()]);
        check_type(&ctx, &te, b.sp(), &[], Kind::Mem, true, &t);
        assert_eq!(ctx.error_count(), 0);
        assert!(super::super::typecmp(
            &compress(&t),
            &Type::star(Type::sint(), Type::heap_rgn())
        ));
    }

    #[test]
    fn evar_kind_is_refined() {
        let ctx = Ctx::default();
        let te = Tenv::new();
        let e = Type::evar(Some(Kind::Any), None);
        check_type(&ctx, &te, strata_ast::span(0, 1), &[], Kind::Box, true, &e);
        let Type::Evar(ev) = &*e else { unreachable!() };
        assert_eq!(*ev.kind.borrow(), Some(Kind::Box));
    }

    #[test]
    fn non_constant_array_bound_is_rejected() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let te = Tenv::new();
        let t = Rc::new(Type::Array(strata_ast::ArrayInfo {
            elt: Type::sint(),
            tq: Default::default(),
            num_elts: Some(b.var("n")),
            zero_term: strata_ast::Conref::eq(false),
        }));
        check_type(&ctx, &te, b.sp(), &[], Kind::Mem, true, &t);
        assert_eq!(ctx.error_count(), 1);
    }

    #[test]
    fn unknown_struct_is_a_name_error() {
        let ctx = Ctx::default();
        let te = Tenv::new();
        let t = Type::aggr_unknown(strata_ast::AggrKind::Struct, QualName::local("nope"), vec![]);
        check_type(&ctx, &te, strata_ast::span(0, 1), &[], Kind::Mem, true, &t);
        let errs = ctx.errors();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, ErrorKind::Name);
    }
}
