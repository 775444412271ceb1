//! Type utilities: compression, predicates, destructors, kinds, effects,
//! substitution, unification, coercion and well-formedness.
//!
//! Every predicate is total over the full type language and compresses its
//! argument first, so callers never need to follow evars or typedefs
//! themselves.

use std::collections::HashSet;
use std::rc::Rc;

use strata_ast::{
    AggrDecl, AggrInfo, AggrRef, ArrayInfo, Bounds, Cnst, Conref, DatatypeFieldInfo,
    DatatypeInfo, ExpKind, ExpRef, FnArg, FnInfo, IntSize, Kind, KindBound, PtrAtts, PtrInfo,
    Sign, Tvar, Ty, Type, TypedefInfo, VarargInfo,
};

use crate::error::impos;

mod coerce;
mod unify;
mod wf;

pub use coerce::{
    castable, coerce_arg, coerce_arithmetic, coerce_assign, coerce_to_bool, coerce_uint_type,
    coerce_use, insert_alias, silent_castable, subtype,
};
pub(crate) use coerce::{insert_cast, max_arithmetic_type};
pub use unify::{explain_failure, unify, unify_conref};
pub use wf::{check_fn_type, check_type, check_valid_type, default_fn_effect};

// ---------------------------------------------------------------------------
// compression

/// Follows resolved evars and expanded typedefs to the representative type.
/// Idempotent; compresses evar chains in place.
pub fn compress(t: &Ty) -> Ty {
    let mut chain: Vec<Rc<strata_ast::Evar>> = Vec::new();
    let mut cur = t.clone();
    loop {
        let next = match &*cur {
            Type::Evar(ev) => {
                if chain.iter().any(|seen| seen.id == ev.id) {
                    impos(format!("evar %{} is part of its own resolution", ev.id));
                }
                chain.push(ev.clone());
                ev.resolved.borrow().clone()
            }
            Type::Typedef(td) => td.expanded.borrow().clone(),
            _ => None,
        };
        match next {
            Some(n) => cur = n,
            None => break,
        }
    }
    // Repoint every resolved evar on the chain straight at the representative.
    for ev in &chain {
        let resolved = ev.resolved.borrow().is_some();
        if resolved {
            *ev.resolved.borrow_mut() = Some(cur.clone());
        }
    }
    cur
}

pub fn compress_conref<T: Clone>(c: &Conref<T>) -> Conref<T> {
    c.compress().unwrap_or_else(|e| impos(e))
}

pub fn conref_val<T: Clone>(c: &Conref<T>) -> Option<T> {
    c.value().unwrap_or_else(|e| impos(e))
}

pub fn conref_def<T: Clone>(default: T, c: &Conref<T>) -> T {
    conref_val(c).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// predicates

pub fn is_void(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Void)
}

pub fn is_char_type(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Int(_, IntSize::Char))
}

pub fn is_integral(t: &Ty) -> bool {
    matches!(
        &*compress(t),
        Type::Int(..) | Type::Enum(..) | Type::AnonEnum(_)
    )
}

pub fn is_signed(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Int(Sign::Signed, _))
}

pub fn is_float(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Float(_))
}

pub fn is_arithmetic(t: &Ty) -> bool {
    is_integral(t) || is_float(t)
}

pub fn is_function_type(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Fn(_))
}

pub fn is_pointer_type(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Pointer(_))
}

pub fn is_array_type(t: &Ty) -> bool {
    matches!(&*compress(t), Type::Array(_))
}

pub fn is_region_handle(t: &Ty) -> bool {
    matches!(&*compress(t), Type::RgnHandle(_))
}

pub fn is_scalar(t: &Ty) -> bool {
    is_arithmetic(t) || is_pointer_type(t) || is_region_handle(t)
}

/// Word-sized types that may instantiate a `Box`-kinded variable.
pub fn is_boxed(t: &Ty) -> bool {
    type_kind(t).leq(Kind::Box)
}

pub fn is_pointer_or_boxed(t: &Ty) -> bool {
    is_pointer_type(t) || is_boxed(t)
}

pub fn is_nullable_pointer(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Pointer(p) => conref_def(true, &p.atts.nullable),
        _ => false,
    }
}

pub fn is_zero_terminated_pointer(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Pointer(p) => conref_def(false, &p.atts.zero_term),
        Type::Array(a) => conref_def(false, &a.zero_term),
        _ => false,
    }
}

pub fn is_fat_pointer(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Pointer(p) => conref_def(Bounds::Upper(1), &p.atts.bounds) == Bounds::Fat,
        _ => false,
    }
}

pub fn is_thin_pointer(t: &Ty) -> bool {
    is_pointer_type(t) && !is_fat_pointer(t)
}

/// Pointers into the unique region: moved, never copied.
pub fn is_unique_pointer(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Pointer(p) => matches!(&*compress(&p.atts.rgn), Type::UniqueRgn),
        _ => false,
    }
}

pub fn is_aggregate_type(t: &Ty) -> bool {
    matches!(
        &*compress(t),
        Type::Aggr(_)
            | Type::AnonAggr(..)
            | Type::Tuple(_)
            | Type::Datatype(_)
            | Type::DatatypeField(_)
            | Type::Array(_)
    )
}

pub fn is_union_type(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Aggr(a) => a.kind_and_name().0 == strata_ast::AggrKind::Union,
        Type::AnonAggr(k, _) => *k == strata_ast::AggrKind::Union,
        _ => false,
    }
}

/// Types containing no pointers: any bit pattern is a valid value.
pub fn is_bits_only(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Void | Type::Int(..) | Type::Float(_) | Type::Enum(..) | Type::AnonEnum(_) => true,
        Type::Array(a) => is_bits_only(&a.elt),
        Type::Tuple(ts) => ts.iter().all(|(_, t)| is_bits_only(t)),
        Type::AnonAggr(_, fs) => fs.iter().all(|f| is_bits_only(&f.ty)),
        Type::Aggr(a) => match a.decl().and_then(|d| d.imp.clone()) {
            Some(imp) => {
                let inst = aggr_inst(&a.decl(), &a.targs);
                imp.fields
                    .iter()
                    .all(|f| is_bits_only(&substitute(&inst, &f.ty)))
            }
            None => false,
        },
        _ => false,
    }
}

pub fn is_noreturn_fn(t: &Ty) -> bool {
    match &*compress(t) {
        Type::Fn(f) => f.has_attr(strata_ast::FnAttr::Noreturn),
        Type::Pointer(p) => is_noreturn_fn(&p.elt),
        _ => false,
    }
}

/// `0`, `NULL`, or a cast of either.
pub fn is_zero(e: &ExpRef) -> bool {
    match &*e.kind.borrow() {
        ExpKind::Const(Cnst::Null) => true,
        ExpKind::Const(Cnst::Int(_, 0)) | ExpKind::Const(Cnst::LongLong(_, 0)) => true,
        ExpKind::Const(Cnst::Char(0)) => true,
        ExpKind::Cast(_, inner, _, _) => is_zero(inner),
        _ => false,
    }
}

/// Evaluates integer constant expressions used for array bounds.
pub fn eval_const_uint(e: &ExpRef) -> Option<u64> {
    match &*e.kind.borrow() {
        ExpKind::Const(Cnst::Int(_, i)) | ExpKind::Const(Cnst::LongLong(_, i)) => {
            u64::try_from(*i).ok()
        }
        ExpKind::Const(Cnst::Char(c)) => Some(u64::from(*c)),
        ExpKind::Cast(_, inner, _, _) => eval_const_uint(inner),
        ExpKind::Primop(op, args) if args.len() == 2 => {
            let a = eval_const_uint(&args[0])?;
            let b = eval_const_uint(&args[1])?;
            use strata_ast::Primop::*;
            match op {
                Plus => a.checked_add(b),
                Times => a.checked_mul(b),
                Minus => a.checked_sub(b),
                Div => a.checked_div(b),
                Mod => a.checked_rem(b),
                _ => None,
            }
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// destructors

pub fn pointer_elt_type(t: &Ty) -> Option<Ty> {
    match &*compress(t) {
        Type::Pointer(p) => Some(p.elt.clone()),
        _ => None,
    }
}

pub fn pointer_region(t: &Ty) -> Option<Ty> {
    match &*compress(t) {
        Type::Pointer(p) => Some(compress(&p.atts.rgn)),
        _ => None,
    }
}

pub fn array_elt_type(t: &Ty) -> Option<Ty> {
    match &*compress(t) {
        Type::Array(a) => Some(a.elt.clone()),
        _ => None,
    }
}

pub fn handle_region(t: &Ty) -> Option<Ty> {
    match &*compress(t) {
        Type::RgnHandle(r) => Some(compress(r)),
        _ => None,
    }
}

/// Instantiation for an aggregate's type parameters.
pub fn aggr_inst(decl: &Option<Rc<AggrDecl>>, targs: &[Ty]) -> Vec<(Tvar, Ty)> {
    match decl {
        Some(d) => d.tvars.iter().cloned().zip(targs.iter().cloned()).collect(),
        None => Vec::new(),
    }
}

/// Field index (declaration order) and instantiated type of `field`.
pub fn aggr_field(t: &Ty, field: &str) -> Option<(usize, Ty)> {
    match &*compress(t) {
        Type::Aggr(a) => {
            let decl = a.decl();
            let (i, f) = decl.as_ref()?.field(field)?;
            let ty = substitute(&aggr_inst(&decl, &a.targs), &f.ty);
            Some((i, ty))
        }
        Type::AnonAggr(_, fields) => fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == field)
            .map(|(i, f)| (i, f.ty.clone())),
        _ => None,
    }
}

/// Instantiated field types of a struct, union or tuple.
pub fn aggr_field_types(t: &Ty) -> Option<Vec<Ty>> {
    match &*compress(t) {
        Type::Aggr(a) => {
            let decl = a.decl();
            let imp = decl.as_ref()?.imp.clone()?;
            let inst = aggr_inst(&decl, &a.targs);
            Some(imp.fields.iter().map(|f| substitute(&inst, &f.ty)).collect())
        }
        Type::AnonAggr(_, fields) => Some(fields.iter().map(|f| f.ty.clone()).collect()),
        Type::Tuple(ts) => Some(ts.iter().map(|(_, t)| t.clone()).collect()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// kinds

pub fn tvar_kind(tv: &Tvar, default: Kind) -> Kind {
    match tv.bound() {
        KindBound::Eq(k) | KindBound::Less(k) => k,
        KindBound::Unknown => default,
    }
}

pub fn type_kind(t: &Ty) -> Kind {
    match &*compress(t) {
        Type::Void => Kind::Mem,
        Type::Evar(ev) => ev.kind.borrow().unwrap_or(Kind::Any),
        Type::Var(tv) => tvar_kind(tv, Kind::Box),
        Type::Int(_, IntSize::Int | IntSize::Long) => Kind::Box,
        Type::Int(..) => Kind::Mem,
        Type::Float(_) => Kind::Mem,
        Type::Enum(..) | Type::AnonEnum(_) => Kind::Box,
        Type::Pointer(p) => match conref_def(Bounds::Upper(1), &p.atts.bounds) {
            Bounds::Fat => Kind::Mem,
            Bounds::Upper(_) => Kind::Box,
        },
        Type::Array(_) | Type::Tuple(_) | Type::AnonAggr(..) | Type::Fn(_) => Kind::Mem,
        Type::Aggr(a) => match a.decl() {
            Some(d) if d.imp.is_some() => Kind::Mem,
            _ => Kind::Any,
        },
        Type::Datatype(_) => Kind::Box,
        Type::DatatypeField(_) => Kind::Mem,
        Type::RgnHandle(_) => Kind::Box,
        Type::HeapRgn | Type::UniqueRgn => Kind::Rgn,
        Type::AccessEff(_) | Type::JoinEff(_) | Type::RgnsEff(_) => Kind::Eff,
        Type::Typedef(td) => td
            .decl
            .borrow()
            .as_ref()
            .and_then(|d| d.kind)
            .unwrap_or(Kind::Any),
    }
}

// ---------------------------------------------------------------------------
// effects

/// The effect of accessing every region a value of type `t` may point into.
pub fn rgns_of(t: &Ty) -> Vec<Ty> {
    let t = compress(t);
    match &*t {
        Type::Void
        | Type::Int(..)
        | Type::Float(_)
        | Type::Enum(..)
        | Type::AnonEnum(_)
        | Type::HeapRgn
        | Type::UniqueRgn => Vec::new(),
        Type::Evar(_) => match type_kind(&t) {
            Kind::Rgn => vec![Type::access_eff(t.clone())],
            Kind::Eff => vec![t.clone()],
            _ => vec![Type::rgns_eff(t.clone())],
        },
        Type::Var(tv) => match tvar_kind(tv, Kind::Box) {
            Kind::Rgn => vec![Type::access_eff(t.clone())],
            Kind::Eff => vec![t.clone()],
            Kind::Int => Vec::new(),
            _ => vec![Type::rgns_eff(t.clone())],
        },
        Type::Pointer(p) => {
            let mut out = vec![Type::access_eff(p.atts.rgn.clone())];
            out.extend(rgns_of(&p.elt));
            out
        }
        Type::Array(a) => rgns_of(&a.elt),
        Type::Tuple(ts) => ts.iter().flat_map(|(_, t)| rgns_of(t)).collect(),
        Type::AnonAggr(_, fs) => fs.iter().flat_map(|f| rgns_of(&f.ty)).collect(),
        Type::Aggr(a) => a.targs.iter().flat_map(rgns_of).collect(),
        Type::Datatype(d) => d.targs.iter().flat_map(rgns_of).collect(),
        Type::DatatypeField(d) => d.targs.iter().flat_map(rgns_of).collect(),
        Type::RgnHandle(r) => vec![Type::access_eff(r.clone())],
        Type::Fn(_) => Vec::new(),
        Type::AccessEff(_) | Type::JoinEff(_) | Type::RgnsEff(_) => normalize_effect(&t),
        Type::Typedef(td) => td.args.iter().flat_map(rgns_of).collect(),
    }
}

/// Flattens an effect into a duplicate-free list of atoms: `AccessEff(r)`,
/// effect variables and evars, and `RgnsEff` of variables.
pub fn normalize_effect(e: &Ty) -> Vec<Ty> {
    let mut out: Vec<Ty> = Vec::new();
    let mut push = |atom: Ty, out: &mut Vec<Ty>| {
        if !out.iter().any(|a| typecmp(a, &atom)) {
            out.push(atom);
        }
    };
    let mut work = vec![e.clone()];
    while let Some(cur) = work.pop() {
        let cur = compress(&cur);
        match &*cur {
            Type::JoinEff(es) => work.extend(es.iter().rev().cloned()),
            Type::AccessEff(r) => {
                let r = compress(r);
                match &*r {
                    // Accessing the heap or the unique region is always allowed.
                    Type::HeapRgn | Type::UniqueRgn => {}
                    _ => push(Type::access_eff(r), &mut out),
                }
            }
            Type::RgnsEff(t) => {
                let t = compress(t);
                match &*t {
                    Type::Var(_) | Type::Evar(_) => push(Type::rgns_eff(t), &mut out),
                    _ => work.extend(rgns_of(&t)),
                }
            }
            _ => push(cur.clone(), &mut out),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// free variables and substitution

fn free_tvars_into(t: &Ty, bound: &mut Vec<Tvar>, out: &mut Vec<Tvar>) {
    let t = compress(t);
    let mut go =
        |t: &Ty, bound: &mut Vec<Tvar>, out: &mut Vec<Tvar>| free_tvars_into(t, bound, out);
    match &*t {
        Type::Var(tv) => {
            if !bound.contains(tv) && !out.contains(tv) {
                out.push(tv.clone());
            }
        }
        Type::Void
        | Type::Evar(_)
        | Type::Int(..)
        | Type::Float(_)
        | Type::Enum(..)
        | Type::AnonEnum(_)
        | Type::HeapRgn
        | Type::UniqueRgn => {}
        Type::Pointer(p) => {
            go(&p.elt, bound, out);
            go(&p.atts.rgn, bound, out);
        }
        Type::Array(a) => go(&a.elt, bound, out),
        Type::Fn(f) => {
            let mark = bound.len();
            bound.extend(f.tvars.iter().cloned());
            if let Some(e) = &*f.effect.borrow() {
                go(e, bound, out);
            }
            go(&f.ret, bound, out);
            for a in &f.args {
                go(&a.ty, bound, out);
            }
            if let Some(v) = &f.cyc_varargs {
                go(&v.ty, bound, out);
            }
            for (e, r) in &f.rgn_po {
                go(e, bound, out);
                go(r, bound, out);
            }
            bound.truncate(mark);
        }
        Type::Tuple(ts) => ts.iter().for_each(|(_, t)| go(t, bound, out)),
        Type::AnonAggr(_, fs) => fs.iter().for_each(|f| go(&f.ty, bound, out)),
        Type::Aggr(a) => a.targs.iter().for_each(|t| go(t, bound, out)),
        Type::Datatype(d) => d.targs.iter().for_each(|t| go(t, bound, out)),
        Type::DatatypeField(d) => d.targs.iter().for_each(|t| go(t, bound, out)),
        Type::RgnHandle(t) | Type::AccessEff(t) | Type::RgnsEff(t) => go(t, bound, out),
        Type::JoinEff(es) => es.iter().for_each(|t| go(t, bound, out)),
        Type::Typedef(td) => td.args.iter().for_each(|t| go(t, bound, out)),
    }
}

pub fn free_tvars(t: &Ty) -> Vec<Tvar> {
    let mut out = Vec::new();
    free_tvars_into(t, &mut Vec::new(), &mut out);
    out
}

/// Unresolved evars occurring in `t`.
pub fn free_evars(t: &Ty) -> Vec<Ty> {
    let mut out: Vec<Ty> = Vec::new();
    let mut seen = HashSet::new();
    let mut work = vec![t.clone()];
    while let Some(cur) = work.pop() {
        let cur = compress(&cur);
        match &*cur {
            Type::Evar(ev) => {
                if seen.insert(ev.id) {
                    out.push(cur.clone());
                }
            }
            Type::Pointer(p) => {
                work.push(p.elt.clone());
                work.push(p.atts.rgn.clone());
            }
            Type::Array(a) => work.push(a.elt.clone()),
            Type::Fn(f) => {
                if let Some(e) = &*f.effect.borrow() {
                    work.push(e.clone());
                }
                work.push(f.ret.clone());
                work.extend(f.args.iter().map(|a| a.ty.clone()));
            }
            Type::Tuple(ts) => work.extend(ts.iter().map(|(_, t)| t.clone())),
            Type::AnonAggr(_, fs) => work.extend(fs.iter().map(|f| f.ty.clone())),
            Type::Aggr(a) => work.extend(a.targs.iter().cloned()),
            Type::Datatype(d) => work.extend(d.targs.iter().cloned()),
            Type::DatatypeField(d) => work.extend(d.targs.iter().cloned()),
            Type::RgnHandle(t) | Type::AccessEff(t) | Type::RgnsEff(t) => work.push(t.clone()),
            Type::JoinEff(es) => work.extend(es.iter().cloned()),
            Type::Typedef(td) => work.extend(td.args.iter().cloned()),
            _ => {}
        }
    }
    out
}

/// Replaces type variables according to `inst`. Unresolved evars and
/// constraint cells are shared with the original.
pub fn substitute(inst: &[(Tvar, Ty)], t: &Ty) -> Ty {
    if inst.is_empty() {
        return t.clone();
    }
    let t = compress(t);
    let subst = |t: &Ty| substitute(inst, t);
    let substs = |ts: &[Ty]| ts.iter().map(|t| substitute(inst, t)).collect::<Vec<_>>();
    let new = match &*t {
        Type::Var(tv) => {
            return inst
                .iter()
                .find(|(v, _)| v == tv)
                .map(|(_, t)| t.clone())
                .unwrap_or_else(|| t.clone());
        }
        Type::Void
        | Type::Evar(_)
        | Type::Int(..)
        | Type::Float(_)
        | Type::Enum(..)
        | Type::AnonEnum(_)
        | Type::HeapRgn
        | Type::UniqueRgn => return t.clone(),
        Type::Pointer(p) => Type::Pointer(PtrInfo {
            elt: subst(&p.elt),
            elt_tq: p.elt_tq,
            atts: PtrAtts {
                rgn: subst(&p.atts.rgn),
                nullable: p.atts.nullable.clone(),
                bounds: p.atts.bounds.clone(),
                zero_term: p.atts.zero_term.clone(),
            },
        }),
        Type::Array(a) => Type::Array(ArrayInfo {
            elt: subst(&a.elt),
            tq: a.tq,
            num_elts: a.num_elts.clone(),
            zero_term: a.zero_term.clone(),
        }),
        Type::Fn(f) => {
            // Bound variables shadow the instantiation.
            let inner: Vec<(Tvar, Ty)> = inst
                .iter()
                .filter(|(v, _)| !f.tvars.contains(v))
                .cloned()
                .collect();
            Type::Fn(subst_fn_info(&inner, f))
        }
        Type::Tuple(ts) => Type::Tuple(ts.iter().map(|(tq, t)| (*tq, subst(t))).collect()),
        Type::AnonAggr(k, fs) => Type::AnonAggr(
            *k,
            fs.iter()
                .map(|f| strata_ast::AggrField {
                    name: f.name.clone(),
                    tq: f.tq,
                    ty: subst(&f.ty),
                    width: f.width.clone(),
                })
                .collect(),
        ),
        Type::Aggr(a) => Type::Aggr(AggrInfo {
            aggr: std::cell::RefCell::new(a.aggr.borrow().clone()),
            targs: substs(&a.targs),
        }),
        Type::Datatype(d) => Type::Datatype(DatatypeInfo {
            dt: std::cell::RefCell::new(d.dt.borrow().clone()),
            targs: substs(&d.targs),
        }),
        Type::DatatypeField(d) => Type::DatatypeField(DatatypeFieldInfo {
            field: std::cell::RefCell::new(d.field.borrow().clone()),
            targs: substs(&d.targs),
        }),
        Type::RgnHandle(r) => Type::RgnHandle(subst(r)),
        Type::AccessEff(r) => Type::AccessEff(subst(r)),
        Type::JoinEff(es) => Type::JoinEff(substs(es)),
        Type::RgnsEff(t) => Type::RgnsEff(subst(t)),
        Type::Typedef(td) => Type::Typedef(TypedefInfo {
            name: td.name.clone(),
            args: substs(&td.args),
            decl: std::cell::RefCell::new(td.decl.borrow().clone()),
            expanded: std::cell::RefCell::new(None),
        }),
    };
    Rc::new(new)
}

pub(crate) fn subst_fn_info(inst: &[(Tvar, Ty)], f: &FnInfo) -> FnInfo {
    let subst = |t: &Ty| substitute(inst, t);
    FnInfo {
        tvars: f.tvars.clone(),
        effect: std::cell::RefCell::new(f.effect.borrow().as_ref().map(subst)),
        ret_tq: f.ret_tq,
        ret: subst(&f.ret),
        args: f
            .args
            .iter()
            .map(|a| FnArg {
                name: a.name.clone(),
                tq: a.tq,
                ty: subst(&a.ty),
            })
            .collect(),
        c_varargs: f.c_varargs,
        cyc_varargs: f.cyc_varargs.as_ref().map(|v| VarargInfo {
            name: v.name.clone(),
            tq: v.tq,
            ty: subst(&v.ty),
            inject: v.inject,
        }),
        rgn_po: f.rgn_po.iter().map(|(e, r)| (subst(e), subst(r))).collect(),
        attributes: f.attributes.clone(),
    }
}

// ---------------------------------------------------------------------------
// structural comparison

fn conref_same<T: Clone + PartialEq>(a: &Conref<T>, b: &Conref<T>) -> bool {
    match (conref_val(a), conref_val(b)) {
        (Some(x), Some(y)) => x == y,
        (None, None) => compress_conref(a).ptr_eq(&compress_conref(b)),
        _ => false,
    }
}

fn aggr_same(a: &AggrInfo, b: &AggrInfo) -> bool {
    match (&*a.aggr.borrow(), &*b.aggr.borrow()) {
        (AggrRef::Known(x), AggrRef::Known(y)) => x.ptr_eq(y),
        _ => a.kind_and_name() == b.kind_and_name(),
    }
}

/// Structural equality without unification. Evars compare by identity,
/// effects as sets.
pub fn typecmp(t1: &Ty, t2: &Ty) -> bool {
    let t1 = compress(t1);
    let t2 = compress(t2);
    if Rc::ptr_eq(&t1, &t2) {
        return true;
    }
    let all = |a: &[Ty], b: &[Ty]| {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| typecmp(x, y))
    };
    match (&*t1, &*t2) {
        (Type::Void, Type::Void) => true,
        (Type::Evar(a), Type::Evar(b)) => a.id == b.id,
        (Type::Var(a), Type::Var(b)) => a == b,
        (Type::Int(s1, z1), Type::Int(s2, z2)) => s1 == s2 && z1 == z2,
        (Type::Float(a), Type::Float(b)) => a == b,
        (Type::HeapRgn, Type::HeapRgn) | (Type::UniqueRgn, Type::UniqueRgn) => true,
        (Type::Pointer(a), Type::Pointer(b)) => {
            a.elt_tq == b.elt_tq
                && typecmp(&a.elt, &b.elt)
                && typecmp(&a.atts.rgn, &b.atts.rgn)
                && conref_same(&a.atts.nullable, &b.atts.nullable)
                && conref_same(&a.atts.bounds, &b.atts.bounds)
                && conref_same(&a.atts.zero_term, &b.atts.zero_term)
        }
        (Type::Array(a), Type::Array(b)) => {
            a.tq == b.tq
                && typecmp(&a.elt, &b.elt)
                && conref_same(&a.zero_term, &b.zero_term)
                && a.num_elts.as_ref().and_then(eval_const_uint)
                    == b.num_elts.as_ref().and_then(eval_const_uint)
        }
        (Type::Fn(a), Type::Fn(b)) => {
            if a.tvars.len() != b.tvars.len() || a.args.len() != b.args.len() {
                return false;
            }
            let inst: Vec<(Tvar, Ty)> = b
                .tvars
                .iter()
                .cloned()
                .zip(a.tvars.iter().map(Type::var))
                .collect();
            let b = subst_fn_info(&inst, b);
            let effects_same = match (&*a.effect.borrow(), &*b.effect.borrow()) {
                (Some(x), Some(y)) => typecmp(x, y),
                (None, None) => true,
                _ => false,
            };
            effects_same
                && typecmp(&a.ret, &b.ret)
                && a.c_varargs == b.c_varargs
                && a.args.iter().zip(&b.args).all(|(x, y)| typecmp(&x.ty, &y.ty))
        }
        (Type::Tuple(a), Type::Tuple(b)) => {
            a.len() == b.len()
                && a.iter()
                    .zip(b)
                    .all(|((q1, x), (q2, y))| q1 == q2 && typecmp(x, y))
        }
        (Type::Aggr(a), Type::Aggr(b)) => aggr_same(a, b) && all(&a.targs, &b.targs),
        (Type::AnonAggr(k1, f1), Type::AnonAggr(k2, f2)) => {
            k1 == k2
                && f1.len() == f2.len()
                && f1
                    .iter()
                    .zip(f2)
                    .all(|(x, y)| x.name == y.name && x.tq == y.tq && typecmp(&x.ty, &y.ty))
        }
        (Type::Enum(a, _), Type::Enum(b, _)) => a.same(b),
        (Type::AnonEnum(a), Type::AnonEnum(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.name == y.name)
        }
        (Type::Datatype(a), Type::Datatype(b)) => {
            let same = match (a.decl(), b.decl()) {
                (Some(x), Some(y)) => Rc::ptr_eq(&x, &y),
                _ => false,
            };
            same && all(&a.targs, &b.targs)
        }
        (Type::DatatypeField(a), Type::DatatypeField(b)) => {
            let same = match (&*a.field.borrow(), &*b.field.borrow()) {
                (
                    strata_ast::DatatypeFieldRef::Known(_, f1),
                    strata_ast::DatatypeFieldRef::Known(_, f2),
                ) => Rc::ptr_eq(f1, f2),
                _ => false,
            };
            same && all(&a.targs, &b.targs)
        }
        (Type::RgnHandle(a), Type::RgnHandle(b)) => typecmp(a, b),
        (
            Type::AccessEff(_) | Type::JoinEff(_) | Type::RgnsEff(_),
            Type::AccessEff(_) | Type::JoinEff(_) | Type::RgnsEff(_),
        ) => {
            let a = normalize_effect(&t1);
            let b = normalize_effect(&t2);
            a.len() == b.len() && a.iter().all(|x| b.iter().any(|y| typecmp(x, y)))
        }
        (Type::Typedef(a), Type::Typedef(b)) => a.name.same(&b.name) && all(&a.args, &b.args),
        _ => false,
    }
}
