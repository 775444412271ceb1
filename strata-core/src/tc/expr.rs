//! Expression checking.
//!
//! `tc_exp` computes the type of an expression, records it on the node and
//! resolves names in place: identifiers become variables, enum tags or
//! datatype constructors, calls are split from constructor applications and
//! brace initializers are given their aggregate.

use std::rc::Rc;

use strata_ast::{
    AggrDecl, AggrKind, ArrayInfo, Binding, Cnst, Conref, DatatypeDecl, DatatypeField, Exp,
    ExpKind, ExpRef, FieldInit, FloatKind, FnInfo, IntSize, Kind, Primop, QualName, Sign, Span,
    StmtKind, StmtRef, Tqual, Ty, Type,
};

use super::{fresh_evar, mismatch, tc_stmt};
use crate::ctx::Ctx;
use crate::error::{ErrorKind, impos};
use crate::tcenv::{Resolved, Tenv};
use crate::tcutil::{
    aggr_field, aggr_inst, castable, check_type, coerce_arg, coerce_arithmetic, coerce_assign,
    coerce_to_bool, coerce_uint_type, coerce_use, compress, eval_const_uint, insert_alias,
    is_arithmetic, is_integral, is_pointer_type, is_unique_pointer, is_zero, pointer_elt_type,
    pointer_region, subst_fn_info, substitute, tvar_kind, unify,
};

/// Types `e`, using `topt` as a hint for literals and initializers, and
/// records the result on the node.
pub(crate) fn tc_exp(ctx: &Ctx, te: &Tenv, topt: Option<&Ty>, e: &ExpRef) -> Ty {
    let t = tc_exp_kind(ctx, te, topt, e);
    e.set_ty(t.clone());
    t
}

fn tc_exp_kind(ctx: &Ctx, te: &Tenv, topt: Option<&Ty>, e: &ExpRef) -> Ty {
    let kind = e.kind.borrow();
    match &*kind {
        ExpKind::Const(c) => {
            let c = c.clone();
            drop(kind);
            tc_const(topt, &c)
        }
        ExpKind::UnknownId(q) | ExpKind::Var(q, Binding::Unresolved) => {
            let q = q.clone();
            drop(kind);
            resolve_id(ctx, te, topt, e, q)
        }
        ExpKind::Var(_, b) => {
            let b = b.clone();
            drop(kind);
            binding_type(&b)
        }
        ExpKind::Primop(op, args) => {
            let (op, args) = (*op, args.clone());
            drop(kind);
            for a in &args {
                tc_exp(ctx, te, None, a);
            }
            tc_primop(ctx, e.span, op, &args)
        }
        ExpKind::AssignOp(lhs, op, rhs) => {
            let (lhs, op, rhs) = (lhs.clone(), *op, rhs.clone());
            drop(kind);
            tc_assignop(ctx, te, e.span, &lhs, op, &rhs)
        }
        ExpKind::Increment(inner, _) => {
            let inner = inner.clone();
            drop(kind);
            let t = tc_exp(ctx, te, None, &inner);
            check_lvalue(ctx, &inner, "increment or decrement");
            if !is_arithmetic(&t) && !is_pointer_type(&t) {
                ctx.error(
                    ErrorKind::Type,
                    e.span,
                    format!("increment or decrement of a value of type {t}"),
                );
            }
            t
        }
        ExpKind::Conditional(c, a, b) => {
            let (c, a, b) = (c.clone(), a.clone(), b.clone());
            drop(kind);
            tc_conditional(ctx, te, topt, &c, &a, &b)
        }
        ExpKind::And(a, b) | ExpKind::Or(a, b) => {
            let (a, b) = (a.clone(), b.clone());
            drop(kind);
            for x in [&a, &b] {
                tc_test(ctx, te, x, "operand of && or ||");
            }
            Type::sint()
        }
        ExpKind::SeqExp(a, b) => {
            let (a, b) = (a.clone(), b.clone());
            drop(kind);
            tc_exp(ctx, te, None, &a);
            tc_exp(ctx, te, topt, &b)
        }
        ExpKind::UnknownCall(func, args) => {
            let (func, args) = (func.clone(), args.clone());
            drop(kind);
            let ctor = match &*func.kind.borrow() {
                ExpKind::UnknownId(q) => match te.lookup_ordinary(q) {
                    Some(Resolved::Datatype(dd, df)) => Some((dd, df)),
                    _ => None,
                },
                _ => None,
            };
            match ctor {
                Some((dd, df)) => {
                    e.replace_kind(ExpKind::Datatype(args.clone(), dd.clone(), df.clone()));
                    tc_datatype(ctx, te, e.span, &args, &dd, &df)
                }
                None => {
                    e.replace_kind(ExpKind::FnCall(func.clone(), args.clone()));
                    tc_fncall(ctx, te, e.span, &func, &args)
                }
            }
        }
        ExpKind::FnCall(func, args) => {
            let (func, args) = (func.clone(), args.clone());
            drop(kind);
            tc_fncall(ctx, te, e.span, &func, &args)
        }
        ExpKind::Throw(inner) => {
            let inner = inner.clone();
            drop(kind);
            tc_exp(ctx, te, None, &inner);
            topt.cloned().unwrap_or_else(|| fresh_evar(Kind::Any))
        }
        ExpKind::NoInstantiate(inner) => {
            let inner = inner.clone();
            drop(kind);
            tc_exp(ctx, te, topt, &inner)
        }
        ExpKind::Instantiate(inner, targs) => {
            let (inner, targs) = (inner.clone(), targs.clone());
            drop(kind);
            tc_instantiate(ctx, te, e.span, &inner, &targs)
        }
        ExpKind::Cast(t, inner, ..) => {
            let (t, inner) = (t.clone(), inner.clone());
            drop(kind);
            check_type(ctx, te, e.span, &[], Kind::Any, true, &t);
            let t1 = tc_exp(ctx, te, Some(&t), &inner);
            match castable(ctx, te, &t1, &t) {
                Some(c) => {
                    if let ExpKind::Cast(_, _, _, slot) = &mut *e.kind.borrow_mut() {
                        *slot = c;
                    }
                }
                None => mismatch(ctx, e.span, format!("cannot cast {t1} to {t}")),
            }
            t
        }
        ExpKind::Address(inner) => {
            let inner = inner.clone();
            drop(kind);
            let t = tc_exp(ctx, te, topt.and_then(pointer_elt_type).as_ref(), &inner);
            match lvalue_region(&inner) {
                Some(rgn) => {
                    mark_escaped(&inner);
                    Type::at(t, rgn)
                }
                None => {
                    ctx.error(ErrorKind::Type, e.span, "& applied to a non-lvalue");
                    Type::at(t, Type::heap_rgn())
                }
            }
        }
        ExpKind::New(rgn, init) => {
            let (rgn, init) = (rgn.clone(), init.clone());
            drop(kind);
            let rgn = match &rgn {
                Some(h) => tc_rgn_handle(ctx, te, h),
                None => Type::heap_rgn(),
            };
            let hint = topt.and_then(pointer_elt_type);
            let t = tc_exp(ctx, te, hint.as_ref(), &init);
            Type::at(t, rgn)
        }
        ExpKind::Malloc(info) => {
            let (rgn, elt, num, fat) = (
                info.rgn.clone(),
                info.elt_type.borrow().clone(),
                info.num_elts.clone(),
                info.fat_result,
            );
            drop(kind);
            tc_malloc(ctx, te, topt, e, rgn.as_ref(), elt, &num, fat)
        }
        ExpKind::Sizeoftyp(t) => {
            let t = t.clone();
            drop(kind);
            check_type(ctx, te, e.span, &[], Kind::Mem, true, &t);
            Type::uint()
        }
        ExpKind::Sizeofexp(inner) => {
            let inner = inner.clone();
            drop(kind);
            tc_exp(ctx, te, None, &inner);
            Type::uint()
        }
        ExpKind::Deref(ptr) => {
            let ptr = ptr.clone();
            drop(kind);
            let t = tc_exp(ctx, te, None, &ptr);
            match &*compress(&t) {
                Type::Pointer(p) => {
                    te.check_rgn_accessible(ctx, e.span, &p.atts.rgn);
                    p.elt.clone()
                }
                _ => {
                    ctx.error(
                        ErrorKind::Type,
                        e.span,
                        format!("expecting a pointer type but found {t}"),
                    );
                    fresh_evar(Kind::Any)
                }
            }
        }
        ExpKind::AggrMember(inner, field) => {
            let (inner, field) = (inner.clone(), field.clone());
            drop(kind);
            let t = tc_exp(ctx, te, None, &inner);
            member_type(ctx, e.span, &t, &field)
        }
        ExpKind::AggrArrow(ptr, field) => {
            let (ptr, field) = (ptr.clone(), field.clone());
            drop(kind);
            let t = tc_exp(ctx, te, None, &ptr);
            match &*compress(&t) {
                Type::Pointer(p) => {
                    te.check_rgn_accessible(ctx, e.span, &p.atts.rgn);
                    member_type(ctx, e.span, &p.elt, &field)
                }
                _ => {
                    ctx.error(
                        ErrorKind::Type,
                        e.span,
                        format!("-> applied to a value of type {t}"),
                    );
                    fresh_evar(Kind::Any)
                }
            }
        }
        ExpKind::Subscript(base, idx) => {
            let (base, idx) = (base.clone(), idx.clone());
            drop(kind);
            tc_subscript(ctx, te, e.span, &base, &idx)
        }
        ExpKind::Tuple(es) => {
            let es = es.clone();
            drop(kind);
            let hints: Vec<Ty> = match topt.map(compress).as_deref() {
                Some(Type::Tuple(ts)) if ts.len() == es.len() => {
                    ts.iter().map(|(_, t)| t.clone()).collect()
                }
                _ => Vec::new(),
            };
            let ts = es
                .iter()
                .enumerate()
                .map(|(i, x)| tc_exp(ctx, te, hints.get(i), x))
                .collect();
            Type::tuple(ts)
        }
        ExpKind::Aggregate {
            name, fields, decl, ..
        } => {
            let (name, fields, decl) = (name.clone(), fields.clone(), decl.clone());
            drop(kind);
            let decl = decl.or_else(|| te.lookup_aggrdecl(&name));
            match decl {
                Some(ad) => tc_aggregate(ctx, te, e, &ad, &fields),
                None => {
                    ctx.error(ErrorKind::Name, e.span, format!("undeclared struct {name}"));
                    tc_field_exps(ctx, te, &fields);
                    fresh_evar(Kind::Any)
                }
            }
        }
        ExpKind::AnonStruct(t, fields) => {
            let (t, fields) = (t.clone(), fields.clone());
            drop(kind);
            tc_anon_struct(ctx, te, e.span, &t, &fields)
        }
        ExpKind::Datatype(args, dd, df) => {
            let (args, dd, df) = (args.clone(), dd.clone(), df.clone());
            drop(kind);
            tc_datatype(ctx, te, e.span, &args, &dd, &df)
        }
        ExpKind::Enum(ed, _) => Type::enum_known(ed),
        ExpKind::AnonEnum(t, _) => t.clone(),
        ExpKind::Swap(a, b) => {
            let (a, b) = (a.clone(), b.clone());
            drop(kind);
            let ta = tc_exp(ctx, te, None, &a);
            let tb = tc_exp(ctx, te, Some(&ta), &b);
            check_lvalue(ctx, &a, "swap");
            check_lvalue(ctx, &b, "swap");
            if !unify(ctx, &ta, &tb) {
                mismatch(ctx, e.span, format!("type mismatch in swap: {ta} != {tb}"));
            }
            Type::void()
        }
        ExpKind::UnresolvedMem(name, fields) => {
            let (name, fields) = (name.clone(), fields.clone());
            drop(kind);
            tc_unresolved_mem(ctx, te, topt, e, name, fields)
        }
        ExpKind::StmtExp(s) => {
            let s = s.clone();
            drop(kind);
            tc_stmt(ctx, te, &s);
            match last_exp_type(&s) {
                Some(t) => t,
                None => {
                    ctx.error(
                        ErrorKind::Type,
                        e.span,
                        "statement expression must end with an expression",
                    );
                    fresh_evar(Kind::Any)
                }
            }
        }
        ExpKind::Array(es) => {
            let es = es.clone();
            drop(kind);
            tc_array(ctx, te, topt, e.span, &es)
        }
    }
}

fn tc_const(topt: Option<&Ty>, c: &Cnst) -> Ty {
    match c {
        Cnst::Null => Type::star(fresh_evar(Kind::Any), fresh_evar(Kind::Rgn)),
        Cnst::Int(sign, _) => match topt {
            Some(t) if is_integral(t) => t.clone(),
            _ => Type::int(*sign, IntSize::Int),
        },
        Cnst::LongLong(sign, _) => Type::int(*sign, IntSize::LongLong),
        Cnst::Char(_) => Type::char(),
        Cnst::Float(_) => Type::float(FloatKind::Double),
        Cnst::Str(_) => Type::fat(Type::char(), Type::heap_rgn()),
    }
}

fn binding_type(b: &Binding) -> Ty {
    match b {
        Binding::Global(vd) | Binding::Param(vd) | Binding::Local(vd) | Binding::Pat(vd) => {
            vd.ty()
        }
        Binding::Fun(w) => match w.upgrade().and_then(|fd| fd.fn_ty()) {
            Some(t) => t,
            None => impos("reference to a function whose type was never computed"),
        },
        Binding::Unresolved => impos("typing an unresolved variable"),
    }
}

fn resolve_id(ctx: &Ctx, te: &Tenv, topt: Option<&Ty>, e: &ExpRef, q: QualName) -> Ty {
    match te.lookup_ordinary(&q) {
        Some(Resolved::Var(b)) => {
            let t = binding_type(&b);
            e.replace_kind(ExpKind::Var(q, b));
            t
        }
        Some(Resolved::Enum(ed, i)) => {
            e.replace_kind(ExpKind::Enum(ed.clone(), i));
            Type::enum_known(&ed)
        }
        Some(Resolved::AnonEnum(t, i)) => {
            let name = match &*compress(&t) {
                Type::AnonEnum(fs) => fs.get(i).map(|f| f.name.name.clone()),
                _ => None,
            }
            .unwrap_or_else(|| q.name.clone());
            e.replace_kind(ExpKind::AnonEnum(t.clone(), name));
            t
        }
        Some(Resolved::Datatype(dd, df)) => {
            e.replace_kind(ExpKind::Datatype(Vec::new(), dd.clone(), df.clone()));
            tc_datatype(ctx, te, e.span, &[], &dd, &df)
        }
        Some(Resolved::Aggr(ad)) => {
            ctx.error(
                ErrorKind::Type,
                e.span,
                format!("{} {q} used as an expression", ad.kind),
            );
            topt.cloned().unwrap_or_else(|| fresh_evar(Kind::Any))
        }
        None => {
            ctx.error(ErrorKind::Name, e.span, format!("undeclared identifier {q}"));
            fresh_evar(Kind::Any)
        }
    }
}

fn arity_error(ctx: &Ctx, span: Span, op: Primop, n: usize) -> Ty {
    ctx.error(
        ErrorKind::Type,
        span,
        format!("primitive operator {op} expects {n} argument(s)"),
    );
    Type::sint()
}

fn arg_ty(e: &ExpRef) -> Ty {
    e.ty()
        .unwrap_or_else(|| impos("operand was not typed before its operator"))
}

fn tc_primop(ctx: &Ctx, span: Span, op: Primop, args: &[ExpRef]) -> Ty {
    match (op, args) {
        (Primop::Not, [a]) => {
            if !coerce_to_bool(ctx, a) {
                ctx.error(
                    ErrorKind::Type,
                    span,
                    format!("! applied to a value of type {}", arg_ty(a)),
                );
            }
            Type::sint()
        }
        (Primop::Not, _) => arity_error(ctx, span, op, 1),
        (Primop::Bitnot, [a]) => {
            let t = arg_ty(a);
            if !is_integral(&t) {
                ctx.error(ErrorKind::Type, span, format!("~ applied to a value of type {t}"));
            }
            t
        }
        (Primop::Bitnot, _) => arity_error(ctx, span, op, 1),
        (Primop::Minus, [a]) => {
            let t = arg_ty(a);
            if !is_arithmetic(&t) {
                ctx.error(ErrorKind::Type, span, format!("- applied to a value of type {t}"));
            }
            t
        }
        (Primop::Numelts, [a]) => {
            let t = compress(&arg_ty(a));
            if !matches!(&*t, Type::Pointer(_) | Type::Array(_)) {
                ctx.error(
                    ErrorKind::Type,
                    span,
                    format!("numelts applied to a value of type {t}"),
                );
            }
            Type::uint()
        }
        (Primop::Numelts, _) => arity_error(ctx, span, op, 1),
        (_, [a, b]) => tc_binop(ctx, span, op, a, b),
        _ => arity_error(ctx, span, op, 2),
    }
}

fn tc_binop(ctx: &Ctx, span: Span, op: Primop, a: &ExpRef, b: &ExpRef) -> Ty {
    let (ta, tb) = (arg_ty(a), arg_ty(b));
    if op.is_comparison() {
        let ok = coerce_arithmetic(a, b).is_some()
            || (is_pointer_type(&ta) && is_pointer_type(&tb) && unify(ctx, &ta, &tb))
            || (is_zero(b) && is_pointer_type(&ta))
            || (is_zero(a) && is_pointer_type(&tb));
        if !ok {
            mismatch(ctx, span, format!("comparison of {ta} with {tb}"));
        }
        return Type::sint();
    }
    match op {
        Primop::Plus if is_pointer_type(&ta) && is_integral(&tb) => return ta,
        Primop::Plus if is_integral(&ta) && is_pointer_type(&tb) => return tb,
        Primop::Minus if is_pointer_type(&ta) && is_integral(&tb) => return ta,
        Primop::Minus if is_pointer_type(&ta) && is_pointer_type(&tb) => {
            if !unify(ctx, &ta, &tb) {
                mismatch(ctx, span, format!("pointer subtraction of {ta} and {tb}"));
            }
            return Type::sint();
        }
        _ => {}
    }
    let integral_only = matches!(
        op,
        Primop::Mod
            | Primop::Bitand
            | Primop::Bitor
            | Primop::Bitxor
            | Primop::Bitlshift
            | Primop::Bitrshift
    );
    if integral_only && !(is_integral(&ta) && is_integral(&tb)) {
        ctx.error(
            ErrorKind::Type,
            span,
            format!("{op} expects integral operands, found {ta} and {tb}"),
        );
        return Type::sint();
    }
    if matches!(op, Primop::Bitlshift | Primop::Bitrshift) {
        return ta;
    }
    match coerce_arithmetic(a, b) {
        Some(t) => t,
        None => {
            ctx.error(
                ErrorKind::Type,
                span,
                format!("{op} expects arithmetic operands, found {ta} and {tb}"),
            );
            Type::sint()
        }
    }
}

fn tc_assignop(
    ctx: &Ctx,
    te: &Tenv,
    span: Span,
    lhs: &ExpRef,
    op: Option<Primop>,
    rhs: &ExpRef,
) -> Ty {
    let t1 = tc_exp(ctx, te, None, lhs);
    let t2 = tc_exp(ctx, te, Some(&t1), rhs);
    check_lvalue(ctx, lhs, "assignment");
    match op {
        None => {
            if !coerce_assign(ctx, te, rhs, &t1) {
                mismatch(ctx, span, format!("type mismatch: {t1} != {t2}"));
            }
        }
        Some(Primop::Plus | Primop::Minus) if is_pointer_type(&t1) => {
            if !is_integral(&t2) {
                ctx.error(
                    ErrorKind::Type,
                    span,
                    format!("pointer arithmetic with a value of type {t2}"),
                );
            }
        }
        Some(op) => {
            if !is_arithmetic(&t1) || !is_arithmetic(&t2) {
                ctx.error(
                    ErrorKind::Type,
                    span,
                    format!("{op}= applied to {t1} and {t2}"),
                );
            } else if !coerce_use(ctx, te, rhs, &t1) {
                mismatch(ctx, span, format!("type mismatch: {t1} != {t2}"));
            }
        }
    }
    t1
}

/// Checks a condition and reports non-scalar tests.
pub(crate) fn tc_test(ctx: &Ctx, te: &Tenv, e: &ExpRef, what: &str) {
    let t = tc_exp(ctx, te, Some(&Type::sint()), e);
    if !coerce_to_bool(ctx, e) {
        ctx.error(
            ErrorKind::Type,
            e.span,
            format!("{what} has type {t} instead of a scalar type"),
        );
    }
}

fn tc_conditional(
    ctx: &Ctx,
    te: &Tenv,
    topt: Option<&Ty>,
    c: &ExpRef,
    a: &ExpRef,
    b: &ExpRef,
) -> Ty {
    tc_test(ctx, te, c, "conditional expression");
    let ta = tc_exp(ctx, te, topt, a);
    let tb = tc_exp(ctx, te, topt, b);
    if unify(ctx, &ta, &tb) {
        return ta;
    }
    if let Some(t) = coerce_arithmetic(a, b) {
        return t;
    }
    if coerce_use(ctx, te, b, &ta) {
        return ta;
    }
    if coerce_use(ctx, te, a, &tb) {
        return tb;
    }
    mismatch(
        ctx,
        c.span,
        format!("conditional branches have types {ta} and {tb}"),
    );
    ta
}

/// Substitutes fresh evars for a function type's parameters.
fn instantiate_fn(f: &FnInfo) -> FnInfo {
    let inst: Vec<_> = f
        .tvars
        .iter()
        .map(|tv| (tv.clone(), fresh_evar(tvar_kind(tv, Kind::Box))))
        .collect();
    FnInfo {
        tvars: Vec::new(),
        ..subst_fn_info(&inst, f)
    }
}

fn tc_fncall(ctx: &Ctx, te: &Tenv, span: Span, func: &ExpRef, args: &[ExpRef]) -> Ty {
    let tf = compress(&tc_exp(ctx, te, None, func));
    let info = match &*tf {
        Type::Fn(f) => instantiate_fn(f),
        Type::Pointer(p) => match &*compress(&p.elt) {
            Type::Fn(f) => {
                te.check_rgn_accessible(ctx, span, &p.atts.rgn);
                instantiate_fn(f)
            }
            _ => return not_a_function(ctx, te, span, &tf, args),
        },
        _ => return not_a_function(ctx, te, span, &tf, args),
    };

    let nformals = info.args.len();
    let variadic = info.c_varargs || info.cyc_varargs.is_some();
    if args.len() < nformals {
        ctx.error(
            ErrorKind::Type,
            span,
            format!("too few arguments for function {func}"),
        );
    } else if args.len() > nformals && !variadic {
        ctx.error(
            ErrorKind::Type,
            span,
            format!("too many arguments for function {func}"),
        );
    }

    let mut env = te.clone();
    for (i, a) in args.iter().enumerate() {
        let formal = info
            .args
            .get(i)
            .map(|f| f.ty.clone())
            .or_else(|| info.cyc_varargs.as_ref().map(|v| v.ty.clone()));
        let Some(ft) = formal else {
            tc_exp(ctx, &env, None, a);
            continue;
        };
        let ta = tc_exp(ctx, &env, Some(&ft), a);
        // A unique pointer passed where the callee is polymorphic in the
        // region is lent through a fresh alias region instead of consumed.
        if env.in_function() && is_unique_pointer(&ta) {
            if let Some(rgn) = pointer_region(&ft) {
                if matches!(&*compress(&rgn), Type::Evar(_)) {
                    if let Some(tv) = insert_alias(ctx, a, &rgn) {
                        env = env.add_region(&tv);
                    }
                }
            }
        }
        if !coerce_arg(ctx, &env, a, &ft) {
            let ta = a.ty().unwrap_or(ta);
            mismatch(
                ctx,
                a.span,
                format!("actual argument has type {ta} but formal has type {ft}"),
            );
        }
    }

    if let Some(eff) = info.effect.borrow().as_ref() {
        env.check_effect_accessible(ctx, span, eff);
    }
    env.check_rgn_partial_order(ctx, span, &info.rgn_po);
    info.ret
}

fn not_a_function(ctx: &Ctx, te: &Tenv, span: Span, t: &Ty, args: &[ExpRef]) -> Ty {
    ctx.error(
        ErrorKind::Type,
        span,
        format!("expected a function but found a value of type {t}"),
    );
    for a in args {
        tc_exp(ctx, te, None, a);
    }
    fresh_evar(Kind::Any)
}

fn tc_instantiate(ctx: &Ctx, te: &Tenv, span: Span, inner: &ExpRef, targs: &[Ty]) -> Ty {
    let t = compress(&tc_exp(ctx, te, None, inner));
    let Type::Fn(f) = &*t else {
        ctx.error(
            ErrorKind::Type,
            span,
            format!("cannot instantiate an expression of type {t}"),
        );
        return t;
    };
    if f.tvars.len() != targs.len() {
        ctx.error(
            ErrorKind::Type,
            span,
            format!(
                "instantiation with {} type(s) but {} expected",
                targs.len(),
                f.tvars.len()
            ),
        );
        return t.clone();
    }
    let inst: Vec<_> = f.tvars.iter().cloned().zip(targs.iter().cloned()).collect();
    for (tv, ta) in &inst {
        check_type(ctx, te, span, &[], tvar_kind(tv, Kind::Box), true, ta);
    }
    Rc::new(Type::Fn(FnInfo {
        tvars: Vec::new(),
        ..subst_fn_info(&inst, f)
    }))
}

/// Region of the storage an lvalue denotes.
fn lvalue_region(e: &ExpRef) -> Option<Ty> {
    match &*e.kind.borrow() {
        ExpKind::Var(_, Binding::Global(_) | Binding::Fun(_)) => Some(Type::heap_rgn()),
        ExpKind::Var(_, b) => b.vardecl().and_then(|vd| vd.rgn.borrow().clone()),
        ExpKind::Deref(p) | ExpKind::AggrArrow(p, _) => {
            pointer_region(&p.ty()?)
        }
        ExpKind::Subscript(base, _) => {
            let t = base.ty()?;
            if is_pointer_type(&t) {
                pointer_region(&t)
            } else {
                lvalue_region(base)
            }
        }
        ExpKind::AggrMember(inner, _)
        | ExpKind::NoInstantiate(inner)
        | ExpKind::Instantiate(inner, _) => lvalue_region(inner),
        _ => None,
    }
}

/// Marks the local whose storage `&e` points into.
fn mark_escaped(e: &ExpRef) {
    match &*e.kind.borrow() {
        ExpKind::Var(_, b) if b.is_local() => {
            if let Some(vd) = b.vardecl() {
                vd.escapes.set(true);
            }
        }
        ExpKind::AggrMember(inner, _) => mark_escaped(inner),
        ExpKind::Subscript(base, _) if base.ty().is_some_and(|t| !is_pointer_type(&t)) => {
            mark_escaped(base)
        }
        _ => {}
    }
}

fn is_lvalue(e: &ExpRef) -> bool {
    match &*e.kind.borrow() {
        ExpKind::Var(_, b) => !matches!(b, Binding::Fun(_) | Binding::Unresolved),
        ExpKind::Deref(_) | ExpKind::AggrArrow(..) | ExpKind::Subscript(..) => true,
        ExpKind::AggrMember(inner, _)
        | ExpKind::NoInstantiate(inner)
        | ExpKind::Instantiate(inner, _) => is_lvalue(inner),
        _ => false,
    }
}

fn check_lvalue(ctx: &Ctx, e: &ExpRef, what: &str) {
    if !is_lvalue(e) {
        ctx.error(ErrorKind::Type, e.span, format!("{what} of a non-lvalue"));
        return;
    }
    if let Some(Binding::Global(vd) | Binding::Local(vd) | Binding::Param(vd)) = e.var_binding() {
        if vd.tq.is_const {
            ctx.error(
                ErrorKind::Type,
                e.span,
                format!("{what} of const variable {}", vd.name),
            );
        }
    }
}

/// Region named by a handle expression; the region must be live.
fn tc_rgn_handle(ctx: &Ctx, te: &Tenv, h: &ExpRef) -> Ty {
    let th = tc_exp(ctx, te, None, h);
    let r = fresh_evar(Kind::Rgn);
    if !unify(ctx, &th, &Type::rgn_handle(r.clone())) {
        mismatch(
            ctx,
            h.span,
            format!("expecting a region handle but found {th}"),
        );
        return Type::heap_rgn();
    }
    te.check_rgn_accessible(ctx, h.span, &r);
    compress(&r)
}

fn sizeof_type(e: &ExpRef) -> Option<Ty> {
    match &*e.kind.borrow() {
        ExpKind::Sizeoftyp(t) => Some(t.clone()),
        ExpKind::Primop(Primop::Times, args) => args.iter().find_map(sizeof_type),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn tc_malloc(
    ctx: &Ctx,
    te: &Tenv,
    topt: Option<&Ty>,
    e: &ExpRef,
    rgn: Option<&ExpRef>,
    elt: Option<Ty>,
    num: &ExpRef,
    fat: bool,
) -> Ty {
    let rgn = match rgn {
        Some(h) => tc_rgn_handle(ctx, te, h),
        None => Type::heap_rgn(),
    };
    tc_exp(ctx, te, Some(&Type::uint()), num);
    if !coerce_uint_type(ctx, num) {
        ctx.error(
            ErrorKind::Type,
            num.span,
            format!("allocation size has type {}", arg_ty(num)),
        );
    }
    let elt = elt
        .or_else(|| sizeof_type(num))
        .or_else(|| topt.and_then(pointer_elt_type));
    let Some(elt) = elt else {
        ctx.error(
            ErrorKind::Type,
            e.span,
            "cannot determine the element type of the allocation",
        );
        return Type::at(fresh_evar(Kind::Mem), rgn);
    };
    check_type(ctx, te, e.span, &[], Kind::Mem, true, &elt);
    if let ExpKind::Malloc(info) = &*e.kind.borrow() {
        *info.elt_type.borrow_mut() = Some(elt.clone());
    }
    let single =
        matches!(&*num.kind.borrow(), ExpKind::Sizeoftyp(_)) || eval_const_uint(num) == Some(1);
    if single && !fat {
        Type::at(elt, rgn)
    } else {
        Type::fat(elt, rgn)
    }
}

fn member_type(ctx: &Ctx, span: Span, t: &Ty, field: &str) -> Ty {
    match aggr_field(t, field) {
        Some((_, ft)) => ft,
        None => {
            ctx.error(
                ErrorKind::Type,
                span,
                format!("{t} has no {field} member"),
            );
            fresh_evar(Kind::Any)
        }
    }
}

fn tc_subscript(ctx: &Ctx, te: &Tenv, span: Span, base: &ExpRef, idx: &ExpRef) -> Ty {
    let t = compress(&tc_exp(ctx, te, None, base));
    let ti = tc_exp(ctx, te, None, idx);
    if let Type::Tuple(ts) = &*t {
        return match eval_const_uint(idx) {
            Some(i) => match usize::try_from(i).ok().and_then(|i| ts.get(i)) {
                Some((_, ft)) => ft.clone(),
                None => {
                    ctx.error(
                        ErrorKind::Type,
                        span,
                        format!("index {i} out of bounds for tuple of {} element(s)", ts.len()),
                    );
                    fresh_evar(Kind::Any)
                }
            },
            None => {
                ctx.error(ErrorKind::Type, span, "tuple projection must use a constant index");
                fresh_evar(Kind::Any)
            }
        };
    }
    if !coerce_uint_type(ctx, idx) {
        ctx.error(
            ErrorKind::Type,
            idx.span,
            format!("subscript has type {ti} instead of an integral type"),
        );
    }
    match &*t {
        Type::Pointer(p) => {
            te.check_rgn_accessible(ctx, span, &p.atts.rgn);
            p.elt.clone()
        }
        Type::Array(a) => a.elt.clone(),
        _ => {
            ctx.error(
                ErrorKind::Type,
                span,
                format!("subscript applied to a value of type {t}"),
            );
            fresh_evar(Kind::Any)
        }
    }
}

fn tc_field_exps(ctx: &Ctx, te: &Tenv, fields: &[FieldInit]) {
    for fi in fields {
        tc_exp(ctx, te, None, &fi.exp);
    }
}

fn tc_aggregate(
    ctx: &Ctx,
    te: &Tenv,
    e: &ExpRef,
    ad: &Rc<AggrDecl>,
    fields: &[FieldInit],
) -> Ty {
    let Some(imp) = &ad.imp else {
        ctx.error(
            ErrorKind::Type,
            e.span,
            format!("cannot construct abstract {} {}", ad.kind, ad.name),
        );
        tc_field_exps(ctx, te, fields);
        return Type::aggr_known(ad, Vec::new());
    };
    let targs: Vec<Ty> = ad
        .tvars
        .iter()
        .map(|tv| fresh_evar(tvar_kind(tv, Kind::Box)))
        .collect();
    let mut inst = aggr_inst(&Some(ad.clone()), &targs);
    inst.extend(
        imp.exist_vars
            .iter()
            .map(|tv| (tv.clone(), fresh_evar(tvar_kind(tv, Kind::Box)))),
    );
    if ad.kind == AggrKind::Union && fields.len() != 1 {
        ctx.error(
            ErrorKind::Type,
            e.span,
            format!("union {} expression must initialize exactly one member", ad.name),
        );
    }
    for (pos, fi) in fields.iter().enumerate() {
        let field = match &fi.field {
            Some(name) => ad.field(name).map(|(_, f)| f),
            None => imp.fields.get(pos),
        };
        let Some(af) = field else {
            let msg = match &fi.field {
                Some(name) => format!("{} {} has no member {name}", ad.kind, ad.name),
                None => format!("too many members in {} {} expression", ad.kind, ad.name),
            };
            ctx.error(ErrorKind::Type, fi.exp.span, msg);
            tc_exp(ctx, te, None, &fi.exp);
            continue;
        };
        let ft = substitute(&inst, &af.ty);
        let t = tc_exp(ctx, te, Some(&ft), &fi.exp);
        if !coerce_assign(ctx, te, &fi.exp, &ft) {
            mismatch(
                ctx,
                fi.exp.span,
                format!("member {} of {} expects type {ft} but was given {t}", af.name, ad.name),
            );
        }
    }
    if let ExpKind::Aggregate {
        targs: slot, decl, ..
    } = &mut *e.kind.borrow_mut()
    {
        *slot = targs.clone();
        *decl = Some(ad.clone());
    }
    Type::aggr_known(ad, targs)
}

fn tc_anon_struct(ctx: &Ctx, te: &Tenv, span: Span, t: &Ty, fields: &[FieldInit]) -> Ty {
    let Type::AnonAggr(kind, decl_fields) = &*compress(t) else {
        ctx.error(
            ErrorKind::Type,
            span,
            format!("anonymous initializer for non-aggregate type {t}"),
        );
        tc_field_exps(ctx, te, fields);
        return t.clone();
    };
    if *kind == AggrKind::Union && fields.len() != 1 {
        ctx.error(
            ErrorKind::Type,
            span,
            "union expression must initialize exactly one member",
        );
    }
    for (pos, fi) in fields.iter().enumerate() {
        let field = match &fi.field {
            Some(name) => decl_fields.iter().find(|f| &f.name == name),
            None => decl_fields.get(pos),
        };
        let Some(af) = field else {
            ctx.error(
                ErrorKind::Type,
                fi.exp.span,
                format!("{t} has no such member"),
            );
            tc_exp(ctx, te, None, &fi.exp);
            continue;
        };
        let ft = tc_exp(ctx, te, Some(&af.ty), &fi.exp);
        if !coerce_assign(ctx, te, &fi.exp, &af.ty) {
            mismatch(
                ctx,
                fi.exp.span,
                format!("member {} expects type {} but was given {ft}", af.name, af.ty),
            );
        }
    }
    t.clone()
}

fn tc_datatype(
    ctx: &Ctx,
    te: &Tenv,
    span: Span,
    args: &[ExpRef],
    dd: &Rc<DatatypeDecl>,
    df: &Rc<DatatypeField>,
) -> Ty {
    let targs: Vec<Ty> = dd
        .tvars
        .iter()
        .map(|tv| fresh_evar(tvar_kind(tv, Kind::Box)))
        .collect();
    let inst: Vec<_> = dd.tvars.iter().cloned().zip(targs.iter().cloned()).collect();
    if args.len() != df.typs.len() {
        ctx.error(
            ErrorKind::Type,
            span,
            format!(
                "constructor {} expects {} argument(s) but was given {}",
                df.name,
                df.typs.len(),
                args.len()
            ),
        );
    }
    for (a, (_, t)) in args.iter().zip(&df.typs) {
        let ft = substitute(&inst, t);
        let ta = tc_exp(ctx, te, Some(&ft), a);
        if !coerce_arg(ctx, te, a, &ft) {
            mismatch(
                ctx,
                a.span,
                format!("constructor {} expects {ft} but was given {ta}", df.name),
            );
        }
    }
    for a in args.iter().skip(df.typs.len()) {
        tc_exp(ctx, te, None, a);
    }
    Type::datatype_known(dd, targs)
}

fn tc_unresolved_mem(
    ctx: &Ctx,
    te: &Tenv,
    topt: Option<&Ty>,
    e: &ExpRef,
    name: Option<QualName>,
    fields: Vec<FieldInit>,
) -> Ty {
    if let Some(q) = name {
        return match te.lookup_aggrdecl(&q) {
            Some(ad) => {
                e.replace_kind(ExpKind::Aggregate {
                    name: q,
                    targs: Vec::new(),
                    fields: fields.clone(),
                    decl: Some(ad.clone()),
                });
                tc_aggregate(ctx, te, e, &ad, &fields)
            }
            None => {
                ctx.error(ErrorKind::Name, e.span, format!("undeclared struct {q}"));
                tc_field_exps(ctx, te, &fields);
                fresh_evar(Kind::Any)
            }
        };
    }
    let hint = topt.map(compress);
    match hint.as_deref() {
        Some(Type::Aggr(info)) if info.decl().is_some() => {
            let ad = info
                .decl()
                .unwrap_or_else(|| impos("aggregate declaration vanished"));
            e.replace_kind(ExpKind::Aggregate {
                name: ad.name.clone(),
                targs: Vec::new(),
                fields: fields.clone(),
                decl: Some(ad.clone()),
            });
            tc_aggregate(ctx, te, e, &ad, &fields)
        }
        Some(Type::AnonAggr(..)) => {
            let t = hint.clone().unwrap_or_else(|| impos("hint vanished"));
            e.replace_kind(ExpKind::AnonStruct(t.clone(), fields.clone()));
            tc_anon_struct(ctx, te, e.span, &t, &fields)
        }
        Some(Type::Array(_)) => {
            let es: Vec<ExpRef> = fields.into_iter().map(|f| f.exp).collect();
            e.replace_kind(ExpKind::Array(es.clone()));
            tc_array(ctx, te, topt, e.span, &es)
        }
        _ => {
            ctx.error(
                ErrorKind::Type,
                e.span,
                "cannot determine the type of this initializer",
            );
            tc_field_exps(ctx, te, &fields);
            fresh_evar(Kind::Any)
        }
    }
}

fn tc_array(ctx: &Ctx, te: &Tenv, topt: Option<&Ty>, span: Span, es: &[ExpRef]) -> Ty {
    let (elt, tq, zero_term) = match topt.map(compress).as_deref() {
        Some(Type::Array(a)) => (a.elt.clone(), a.tq, a.zero_term.clone()),
        _ => (fresh_evar(Kind::Mem), Tqual::default(), Conref::eq(false)),
    };
    for x in es {
        let t = tc_exp(ctx, te, Some(&elt), x);
        if !coerce_assign(ctx, te, x, &elt) {
            mismatch(
                ctx,
                x.span,
                format!("array element has type {t} but {elt} was expected"),
            );
        }
    }
    let count = Exp::typed(
        ExpKind::Const(Cnst::Int(Sign::Unsigned, es.len() as i64)),
        span,
        Type::uint(),
    );
    Rc::new(Type::Array(ArrayInfo {
        elt,
        tq,
        num_elts: Some(count),
        zero_term,
    }))
}

/// Type of the expression a statement expression ends with.
fn last_exp_type(s: &StmtRef) -> Option<Ty> {
    match &s.kind {
        StmtKind::Exp(e) => e.ty(),
        StmtKind::Seq(_, rest) | StmtKind::Decl(_, rest) | StmtKind::Label(_, rest) => {
            last_exp_type(rest)
        }
        _ => None,
    }
}
