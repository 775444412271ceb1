//! The forward interpreter over one function body.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use strata_ast::{
    Annot, Binding, Cnst, Coercion, DeclKind, ExpKind, ExpRef, FnAttr, FnDecl, LoopCond,
    PatKind, Primop, Span, StmtKind, StmtRef, SwitchClause, Ty, Type, VarRef,
};

use super::{
    AbsRVal, FlowInfo, InitLevel, PathCon, Place, Root, UnionRInfo, assign_place, escape_deref,
    flow_lessthan_approx, get_field_index, initlevel, is_unique_consumed, join_flow,
    join_flow_and_rval, join_tryflow, lookup_place, make_unique_consumed, make_unique_unconsumed,
    place_err_string, project, typ_to_absrval, unname_rval,
};
use crate::ctx::Ctx;
use crate::error::{ErrorKind, impos};
use crate::rgnorder::RgnPO;
use crate::tcutil::{
    compress, eval_const_uint, handle_region, is_array_type, is_nullable_pointer,
    is_noreturn_fn, is_pointer_type, is_unique_pointer, is_zero, pointer_elt_type,
    pointer_region, typecmp,
};

/// Statements keyed by identity.
#[derive(Clone, Debug)]
struct StmtKey(StmtRef);

impl PartialEq for StmtKey {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for StmtKey {}

impl Hash for StmtKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state);
    }
}

const ALL: AbsRVal = AbsRVal::UnknownR(InitLevel::AllIL);
const NONE: AbsRVal = AbsRVal::UnknownR(InitLevel::NoneIL);

struct Analyzer<'a> {
    ctx: &'a Ctx,
    fd: &'a FnDecl,
    po: RgnPO,
    /// Loop pass counter, stamped on consumptions.
    iteration: u32,
    /// Flows arriving at a statement by a jump. For loops and switches
    /// this is the flow leaving them by `break`.
    jumps: HashMap<StmtKey, FlowInfo>,
    label_entries: HashMap<StmtKey, FlowInfo>,
    needs_repass: bool,
    try_flows: Vec<FlowInfo>,
}

/// Checks initialization and unique-pointer consumption in the body of
/// `fd`. `po` is the region order at function entry.
pub fn analyze_fn(ctx: &Ctx, fd: &FnDecl, po: &RgnPO) {
    tracing::debug!(function = %fd.name, "flow analysis");
    let mut a = Analyzer {
        ctx,
        fd,
        po: po.clone(),
        iteration: 0,
        jumps: HashMap::new(),
        label_entries: HashMap::new(),
        needs_repass: false,
        try_flows: Vec::new(),
    };
    let entry = a.seed_params();
    for pass in 0..2 {
        a.needs_repass = false;
        a.label_entries.clear();
        let out = a.stmt(entry.clone(), &fd.body);
        if !a.needs_repass || pass == 1 {
            a.finish(&out);
            break;
        }
        tracing::trace!(function = %fd.name, "backward jump changed a label's flow; re-analyzing");
        a.iteration += 1;
    }
    tracing::debug!(function = %fd.name, errors = ctx.error_count(), "flow analysis done");
}

fn ty_of(e: &ExpRef) -> Ty {
    e.ty()
        .unwrap_or_else(|| impos(format!("expression {e} reached flow analysis untyped")))
}

/// Attributes of a function or function-pointer type.
fn fn_attributes(t: &Ty) -> Vec<FnAttr> {
    match &*compress(t) {
        Type::Fn(info) => info.attributes.clone(),
        Type::Pointer(p) => fn_attributes(&p.elt),
        _ => Vec::new(),
    }
}

/// Value of an object of type `t` nothing is known about except its
/// initialization.
fn fresh_rval(t: &Ty, il: InitLevel) -> AbsRVal {
    if is_unique_pointer(t) {
        return AbsRVal::UniquePtr(Rc::new(AbsRVal::UnknownR(il)));
    }
    if il == InitLevel::AllIL && is_pointer_type(t) && !is_nullable_pointer(t) {
        return AbsRVal::NotZeroAll;
    }
    typ_to_absrval(t, &AbsRVal::UnknownR(il))
}

/// Value of a fresh local. Array elements are not tracked.
fn decl_rval(t: &Ty) -> AbsRVal {
    if is_array_type(t) {
        ALL
    } else {
        typ_to_absrval(t, &NONE)
    }
}

fn remove_root(mut f: FlowInfo, vd: &VarRef) -> FlowInfo {
    if vd.escapes.get() {
        return f;
    }
    if let FlowInfo::Reachable(d) = &mut f {
        d.remove(&Root::VarRoot(vd.clone()));
    }
    f
}

/// Keeps only the roots `domain` tracks.
fn restrict_to(f: FlowInfo, domain: &FlowInfo) -> FlowInfo {
    match (f, domain) {
        (FlowInfo::Reachable(mut d), FlowInfo::Reachable(keep)) => {
            d.retain(|root, _| keep.contains_key(root));
            FlowInfo::Reachable(d)
        }
        (f, _) => f,
    }
}

impl Analyzer<'_> {
    fn seed_params(&self) -> FlowInfo {
        let mut f = FlowInfo::empty();
        let params = self.fd.param_vardecls.borrow().clone().unwrap_or_default();
        for (i, vd) in params.iter().enumerate() {
            let t = vd.ty();
            let v = if self.fd.has_attr(FnAttr::Initializes(i)) {
                let elt = pointer_elt_type(&t).unwrap_or_else(Type::void);
                let root = Root::InitParam(i, elt.clone());
                f.insert(root.clone(), typ_to_absrval(&elt, &NONE));
                AbsRVal::AddressOf(Rc::new(Place::root(root)))
            } else if self.fd.has_attr(FnAttr::Noconsume(i)) {
                AbsRVal::NamedLocation(vd.clone(), Rc::new(fresh_rval(&t, InitLevel::AllIL)))
            } else {
                fresh_rval(&t, InitLevel::AllIL)
            };
            f.insert(Root::VarRoot(vd.clone()), v);
        }
        f
    }

    fn finish(&mut self, out: &FlowInfo) {
        if out.is_bottom() {
            return;
        }
        if !matches!(&*compress(&self.fd.ret), Type::Void) {
            self.ctx.error(
                ErrorKind::Flow,
                self.fd.span,
                format!("function {} may not return a value", self.fd.name),
            );
        }
        self.check_return(out, self.fd.span);
    }

    fn check_return(&self, f: &FlowInfo, span: Span) {
        let Some(d) = f.dict() else { return };
        for (root, v) in d {
            let Root::InitParam(i, _) = root else { continue };
            if initlevel(d, v) == InitLevel::NoneIL {
                self.ctx.error(
                    ErrorKind::Flow,
                    span,
                    format!(
                        "initializes attribute violated: parameter {} may not be initialized",
                        i + 1
                    ),
                );
            }
        }
    }

    fn note_try(&mut self, f: &FlowInfo) {
        if let Some(top) = self.try_flows.last_mut() {
            *top = join_flow(top, f);
        }
    }

    fn jump(&mut self, f: FlowInfo, target: &StmtRef) {
        let key = StmtKey(target.clone());
        let joined = match self.jumps.get(&key) {
            Some(old) => join_flow(old, &f),
            None => f,
        };
        self.jumps.insert(key, joined);
    }

    fn take_jumps(&mut self, s: &StmtRef) -> FlowInfo {
        self.jumps
            .remove(&StmtKey(s.clone()))
            .unwrap_or(FlowInfo::Bottom)
    }

    // -------------------------------------------------------------------
    // reads

    fn place_name(p: &Place) -> String {
        place_err_string(p).unwrap_or_else(|| "value".to_string())
    }

    /// A read that needs the value fully initialized and not moved out.
    fn use_rval(&self, f: &FlowInfo, e: &ExpRef, r: &AbsRVal) {
        let Some(d) = f.dict() else { return };
        if is_unique_consumed(r) {
            let what = place_of(e).map(|p| Self::place_name(&p));
            self.ctx.error(
                ErrorKind::Unique,
                e.span,
                format!(
                    "use of consumed unique pointer {}",
                    what.unwrap_or_else(|| e.to_string())
                ),
            );
        } else if initlevel(d, r) == InitLevel::NoneIL {
            self.ctx.error(
                ErrorKind::Flow,
                e.span,
                "expression may not be fully initialized",
            );
        }
    }

    /// Moves the value of `e` if it is a unique pointer stored in a place
    /// the analysis tracks.
    fn consume(&mut self, f: FlowInfo, e: &ExpRef, r: AbsRVal, local_alias: bool) -> FlowInfo {
        if f.is_bottom() || !is_unique_pointer(&ty_of(e)) {
            return f;
        }
        let Some(place) = place_of(e) else { return f };
        let Some(current) = f.dict().and_then(|d| lookup_place(d, &place)) else {
            return f;
        };
        match &current {
            AbsRVal::Consumed { iteration, .. } => {
                let msg = if *iteration < self.iteration {
                    format!(
                        "unique pointer {} may have been consumed in a previous loop iteration",
                        Self::place_name(&place)
                    )
                } else {
                    format!(
                        "unique pointer {} may have already been consumed",
                        Self::place_name(&place)
                    )
                };
                self.ctx.error(ErrorKind::Unique, e.span, msg);
                f
            }
            AbsRVal::NamedLocation(..) => {
                self.ctx.error(
                    ErrorKind::Unique,
                    e.span,
                    format!(
                        "noconsume parameter {} may not be consumed",
                        Self::place_name(&place)
                    ),
                );
                f
            }
            // The pointer itself was never written; its target is not inspected.
            _ if matches!(
                unname_rval(&r),
                AbsRVal::UnknownR(InitLevel::NoneIL) | AbsRVal::Esc(InitLevel::NoneIL)
            ) =>
            {
                self.ctx.error(
                    ErrorKind::Flow,
                    e.span,
                    "expression may not be fully initialized",
                );
                f
            }
            _ => {
                let consumed = make_unique_consumed(e.span, self.iteration, r, local_alias);
                assign_place(self.ctx, e.span, f, &place, consumed)
            }
        }
    }

    /// Checks a dereference of `ptr` (whose value is `r`) performed by
    /// `at`, annotates `at`, and returns the value pointed to.
    fn deref(&self, f: &FlowInfo, ptr: &ExpRef, r: &AbsRVal, at: &ExpRef) -> AbsRVal {
        let t = ty_of(ptr);
        let elt = pointer_elt_type(&t).unwrap_or_else(Type::void);
        let Some(d) = f.dict() else { return ALL };
        let nullable = is_nullable_pointer(&t);
        let (annot, v) = match unname_rval(r) {
            AbsRVal::Consumed { .. } => {
                let what = place_of(ptr).map(|p| Self::place_name(&p));
                self.ctx.error(
                    ErrorKind::Unique,
                    at.span,
                    format!(
                        "dereference of consumed unique pointer {}",
                        what.unwrap_or_else(|| ptr.to_string())
                    ),
                );
                (Annot::UnknownZ, typ_to_absrval(&elt, &ALL))
            }
            AbsRVal::Zero => {
                self.ctx
                    .error(ErrorKind::Flow, at.span, "dereference of NULL pointer");
                (Annot::IsZero, typ_to_absrval(&elt, &ALL))
            }
            AbsRVal::AddressOf(p) => (
                Annot::NotZero,
                lookup_place(d, &p).unwrap_or_else(|| typ_to_absrval(&elt, &ALL)),
            ),
            AbsRVal::UniquePtr(v) => (Annot::NotZero, (*v).clone()),
            AbsRVal::NotZeroAll => (Annot::NotZero, typ_to_absrval(&elt, &ALL)),
            AbsRVal::UnknownR(InitLevel::AllIL) | AbsRVal::Esc(InitLevel::AllIL) => {
                let annot = if nullable {
                    Annot::UnknownZ
                } else {
                    Annot::NotZero
                };
                let leaf = match unname_rval(r) {
                    AbsRVal::Esc(_) => AbsRVal::Esc(InitLevel::AllIL),
                    _ => ALL,
                };
                (annot, typ_to_absrval(&elt, &leaf))
            }
            AbsRVal::UnknownR(InitLevel::NoneIL) | AbsRVal::Esc(InitLevel::NoneIL) => {
                self.ctx.error(
                    ErrorKind::Flow,
                    at.span,
                    "dereference of possibly uninitialized pointer",
                );
                (Annot::UnknownZ, typ_to_absrval(&elt, &ALL))
            }
            AbsRVal::Aggregate(..) | AbsRVal::NamedLocation(..) => {
                (Annot::UnknownZ, typ_to_absrval(&elt, &ALL))
            }
        };
        at.set_annot(annot);
        v
    }

    // -------------------------------------------------------------------
    // expressions

    /// Evaluates `e` as a location. `None` when the location is storage
    /// the analysis does not track.
    fn lexp(&mut self, f: FlowInfo, e: &ExpRef) -> (FlowInfo, Option<Place>) {
        if f.is_bottom() {
            return (f, None);
        }
        let kind = e.kind.borrow();
        match &*kind {
            ExpKind::Var(_, b) if b.is_local() => match b.vardecl() {
                Some(vd) => (f, Some(Place::root(Root::VarRoot(vd.clone())))),
                None => (f, None),
            },
            ExpKind::NoInstantiate(inner) | ExpKind::Instantiate(inner, _) => {
                let inner = inner.clone();
                drop(kind);
                self.lexp(f, &inner)
            }
            ExpKind::AggrMember(inner, field) => {
                let (inner, field) = (inner.clone(), field.clone());
                drop(kind);
                let (f, p) = self.lexp(f, &inner);
                let idx = get_field_index(&ty_of(&inner), &field);
                (f, p.zip(idx).map(|(p, i)| p.extend(PathCon::Dot(i))))
            }
            ExpKind::Subscript(inner, idx)
                if matches!(&*compress(&ty_of(inner)), Type::Tuple(_)) =>
            {
                let (inner, idx) = (inner.clone(), idx.clone());
                drop(kind);
                let (f, p) = self.lexp(f, &inner);
                let i = eval_const_uint(&idx).and_then(|i| usize::try_from(i).ok());
                (f, p.zip(i).map(|(p, i)| p.extend(PathCon::Dot(i))))
            }
            ExpKind::Deref(ptr) | ExpKind::AggrArrow(ptr, _) | ExpKind::Subscript(ptr, _) => {
                let ptr = ptr.clone();
                let field = match &*kind {
                    ExpKind::AggrArrow(_, field) => Some(field.clone()),
                    _ => None,
                };
                let index = match &*kind {
                    ExpKind::Subscript(_, i) => Some(i.clone()),
                    _ => None,
                };
                drop(kind);
                let (mut f, r) = self.rexp(f, &ptr);
                if let Some(i) = &index {
                    let (f2, ri) = self.rexp(f, i);
                    self.use_rval(&f2, i, &ri);
                    f = f2;
                }
                let pt = ty_of(&ptr);
                if is_array_type(&pt) {
                    return (f, None);
                }
                self.deref(&f, &ptr, &r, e);
                // Only `p[0]` names the object `p` points to.
                if index.is_some_and(|i| eval_const_uint(&i) != Some(0)) {
                    return (f, None);
                }
                let target = match unname_rval(&r) {
                    AbsRVal::AddressOf(p) => Some((*p).clone()),
                    AbsRVal::UniquePtr(_) => place_of(&ptr).map(|p| p.extend(PathCon::Star)),
                    _ => None,
                };
                let target = match field {
                    Some(field) => {
                        let elt = pointer_elt_type(&pt).unwrap_or_else(Type::void);
                        let idx = get_field_index(&elt, &field);
                        target.zip(idx).map(|(p, i)| p.extend(PathCon::Dot(i)))
                    }
                    None => target,
                };
                (f, target)
            }
            _ => {
                drop(kind);
                let (f, _) = self.rexp(f, e);
                (f, None)
            }
        }
    }

    /// Evaluates `e` for its value.
    fn rexp(&mut self, f: FlowInfo, e: &ExpRef) -> (FlowInfo, AbsRVal) {
        if f.is_bottom() {
            return (f, ALL);
        }
        let kind = e.kind.borrow();
        match &*kind {
            ExpKind::Const(c) => {
                let v = match c {
                    Cnst::Null
                    | Cnst::Int(_, 0)
                    | Cnst::LongLong(_, 0)
                    | Cnst::Char(0) => AbsRVal::Zero,
                    Cnst::Float(_) => ALL,
                    _ => AbsRVal::NotZeroAll,
                };
                (f, v)
            }
            ExpKind::Var(_, b) => {
                let v = match b {
                    Binding::Fun(_) => AbsRVal::NotZeroAll,
                    Binding::Global(vd) => {
                        typ_to_absrval(&vd.ty(), &AbsRVal::Esc(InitLevel::AllIL))
                    }
                    Binding::Param(vd) | Binding::Local(vd) | Binding::Pat(vd) => f
                        .dict()
                        .and_then(|d| d.get(&Root::VarRoot(vd.clone())))
                        .map(unname_rval)
                        .unwrap_or_else(|| fresh_rval(&vd.ty(), InitLevel::AllIL)),
                    Binding::Unresolved => {
                        impos(format!("unresolved variable {e} reached flow analysis"))
                    }
                };
                (f, v)
            }
            ExpKind::UnknownId(_) | ExpKind::UnknownCall(..) | ExpKind::UnresolvedMem(..) => {
                impos(format!("unresolved expression {e} reached flow analysis"))
            }
            ExpKind::Primop(_, args) => {
                let args = args.clone();
                drop(kind);
                let mut f = f;
                for a in &args {
                    let (f2, r) = self.rexp(f, a);
                    self.use_rval(&f2, a, &r);
                    f = f2;
                }
                (f, ALL)
            }
            ExpKind::AssignOp(lhs, None, rhs) => {
                let (lhs, rhs) = (lhs.clone(), rhs.clone());
                drop(kind);
                let (f, r) = self.rexp(f, &rhs);
                let f = self.consume(f, &rhs, r.clone(), false);
                let (f, place) = self.lexp(f, &lhs);
                let f = match place {
                    Some(p) => assign_place(self.ctx, e.span, f, &p, r.clone()),
                    None => escape_deref(self.ctx, e.span, f, &r),
                };
                (f, r)
            }
            ExpKind::AssignOp(lhs, Some(_), rhs) => {
                let (lhs, rhs) = (lhs.clone(), rhs.clone());
                drop(kind);
                self.update_in_place(f, e, &lhs, Some(&rhs))
            }
            ExpKind::Increment(lhs, _) => {
                let lhs = lhs.clone();
                drop(kind);
                self.update_in_place(f, e, &lhs, None)
            }
            ExpKind::Conditional(c, a, b) => {
                let (c, a, b) = (c.clone(), a.clone(), b.clone());
                drop(kind);
                let (ft, ff) = self.test(f, &c);
                let ra = self.rexp(ft, &a);
                let rb = self.rexp(ff, &b);
                join_flow_and_rval(ra, rb)
            }
            ExpKind::And(a, b) | ExpKind::Or(a, b) => {
                let (a, b) = (a.clone(), b.clone());
                let is_and = matches!(&*kind, ExpKind::And(..));
                drop(kind);
                let (ft, ff) = self.test(f, &a);
                let (go, skip) = if is_and { (ft, ff) } else { (ff, ft) };
                let (f2, r) = self.rexp(go, &b);
                self.use_rval(&f2, &b, &r);
                (join_flow(&f2, &skip), ALL)
            }
            ExpKind::SeqExp(a, b) => {
                let (a, b) = (a.clone(), b.clone());
                drop(kind);
                let (f, _) = self.rexp(f, &a);
                self.rexp(f, &b)
            }
            ExpKind::FnCall(func, args) => {
                let (func, args) = (func.clone(), args.clone());
                drop(kind);
                self.call(f, e, &func, &args)
            }
            ExpKind::Throw(inner) => {
                let inner = inner.clone();
                drop(kind);
                let (f, r) = self.rexp(f, &inner);
                let f = if is_unique_pointer(&ty_of(&inner)) {
                    self.consume(f, &inner, r, false)
                } else {
                    escape_deref(self.ctx, inner.span, f, &r)
                };
                self.note_try(&f);
                (FlowInfo::Bottom, ALL)
            }
            ExpKind::NoInstantiate(inner) | ExpKind::Instantiate(inner, _) => {
                let inner = inner.clone();
                drop(kind);
                self.rexp(f, &inner)
            }
            ExpKind::Cast(_, inner, _, coercion) => {
                let (inner, coercion) = (inner.clone(), *coercion);
                drop(kind);
                let (f, r) = self.rexp(f, &inner);
                if coercion == Coercion::NullCheck {
                    let annot = match unname_rval(&r) {
                        AbsRVal::Zero => Annot::IsZero,
                        v if super::is_init_pointer(&v) => Annot::NotZero,
                        _ => Annot::UnknownZ,
                    };
                    e.set_annot(annot);
                }
                (f, r)
            }
            ExpKind::Address(inner) => {
                let inner = inner.clone();
                drop(kind);
                let (f, place) = self.lexp(f, &inner);
                let v = match place {
                    Some(p) => AbsRVal::AddressOf(Rc::new(p)),
                    None => AbsRVal::NotZeroAll,
                };
                (f, v)
            }
            ExpKind::New(rgn, init) => {
                let (rgn, init) = (rgn.clone(), init.clone());
                drop(kind);
                let mut f = f;
                if let Some(rgn) = &rgn {
                    let (f2, r) = self.rexp(f, rgn);
                    self.use_rval(&f2, rgn, &r);
                    f = f2;
                }
                let (f, r) = self.rexp(f, &init);
                let f = self.consume(f, &init, r.clone(), false);
                self.allocate(f, e, &ty_of(&init), r)
            }
            ExpKind::Malloc(info) => {
                let rgn = info.rgn.clone();
                let num = info.num_elts.clone();
                let is_calloc = info.is_calloc;
                let elt = info.elt_type.borrow().clone().unwrap_or_else(Type::void);
                drop(kind);
                let mut f = f;
                if let Some(rgn) = &rgn {
                    let (f2, r) = self.rexp(f, rgn);
                    self.use_rval(&f2, rgn, &r);
                    f = f2;
                }
                let (f, rn) = self.rexp(f, &num);
                self.use_rval(&f, &num, &rn);
                // Only single objects are tracked field by field.
                let single = matches!(&*num.kind.borrow(), ExpKind::Sizeoftyp(_))
                    || eval_const_uint(&num) == Some(1);
                let leaf = if is_calloc || !single {
                    ALL
                } else {
                    NONE
                };
                let v = typ_to_absrval(&elt, &leaf);
                self.allocate(f, e, &elt, v)
            }
            ExpKind::Sizeoftyp(_) | ExpKind::Sizeofexp(_) => (f, ALL),
            ExpKind::Deref(ptr) => {
                let ptr = ptr.clone();
                drop(kind);
                let (f, r) = self.rexp(f, &ptr);
                let v = self.deref(&f, &ptr, &r, e);
                (f, v)
            }
            ExpKind::AggrMember(inner, field) => {
                let (inner, field) = (inner.clone(), field.clone());
                drop(kind);
                let (f, r) = self.rexp(f, &inner);
                let v = self.member(&f, &ty_of(&inner), &r, &field);
                (f, v)
            }
            ExpKind::AggrArrow(ptr, field) => {
                let (ptr, field) = (ptr.clone(), field.clone());
                drop(kind);
                let (f, r) = self.rexp(f, &ptr);
                let pointee = self.deref(&f, &ptr, &r, e);
                let elt = pointer_elt_type(&ty_of(&ptr)).unwrap_or_else(Type::void);
                let v = self.member(&f, &elt, &pointee, &field);
                (f, v)
            }
            ExpKind::Subscript(base, idx) => {
                let (base, idx) = (base.clone(), idx.clone());
                drop(kind);
                let bt = ty_of(&base);
                let (f, r) = self.rexp(f, &base);
                if matches!(&*compress(&bt), Type::Tuple(_)) {
                    let v = eval_const_uint(&idx)
                        .and_then(|i| usize::try_from(i).ok())
                        .and_then(|i| f.dict().and_then(|d| project(d, &r, PathCon::Dot(i))))
                        .unwrap_or_else(|| fresh_rval(&ty_of(e), InitLevel::AllIL));
                    return (f, v);
                }
                let (f, ri) = self.rexp(f, &idx);
                self.use_rval(&f, &idx, &ri);
                if is_array_type(&bt) {
                    return (f, fresh_rval(&ty_of(e), InitLevel::AllIL));
                }
                let v = self.deref(&f, &base, &r, e);
                if eval_const_uint(&idx) == Some(0) {
                    (f, v)
                } else {
                    (f, fresh_rval(&ty_of(e), InitLevel::AllIL))
                }
            }
            ExpKind::Tuple(es) => {
                let es = es.clone();
                drop(kind);
                let (f, vals) = self.rexps_moving(f, &es);
                (f, AbsRVal::Aggregate(UnionRInfo::not_union(), Rc::new(vals)))
            }
            ExpKind::Aggregate { fields, decl, .. } => {
                let fields = fields.clone();
                let names: Option<Vec<String>> = decl
                    .as_ref()
                    .and_then(|d| d.imp.as_ref())
                    .map(|imp| imp.fields.iter().map(|f| f.name.clone()).collect());
                let is_union = decl
                    .as_ref()
                    .is_some_and(|d| d.kind == strata_ast::AggrKind::Union);
                drop(kind);
                let names = names.unwrap_or_default();
                self.aggregate(f, e, &fields, &names, is_union)
            }
            ExpKind::AnonStruct(t, fields) => {
                let fields = fields.clone();
                let (names, is_union) = match &*compress(t) {
                    Type::AnonAggr(k, fs) => (
                        fs.iter().map(|f| f.name.clone()).collect(),
                        *k == strata_ast::AggrKind::Union,
                    ),
                    _ => (Vec::new(), false),
                };
                drop(kind);
                self.aggregate(f, e, &fields, &names, is_union)
            }
            ExpKind::Datatype(es, ..) | ExpKind::Array(es) => {
                let es = es.clone();
                drop(kind);
                let (mut f, vals) = self.rexps_moving(f, &es);
                for (a, v) in es.iter().zip(&vals) {
                    if !is_unique_pointer(&ty_of(a)) {
                        f = escape_deref(self.ctx, a.span, f, v);
                    }
                }
                (f, ALL)
            }
            ExpKind::Enum(..) | ExpKind::AnonEnum(..) => (f, ALL),
            ExpKind::Swap(a, b) => {
                let (a, b) = (a.clone(), b.clone());
                drop(kind);
                let (f, pa) = self.lexp(f, &a);
                let (f, pb) = self.lexp(f, &b);
                let (f, va) = self.rexp(f, &a);
                let (f, vb) = self.rexp(f, &b);
                let f = match pa {
                    Some(p) => assign_place(self.ctx, e.span, f, &p, vb.clone()),
                    None => escape_deref(self.ctx, e.span, f, &vb),
                };
                let f = match pb {
                    Some(p) => assign_place(self.ctx, e.span, f, &p, va),
                    None => escape_deref(self.ctx, e.span, f, &va),
                };
                (f, ALL)
            }
            ExpKind::StmtExp(s) => {
                let s = s.clone();
                drop(kind);
                self.stmt_exp(f, &s)
            }
        }
    }

    /// `lhs op= rhs` and increments: the old value must be initialized; the
    /// new one is an initialized scalar.
    fn update_in_place(
        &mut self,
        f: FlowInfo,
        e: &ExpRef,
        lhs: &ExpRef,
        rhs: Option<&ExpRef>,
    ) -> (FlowInfo, AbsRVal) {
        let (f, old) = self.rexp(f, lhs);
        self.use_rval(&f, lhs, &old);
        let f = match rhs {
            Some(rhs) => {
                let (f, r) = self.rexp(f, rhs);
                self.use_rval(&f, rhs, &r);
                f
            }
            None => f,
        };
        let (f, place) = self.lexp(f, lhs);
        let f = match place {
            Some(p) => assign_place(self.ctx, e.span, f, &p, ALL),
            None => f,
        };
        (f, ALL)
    }

    fn member(&self, f: &FlowInfo, t: &Ty, r: &AbsRVal, field: &str) -> AbsRVal {
        let idx = get_field_index(t, field);
        let projected = idx.and_then(|i| f.dict().and_then(|d| project(d, r, PathCon::Dot(i))));
        projected.unwrap_or_else(|| {
            let ft = crate::tcutil::aggr_field(t, field)
                .map(|(_, t)| t)
                .unwrap_or_else(Type::void);
            let il = f
                .dict()
                .map(|d| initlevel(d, r))
                .unwrap_or(InitLevel::AllIL);
            typ_to_absrval(&ft, &AbsRVal::UnknownR(il))
        })
    }

    /// Evaluates `es` left to right; unique pointers among them are moved.
    fn rexps_moving(&mut self, f: FlowInfo, es: &[ExpRef]) -> (FlowInfo, Vec<AbsRVal>) {
        let mut f = f;
        let mut vals = Vec::with_capacity(es.len());
        for a in es {
            let (f2, r) = self.rexp(f, a);
            f = self.consume(f2, a, r.clone(), false);
            vals.push(r);
        }
        (f, vals)
    }

    fn aggregate(
        &mut self,
        f: FlowInfo,
        e: &ExpRef,
        fields: &[strata_ast::FieldInit],
        names: &[String],
        is_union: bool,
    ) -> (FlowInfo, AbsRVal) {
        let n = names.len().max(fields.len());
        let mut vals = vec![NONE; n];
        let mut fieldnum = None;
        let mut f = f;
        for (pos, fi) in fields.iter().enumerate() {
            let (f2, r) = self.rexp(f, &fi.exp);
            f = self.consume(f2, &fi.exp, r.clone(), false);
            let idx = fi
                .field
                .as_ref()
                .and_then(|name| names.iter().position(|n| n == name))
                .unwrap_or(pos);
            if let Some(slot) = vals.get_mut(idx) {
                *slot = r;
            }
            fieldnum = Some(idx);
        }
        let ty = ty_of(e);
        // Missing members of a struct literal are zero-filled.
        let shaped = match typ_to_absrval(&ty, &ALL) {
            AbsRVal::Aggregate(_, defaults) if defaults.len() == n && !is_union => {
                let explicit: Vec<usize> = fields
                    .iter()
                    .enumerate()
                    .map(|(pos, fi)| {
                        fi.field
                            .as_ref()
                            .and_then(|name| names.iter().position(|n| n == name))
                            .unwrap_or(pos)
                    })
                    .collect();
                for (i, slot) in vals.iter_mut().enumerate() {
                    if !explicit.contains(&i) {
                        *slot = defaults[i].clone();
                    }
                }
                vals
            }
            _ => vals,
        };
        let info = UnionRInfo {
            is_union,
            fieldnum: if is_union { fieldnum } else { None },
        };
        (f, AbsRVal::Aggregate(info, Rc::new(shaped)))
    }

    /// A fresh object holding `v`: a unique pointer to it, or the address
    /// of a new allocation root.
    fn allocate(&mut self, f: FlowInfo, e: &ExpRef, elt: &Ty, v: AbsRVal) -> (FlowInfo, AbsRVal) {
        if is_unique_pointer(&ty_of(e)) {
            return (f, AbsRVal::UniquePtr(Rc::new(v)));
        }
        let root = Root::MallocPt(e.clone(), elt.clone());
        let mut f = f;
        f.insert(root.clone(), v);
        (f, AbsRVal::AddressOf(Rc::new(Place::root(root))))
    }

    fn call(
        &mut self,
        f: FlowInfo,
        e: &ExpRef,
        func: &ExpRef,
        args: &[ExpRef],
    ) -> (FlowInfo, AbsRVal) {
        let (f, rf) = self.rexp(f, func);
        self.use_rval(&f, func, &rf);
        let fty = ty_of(func);
        let attrs = fn_attributes(&fty);
        let mut f = f;
        let mut initialized = Vec::new();
        for (i, a) in args.iter().enumerate() {
            let (f2, r) = self.rexp(f, a);
            f = f2;
            if attrs.contains(&FnAttr::Initializes(i)) {
                if let AbsRVal::AddressOf(p) = unname_rval(&r) {
                    let elt = pointer_elt_type(&ty_of(a)).unwrap_or_else(Type::void);
                    initialized.push(((*p).clone(), elt));
                }
            } else if attrs.contains(&FnAttr::Noconsume(i)) {
                self.use_rval(&f, a, &r);
            } else if is_unique_pointer(&ty_of(a)) {
                f = self.consume(f, a, r, false);
            } else {
                f = escape_deref(self.ctx, a.span, f, &r);
            }
        }
        self.note_try(&f);
        for (p, elt) in initialized {
            f = assign_place(self.ctx, e.span, f, &p, typ_to_absrval(&elt, &ALL));
        }
        if is_noreturn_fn(&fty) {
            return (FlowInfo::Bottom, ALL);
        }
        (f, fresh_rval(&ty_of(e), InitLevel::AllIL))
    }

    /// Splits the flow on the truth of `e`.
    fn test(&mut self, f: FlowInfo, e: &ExpRef) -> (FlowInfo, FlowInfo) {
        if f.is_bottom() {
            return (FlowInfo::Bottom, FlowInfo::Bottom);
        }
        let kind = e.kind.borrow();
        match &*kind {
            ExpKind::Const(c) => {
                let truth = !matches!(
                    c,
                    Cnst::Null | Cnst::Int(_, 0) | Cnst::LongLong(_, 0) | Cnst::Char(0)
                );
                drop(kind);
                if truth {
                    (f, FlowInfo::Bottom)
                } else {
                    (FlowInfo::Bottom, f)
                }
            }
            ExpKind::Primop(Primop::Not, args) if args.len() == 1 => {
                let a = args[0].clone();
                drop(kind);
                let (t, ff) = self.test(f, &a);
                (ff, t)
            }
            ExpKind::And(a, b) => {
                let (a, b) = (a.clone(), b.clone());
                drop(kind);
                let (at, af) = self.test(f, &a);
                let (bt, bf) = self.test(at, &b);
                (bt, join_flow(&af, &bf))
            }
            ExpKind::Or(a, b) => {
                let (a, b) = (a.clone(), b.clone());
                drop(kind);
                let (at, af) = self.test(f, &a);
                let (bt, bf) = self.test(af, &b);
                (join_flow(&at, &bt), bf)
            }
            ExpKind::Primop(op @ (Primop::Eq | Primop::Neq), args) if args.len() == 2 => {
                let (op, a, b) = (*op, args[0].clone(), args[1].clone());
                drop(kind);
                let (f, ra) = self.rexp(f, &a);
                self.use_rval(&f, &a, &ra);
                let (f, rb) = self.rexp(f, &b);
                self.use_rval(&f, &b, &rb);
                let checked = if is_zero(&b) {
                    Some(&a)
                } else if is_zero(&a) {
                    Some(&b)
                } else {
                    None
                };
                let (nonnull, null) = match checked {
                    Some(p) => self.refine_null(f, p),
                    None => (f.clone(), f),
                };
                if op == Primop::Neq {
                    (nonnull, null)
                } else {
                    (null, nonnull)
                }
            }
            _ => {
                drop(kind);
                let (f, r) = self.rexp(f, e);
                self.use_rval(&f, e, &r);
                if is_pointer_type(&ty_of(e)) {
                    self.refine_null(f, e)
                } else {
                    (f.clone(), f)
                }
            }
        }
    }

    /// Flows where the pointer `p` is known non-null and null.
    fn refine_null(&self, f: FlowInfo, p: &ExpRef) -> (FlowInfo, FlowInfo) {
        let Some(place) = place_of(p) else {
            return (f.clone(), f);
        };
        let current = f.dict().and_then(|d| lookup_place(d, &place));
        if current != Some(ALL) {
            return (f.clone(), f);
        }
        let nonnull = assign_place(self.ctx, p.span, f.clone(), &place, AbsRVal::NotZeroAll);
        let null = assign_place(self.ctx, p.span, f, &place, AbsRVal::Zero);
        (nonnull, null)
    }

    // -------------------------------------------------------------------
    // statements

    fn stmt(&mut self, f: FlowInfo, s: &StmtRef) -> FlowInfo {
        if self.ctx.config.debug_flow {
            tracing::trace!(offset = s.span.offset(), flow = %f, "statement");
        }
        match &s.kind {
            StmtKind::Skip => f,
            StmtKind::Exp(e) => self.rexp(f, e).0,
            StmtKind::Seq(a, b) => {
                let f = self.stmt(f, a);
                self.stmt(f, b)
            }
            StmtKind::Return(e) => {
                let f = match e {
                    Some(e) => {
                        let (f, r) = self.rexp(f, e);
                        if is_unique_pointer(&ty_of(e)) {
                            self.consume(f, e, r, false)
                        } else {
                            self.use_rval(&f, e, &r);
                            f
                        }
                    }
                    None => f,
                };
                self.check_return(&f, s.span);
                FlowInfo::Bottom
            }
            StmtKind::IfThenElse(c, then, els) => {
                let (ft, ff) = self.test(f, c);
                let ft = self.stmt(ft, then);
                let ff = self.stmt(ff, els);
                join_flow(&ft, &ff)
            }
            StmtKind::While(cond, body) => self.loop_(f, s, |a, entry| {
                let (ft, ff) = a.test(entry, &cond.exp);
                let fb = a.stmt(ft, body);
                let back = join_flow(&fb, &a.take_jumps(&cond.point));
                (ff, back)
            }),
            StmtKind::Do(body, cond) => self.loop_(f, s, |a, entry| {
                let fb = a.stmt(entry, body);
                let fb = join_flow(&fb, &a.take_jumps(&cond.point));
                let (back, exit) = a.test(fb, &cond.exp);
                (exit, back)
            }),
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let (f, _) = self.rexp(f, init);
                self.loop_(f, s, |a, entry| a.for_once(entry, cond, step, body))
            }
            StmtKind::Break(t) | StmtKind::Continue(t) | StmtKind::Fallthru(t) => {
                if let Some(target) = t.get() {
                    self.jump(f, &target);
                }
                FlowInfo::Bottom
            }
            StmtKind::Goto(_, t) => {
                if let Some(target) = t.get() {
                    let key = StmtKey(target.clone());
                    if let Some(entry) = self.label_entries.get(&key) {
                        if !flow_lessthan_approx(&f, entry) {
                            self.needs_repass = true;
                        }
                    }
                    self.jump(f, &target);
                }
                FlowInfo::Bottom
            }
            StmtKind::Label(_, body) => {
                let key = StmtKey(s.clone());
                let f = match self.jumps.get(&key) {
                    Some(j) => join_flow(&f, j),
                    None => f,
                };
                self.label_entries.insert(key, f.clone());
                self.stmt(f, body)
            }
            StmtKind::Switch(e, clauses) => {
                let (f, r) = self.rexp(f, e);
                self.use_rval(&f, e, &r);
                let out = self.clauses(&f, clauses, true);
                join_flow(&out, &self.take_jumps(s))
            }
            StmtKind::TryCatch(body, clauses) => {
                self.try_flows.push(f.clone());
                let fb = self.stmt(f.clone(), body);
                let tf = self.try_flows.pop().unwrap_or(FlowInfo::Bottom);
                let handler = join_tryflow(&f, &tf);
                let fh = self.clauses(&handler, clauses, false);
                join_flow(&fb, &fh)
            }
            StmtKind::Decl(d, body) => {
                let body = body.clone();
                self.decl(f, &d.kind, |a, f| (a.stmt(f, &body), ())).0
            }
            StmtKind::Region {
                tvar,
                vd,
                resetable,
                body,
            } => {
                let saved = self.po.clone();
                if !self.po.contains(tvar) {
                    self.po = self.po.add_youngest(tvar, *resetable);
                }
                let mut f = f;
                f.insert(Root::VarRoot(vd.clone()), AbsRVal::NotZeroAll);
                let out = self.stmt(f, body);
                self.po = saved;
                remove_root(out, vd)
            }
            StmtKind::ResetRegion(h) => {
                let (f, r) = self.rexp(f, h);
                self.use_rval(&f, h, &r);
                self.reset_region(f, h)
            }
        }
    }

    /// Runs a loop: one pass, a join at the back edge, and one more pass
    /// if the join changed the entry flow.
    fn loop_(
        &mut self,
        inflow: FlowInfo,
        s: &StmtRef,
        mut once: impl FnMut(&mut Self, FlowInfo) -> (FlowInfo, FlowInfo),
    ) -> FlowInfo {
        let mut entry = inflow;
        let mut exit = FlowInfo::Bottom;
        for pass in 0..2 {
            let (out, back) = once(self, entry.clone());
            let back = restrict_to(back, &entry);
            exit = out;
            if pass == 1 || flow_lessthan_approx(&back, &entry) {
                break;
            }
            tracing::trace!(offset = s.span.offset(), "loop back edge widened the entry flow");
            entry = join_flow(&entry, &back);
            self.iteration += 1;
        }
        join_flow(&exit, &self.take_jumps(s))
    }

    fn for_once(
        &mut self,
        entry: FlowInfo,
        cond: &LoopCond,
        step: &LoopCond,
        body: &StmtRef,
    ) -> (FlowInfo, FlowInfo) {
        let (ft, ff) = self.test(entry, &cond.exp);
        let fb = self.stmt(ft, body);
        let fb = join_flow(&fb, &self.take_jumps(&step.point));
        let (back, _) = self.rexp(fb, &step.exp);
        (ff, back)
    }

    /// Switch or catch clauses entered with `f`. Falling off the end of a
    /// non-last switch clause is an error; the last clause's end, like
    /// every catch clause's, leaves the statement.
    fn clauses(&mut self, f: &FlowInfo, clauses: &[Rc<SwitchClause>], is_switch: bool) -> FlowInfo {
        let mut out = FlowInfo::Bottom;
        let n = clauses.len();
        for (i, c) in clauses.iter().enumerate() {
            let vars = c.pat_vars.borrow().clone().unwrap_or_default();
            let mut cf = f.clone();
            for vd in &vars {
                cf.insert(Root::VarRoot(vd.clone()), fresh_rval(&vd.ty(), InitLevel::AllIL));
            }
            let cf = join_flow(&cf, &self.take_jumps(&c.body));
            let cf = match &c.guard {
                Some(g) => self.test(cf, g).0,
                None => cf,
            };
            let mut o = self.stmt(cf, &c.body);
            for vd in &vars {
                o = remove_root(o, vd);
            }
            if is_switch && i + 1 < n && !o.is_bottom() {
                self.ctx.error(
                    ErrorKind::Flow,
                    c.body.span,
                    "switch clause may implicitly fallthru",
                );
            }
            out = join_flow(&out, &o);
        }
        out
    }

    fn decl<T>(
        &mut self,
        f: FlowInfo,
        d: &DeclKind,
        body: impl FnOnce(&mut Self, FlowInfo) -> (FlowInfo, T),
    ) -> (FlowInfo, T) {
        match d {
            DeclKind::Var(vd) => {
                let root = Root::VarRoot(vd.clone());
                let f = match &vd.initializer {
                    Some(init) => {
                        let (f, r) = self.rexp(f, init);
                        let mut f = self.consume(f, init, r.clone(), false);
                        f.insert(root, r);
                        f
                    }
                    None => {
                        let mut f = f;
                        f.insert(root, decl_rval(&vd.ty()));
                        f
                    }
                };
                let (out, v) = body(self, f);
                (remove_root(out, vd), v)
            }
            DeclKind::Let {
                pat,
                pat_vars,
                init,
            } => {
                let vars = pat_vars.borrow().clone().unwrap_or_default();
                let (f, r) = self.rexp(f, init);
                let alias = match &*pat.kind.borrow() {
                    PatKind::Alias(_, vd) => Some(vd.clone()),
                    _ => None,
                };
                let (mut f, alias_place) = match &alias {
                    Some(_) => {
                        let f = self.consume(f, init, r.clone(), true);
                        (f, place_of(init).filter(|_| is_unique_pointer(&ty_of(init))))
                    }
                    None => (self.consume(f, init, r.clone(), false), None),
                };
                let whole = matches!(&*pat.kind.borrow(), PatKind::Var(_) | PatKind::Alias(..));
                for vd in &vars {
                    let v = if whole {
                        unname_rval(&r)
                    } else {
                        fresh_rval(&vd.ty(), InitLevel::AllIL)
                    };
                    f.insert(Root::VarRoot(vd.clone()), v);
                }
                let (mut out, v) = body(self, f);
                if let Some(place) = alias_place {
                    let restored = out
                        .dict()
                        .and_then(|d| lookup_place(d, &place))
                        .map(|v| make_unique_unconsumed(&v));
                    if let Some(restored) = restored {
                        out = assign_place(self.ctx, init.span, out, &place, restored);
                    }
                }
                for vd in &vars {
                    out = remove_root(out, vd);
                }
                (out, v)
            }
            DeclKind::Fn(_)
            | DeclKind::Aggr(_)
            | DeclKind::Datatype(_)
            | DeclKind::Enum(_)
            | DeclKind::Typedef(_)
            | DeclKind::Namespace(..)
            | DeclKind::Using(..) => body(self, f),
        }
    }

    /// Value of a statement expression: its last expression statement.
    fn stmt_exp(&mut self, f: FlowInfo, s: &StmtRef) -> (FlowInfo, AbsRVal) {
        match &s.kind {
            StmtKind::Exp(e) => self.rexp(f, e),
            StmtKind::Seq(a, b) => {
                let f = self.stmt(f, a);
                self.stmt_exp(f, b)
            }
            StmtKind::Decl(d, body) => {
                let body = body.clone();
                self.decl(f, &d.kind, |a, f| a.stmt_exp(f, &body))
            }
            _ => (self.stmt(f, s), ALL),
        }
    }

    /// Objects in the region behind handle `h` are gone; pointers into it
    /// become uninitialized.
    fn reset_region(&mut self, f: FlowInfo, h: &ExpRef) -> FlowInfo {
        let Some(rgn) = handle_region(&ty_of(h)) else {
            return f;
        };
        if let Type::Var(tv) = &*rgn {
            if self.po.contains(tv) && !self.po.is_region_resetable(tv) {
                self.ctx.error(
                    ErrorKind::Region,
                    h.span,
                    format!("reset_region on region {tv} which is not resetable"),
                );
            }
        }
        let FlowInfo::Reachable(mut d) = f else {
            return f;
        };
        for (root, v) in d.iter_mut() {
            let Root::VarRoot(vd) = root else { continue };
            if pointer_region(&vd.ty()).is_some_and(|r| typecmp(&r, &rgn)) {
                *v = NONE;
            }
        }
        FlowInfo::Reachable(d)
    }
}

/// The tracked location `e` names without evaluating anything: a local
/// variable, a member of one, or the object a unique pointer in one
/// points to.
fn place_of(e: &ExpRef) -> Option<Place> {
    match &*e.kind.borrow() {
        ExpKind::Var(_, b) if b.is_local() => {
            b.vardecl().map(|vd| Place::root(Root::VarRoot(vd.clone())))
        }
        ExpKind::NoInstantiate(inner) | ExpKind::Instantiate(inner, _) => place_of(inner),
        ExpKind::AggrMember(inner, field) => {
            let i = get_field_index(&inner.ty()?, field)?;
            Some(place_of(inner)?.extend(PathCon::Dot(i)))
        }
        ExpKind::Deref(inner) if inner.ty().is_some_and(|t| is_unique_pointer(&t)) => {
            Some(place_of(inner)?.extend(PathCon::Star))
        }
        ExpKind::AggrArrow(inner, field) if inner.ty().is_some_and(|t| is_unique_pointer(&t)) => {
            let elt = pointer_elt_type(&inner.ty()?)?;
            let i = get_field_index(&elt, field)?;
            Some(place_of(inner)?.extend(PathCon::Star).extend(PathCon::Dot(i)))
        }
        _ => None,
    }
}
