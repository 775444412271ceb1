//! Lattice operations and transfer primitives over flow states.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use strata_ast::Span;

use super::{AbsRVal, FlowDict, FlowInfo, InitLevel, PathCon, Place, Root, UnionRInfo, initlevel};
use crate::ctx::Ctx;
use crate::error::ErrorKind;

/// Value of a root present on only one side of a join.
const MISSING: AbsRVal = AbsRVal::Esc(InitLevel::NoneIL);

fn level(v: &AbsRVal) -> InitLevel {
    match v {
        AbsRVal::UnknownR(il) | AbsRVal::Esc(il) => *il,
        _ => InitLevel::AllIL,
    }
}

/// Initialization of a value without looking through addresses.
fn shallow_level(v: &AbsRVal) -> InitLevel {
    match v {
        AbsRVal::Zero | AbsRVal::NotZeroAll | AbsRVal::AddressOf(_) => InitLevel::AllIL,
        AbsRVal::UnknownR(il) | AbsRVal::Esc(il) => *il,
        AbsRVal::UniquePtr(v) | AbsRVal::NamedLocation(_, v) => shallow_level(v),
        AbsRVal::Consumed { old, .. } => shallow_level(old),
        AbsRVal::Aggregate(_, fs) => fs
            .iter()
            .map(shallow_level)
            .max()
            .unwrap_or(InitLevel::AllIL),
    }
}

/// Views a pointer-like value as one of the four scalar values.
fn scalarize(v: &AbsRVal, escapes: &mut Vec<Rc<Place>>) -> AbsRVal {
    match v {
        AbsRVal::AddressOf(p) => {
            escapes.push(p.clone());
            AbsRVal::NotZeroAll
        }
        AbsRVal::UniquePtr(_) | AbsRVal::Aggregate(..) => match shallow_level(v) {
            InitLevel::AllIL => AbsRVal::NotZeroAll,
            InitLevel::NoneIL => AbsRVal::UnknownR(InitLevel::NoneIL),
        },
        other => other.clone(),
    }
}

fn join_scalar(a: &AbsRVal, b: &AbsRVal) -> AbsRVal {
    use AbsRVal::*;
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (Esc(_), _) | (_, Esc(_)) => Esc(level(a).max(level(b))),
        _ => UnknownR(level(a).max(level(b))),
    }
}

fn consumer_key(consumer: &Span, iteration: u32) -> (usize, usize, u32) {
    (consumer.offset(), consumer.len(), iteration)
}

fn join_vals(a: &AbsRVal, b: &AbsRVal, escapes: &mut Vec<Rc<Place>>) -> AbsRVal {
    use AbsRVal::*;
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (
            Consumed {
                consumer: c1,
                iteration: i1,
                old: o1,
                local_alias: l1,
            },
            Consumed {
                consumer: c2,
                iteration: i2,
                old: o2,
                local_alias: l2,
            },
        ) => {
            let (consumer, iteration) = if consumer_key(c1, *i1) <= consumer_key(c2, *i2) {
                (*c1, *i1)
            } else {
                (*c2, *i2)
            };
            Consumed {
                consumer,
                iteration,
                old: Rc::new(join_vals(o1, o2, escapes)),
                local_alias: *l1 && *l2,
            }
        }
        (
            Consumed {
                consumer,
                iteration,
                old,
                local_alias,
            },
            other,
        )
        | (
            other,
            Consumed {
                consumer,
                iteration,
                old,
                local_alias,
            },
        ) => Consumed {
            consumer: *consumer,
            iteration: *iteration,
            old: Rc::new(join_vals(old, other, escapes)),
            local_alias: *local_alias,
        },
        (NamedLocation(n1, v1), NamedLocation(n2, v2)) if Rc::ptr_eq(n1, n2) => {
            NamedLocation(n1.clone(), Rc::new(join_vals(v1, v2, escapes)))
        }
        (NamedLocation(_, v), other) | (other, NamedLocation(_, v)) => join_vals(v, other, escapes),
        (Aggregate(i1, f1), Aggregate(i2, f2)) if f1.len() == f2.len() => {
            let info = UnionRInfo {
                is_union: i1.is_union,
                fieldnum: if i1.fieldnum == i2.fieldnum {
                    i1.fieldnum
                } else {
                    None
                },
            };
            let fields = f1
                .iter()
                .zip(f2.iter())
                .map(|(x, y)| join_vals(x, y, escapes))
                .collect();
            Aggregate(info, Rc::new(fields))
        }
        (Aggregate(info, fs), other) | (other, Aggregate(info, fs))
            if !matches!(other, Aggregate(..)) =>
        {
            let fields = fs.iter().map(|x| join_vals(x, other, escapes)).collect();
            Aggregate(*info, Rc::new(fields))
        }
        (UniquePtr(v), UniquePtr(w)) => UniquePtr(Rc::new(join_vals(v, w, escapes))),
        _ => {
            let a = scalarize(a, escapes);
            let b = scalarize(b, escapes);
            join_scalar(&a, &b)
        }
    }
}

/// Least upper bound of two values. Addresses that disagree are forgotten;
/// use [`join_flow_and_rval`] to also mark their targets escaped.
pub fn join_absrval(a: &AbsRVal, b: &AbsRVal) -> AbsRVal {
    join_vals(a, b, &mut Vec::new())
}

fn escape_roots(d: &mut FlowDict, escapes: Vec<Rc<Place>>) {
    for p in escapes {
        if let Some(v) = d.get(&p.root) {
            let il = initlevel(d, v);
            d.insert(p.root.clone(), AbsRVal::Esc(il));
        }
    }
}

fn join_dicts(d1: &FlowDict, d2: &FlowDict, escapes: &mut Vec<Rc<Place>>) -> FlowDict {
    let mut out = HashMap::with_capacity(d1.len().max(d2.len()));
    for (root, v1) in d1 {
        let v = match d2.get(root) {
            Some(v2) => join_vals(v1, v2, escapes),
            None => join_vals(v1, &MISSING, escapes),
        };
        out.insert(root.clone(), v);
    }
    for (root, v2) in d2 {
        if !d1.contains_key(root) {
            out.insert(root.clone(), join_vals(&MISSING, v2, escapes));
        }
    }
    out
}

/// Join at a control-flow merge. `Bottom` is the identity.
pub fn join_flow(f1: &FlowInfo, f2: &FlowInfo) -> FlowInfo {
    match (f1, f2) {
        (FlowInfo::Bottom, f) | (f, FlowInfo::Bottom) => f.clone(),
        (FlowInfo::Reachable(d1), FlowInfo::Reachable(d2)) => {
            let mut escapes = Vec::new();
            let mut d = join_dicts(d1, d2, &mut escapes);
            escape_roots(&mut d, escapes);
            FlowInfo::Reachable(d)
        }
    }
}

/// Joins two flows and the values computed along them.
pub fn join_flow_and_rval(
    (f1, r1): (FlowInfo, AbsRVal),
    (f2, r2): (FlowInfo, AbsRVal),
) -> (FlowInfo, AbsRVal) {
    match (&f1, &f2) {
        (FlowInfo::Bottom, _) => (f2, r2),
        (_, FlowInfo::Bottom) => (f1, r1),
        (FlowInfo::Reachable(d1), FlowInfo::Reachable(d2)) => {
            let mut escapes = Vec::new();
            let mut d = join_dicts(d1, d2, &mut escapes);
            let r = join_vals(&r1, &r2, &mut escapes);
            escape_roots(&mut d, escapes);
            (FlowInfo::Reachable(d), r)
        }
    }
}

/// `f1 ⊑ f2`: joining `f1` into `f2` changes nothing on `f2`'s roots.
pub fn flow_lessthan_approx(f1: &FlowInfo, f2: &FlowInfo) -> bool {
    match (f1, f2) {
        (FlowInfo::Bottom, _) => true,
        (FlowInfo::Reachable(_), FlowInfo::Bottom) => false,
        (FlowInfo::Reachable(d1), FlowInfo::Reachable(d2)) => {
            let missing = MISSING;
            d2.iter().all(|(root, v2)| {
                let v1 = d1.get(root).unwrap_or(&missing);
                join_vals(v1, v2, &mut Vec::new()) == *v2
            })
        }
    }
}

fn unconsume_aliases(v: &AbsRVal) -> AbsRVal {
    match v {
        AbsRVal::Consumed {
            old,
            local_alias: true,
            ..
        } => unconsume_aliases(old),
        AbsRVal::Aggregate(info, fs) => {
            AbsRVal::Aggregate(*info, Rc::new(fs.iter().map(unconsume_aliases).collect()))
        }
        AbsRVal::NamedLocation(vd, v) => {
            AbsRVal::NamedLocation(vd.clone(), Rc::new(unconsume_aliases(v)))
        }
        other => other.clone(),
    }
}

/// Flow at the entry of an exception handler. Values consumed only by an
/// `alias` pattern are live again: the alias scope did not complete.
pub fn join_tryflow(f1: &FlowInfo, f2: &FlowInfo) -> FlowInfo {
    match join_flow(f1, f2) {
        FlowInfo::Bottom => FlowInfo::Bottom,
        FlowInfo::Reachable(d) => FlowInfo::Reachable(
            d.into_iter()
                .map(|(root, v)| {
                    let v = unconsume_aliases(&v);
                    (root, v)
                })
                .collect(),
        ),
    }
}

/// Rewrites `p` so that no `Star` step goes through a known address.
fn canonical_place(d: &FlowDict, p: &Place) -> Place {
    let mut cur = Place::root(p.root.clone());
    let mut val = d.get(&p.root).cloned();
    for step in &p.path {
        if let (PathCon::Star, Some(AbsRVal::AddressOf(target))) =
            (step, val.as_ref().map(unname_rval))
        {
            cur = (*target).clone();
            val = super::lookup_place(d, &cur);
            continue;
        }
        cur = cur.extend(*step);
        val = val.and_then(|v| super::project(d, &v, *step));
    }
    cur
}

fn assign_path(
    ctx: &Ctx,
    span: Span,
    old: &AbsRVal,
    path: &[PathCon],
    newval: AbsRVal,
    d: &FlowDict,
) -> AbsRVal {
    let Some((step, rest)) = path.split_first() else {
        return match old {
            AbsRVal::Esc(_) => {
                let il = initlevel(d, &newval);
                if il == InitLevel::NoneIL {
                    ctx.error(ErrorKind::Flow, span, "escape of uninitialized memory");
                }
                AbsRVal::Esc(InitLevel::AllIL)
            }
            AbsRVal::NamedLocation(vd, _) => AbsRVal::NamedLocation(vd.clone(), Rc::new(newval)),
            _ => newval,
        };
    };
    match (old, step) {
        (AbsRVal::NamedLocation(vd, v), _) => AbsRVal::NamedLocation(
            vd.clone(),
            Rc::new(assign_path(ctx, span, v, path, newval, d)),
        ),
        (AbsRVal::Aggregate(info, fs), PathCon::Dot(i)) if *i < fs.len() => {
            let mut fields = (**fs).clone();
            fields[*i] = assign_path(ctx, span, &fs[*i], rest, newval, d);
            let info = UnionRInfo {
                is_union: info.is_union,
                fieldnum: if info.is_union { Some(*i) } else { None },
            };
            AbsRVal::Aggregate(info, Rc::new(fields))
        }
        (AbsRVal::UniquePtr(v), PathCon::Star) => {
            AbsRVal::UniquePtr(Rc::new(assign_path(ctx, span, v, rest, newval, d)))
        }
        // No shape to update: the write goes to storage the analysis
        // summarizes by a single value.
        _ => old.clone(),
    }
}

/// Writes `newval` to `place`. Initialization only ever grows along the
/// written path; writing one member of a union records it as the live one.
pub fn assign_place(
    ctx: &Ctx,
    span: Span,
    flow: FlowInfo,
    place: &Place,
    newval: AbsRVal,
) -> FlowInfo {
    let FlowInfo::Reachable(mut d) = flow else {
        return FlowInfo::Bottom;
    };
    let place = canonical_place(&d, place);
    let updated = match d.get(&place.root) {
        Some(old) => assign_path(ctx, span, old, &place.path, newval, &d),
        None if place.path.is_empty() => newval,
        None => return FlowInfo::Reachable(d),
    };
    d.insert(place.root, updated);
    FlowInfo::Reachable(d)
}

/// Marks everything reachable from `r` as escaped. Escaping memory that
/// is not fully initialized is an error.
pub fn escape_deref(ctx: &Ctx, span: Span, flow: FlowInfo, r: &AbsRVal) -> FlowInfo {
    let FlowInfo::Reachable(mut d) = flow else {
        return FlowInfo::Bottom;
    };
    if initlevel(&d, r) == InitLevel::NoneIL {
        ctx.error(ErrorKind::Flow, span, "escape of uninitialized memory");
    }
    let mut seen: HashSet<Root> = HashSet::new();
    let mut work = vec![r.clone()];
    while let Some(v) = work.pop() {
        match v {
            AbsRVal::AddressOf(p) => {
                if !seen.insert(p.root.clone()) {
                    continue;
                }
                if let Some(old) = d.get(&p.root).cloned() {
                    let il = initlevel(&d, &old);
                    work.push(old);
                    d.insert(p.root.clone(), AbsRVal::Esc(il));
                }
            }
            AbsRVal::UniquePtr(v) | AbsRVal::NamedLocation(_, v) => work.push((*v).clone()),
            AbsRVal::Consumed { old, .. } => work.push((*old).clone()),
            AbsRVal::Aggregate(_, fs) => work.extend(fs.iter().cloned()),
            AbsRVal::Zero | AbsRVal::NotZeroAll | AbsRVal::UnknownR(_) | AbsRVal::Esc(_) => {}
        }
    }
    FlowInfo::Reachable(d)
}

pub fn make_unique_consumed(
    consumer: Span,
    iteration: u32,
    v: AbsRVal,
    local_alias: bool,
) -> AbsRVal {
    AbsRVal::Consumed {
        consumer,
        iteration,
        old: Rc::new(v),
        local_alias,
    }
}

/// Restores every consumed value inside `v` to its value before
/// consumption.
pub fn make_unique_unconsumed(v: &AbsRVal) -> AbsRVal {
    match v {
        AbsRVal::Consumed { old, .. } => make_unique_unconsumed(old),
        AbsRVal::Aggregate(info, fs) => {
            AbsRVal::Aggregate(*info, Rc::new(fs.iter().map(make_unique_unconsumed).collect()))
        }
        AbsRVal::NamedLocation(vd, v) => {
            AbsRVal::NamedLocation(vd.clone(), Rc::new(make_unique_unconsumed(v)))
        }
        other => other.clone(),
    }
}

/// Whether `v` or any component of it has been consumed.
pub fn is_unique_consumed(v: &AbsRVal) -> bool {
    match v {
        AbsRVal::Consumed { .. } => true,
        AbsRVal::Aggregate(_, fs) => fs.iter().any(is_unique_consumed),
        AbsRVal::NamedLocation(_, v) => is_unique_consumed(v),
        _ => false,
    }
}

/// Strips `NamedLocation` wrappers.
pub fn unname_rval(v: &AbsRVal) -> AbsRVal {
    match v {
        AbsRVal::NamedLocation(_, v) => unname_rval(v),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::build::Builder;
    use strata_ast::{Type, span};

    use crate::flow::lookup_place;

    fn consumed(at: usize, old: AbsRVal) -> AbsRVal {
        make_unique_consumed(span(at, 1), 0, old, false)
    }

    #[test]
    fn scalar_joins() {
        use AbsRVal::*;
        assert_eq!(
            join_absrval(&Zero, &NotZeroAll),
            UnknownR(InitLevel::AllIL)
        );
        assert_eq!(
            join_absrval(&UnknownR(InitLevel::AllIL), &Esc(InitLevel::NoneIL)),
            Esc(InitLevel::NoneIL)
        );
        assert_eq!(join_absrval(&Zero, &Zero), Zero);
    }

    #[test]
    fn consumption_survives_a_join_with_the_earliest_consumer() {
        let live = AbsRVal::UniquePtr(Rc::new(AbsRVal::UnknownR(InitLevel::AllIL)));
        let a = consumed(5, live.clone());
        let b = consumed(3, live.clone());
        let AbsRVal::Consumed { consumer, .. } = join_absrval(&a, &b) else {
            panic!("join lost the consumption")
        };
        assert_eq!(consumer.offset(), 3);
        assert!(is_unique_consumed(&join_absrval(&a, &live)));
        assert_eq!(make_unique_unconsumed(&a), live);
    }

    #[test]
    fn alias_consumption_is_undone_at_handlers() {
        let b = Builder::new();
        let p = b.vardecl("p", Type::star(Type::sint(), Type::unique_rgn()), None);
        let live = AbsRVal::UniquePtr(Rc::new(AbsRVal::NotZeroAll));
        let mut f = FlowInfo::empty();
        f.insert(
            Root::VarRoot(p.clone()),
            make_unique_consumed(span(1, 1), 0, live.clone(), true),
        );
        let g = join_tryflow(&f, &FlowInfo::Bottom);
        assert_eq!(g.dict().and_then(|d| d.get(&Root::VarRoot(p))), Some(&live));
    }

    #[test]
    fn bottom_is_the_identity() {
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let mut f = FlowInfo::empty();
        f.insert(Root::VarRoot(x), AbsRVal::Zero);
        assert_eq!(join_flow(&FlowInfo::Bottom, &f), f);
        assert!(flow_lessthan_approx(&FlowInfo::Bottom, &f));
        assert!(!flow_lessthan_approx(&f, &FlowInfo::Bottom));
    }

    #[test]
    fn assignment_initializes_a_field() {
        let ctx = Ctx::default();
        let b = Builder::new();
        let x = b.vardecl("x", Type::tuple(vec![Type::sint(), Type::sint()]), None);
        let root = Root::VarRoot(x);
        let none = AbsRVal::UnknownR(InitLevel::NoneIL);
        let mut f = FlowInfo::empty();
        f.insert(
            root.clone(),
            AbsRVal::Aggregate(UnionRInfo::not_union(), Rc::new(vec![none.clone(), none])),
        );
        let p = Place::root(root.clone()).extend(PathCon::Dot(0));
        let f = assign_place(&ctx, span(0, 1), f, &p, AbsRVal::Zero);
        let d = f.dict().unwrap();
        assert_eq!(lookup_place(d, &p), Some(AbsRVal::Zero));
        let whole = d.get(&root).unwrap();
        assert_eq!(initlevel(d, whole), InitLevel::NoneIL);
        assert_eq!(ctx.error_count(), 0);
    }

    #[test]
    fn writes_through_an_address_reach_the_target() {
        let ctx = Ctx::default();
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let p = b.vardecl("p", Type::star(Type::sint(), Type::heap_rgn()), None);
        let mut f = FlowInfo::empty();
        f.insert(Root::VarRoot(x.clone()), AbsRVal::UnknownR(InitLevel::NoneIL));
        f.insert(
            Root::VarRoot(p.clone()),
            AbsRVal::AddressOf(Rc::new(Place::root(Root::VarRoot(x.clone())))),
        );
        let star_p = Place::root(Root::VarRoot(p)).extend(PathCon::Star);
        let f = assign_place(&ctx, span(0, 1), f, &star_p, AbsRVal::NotZeroAll);
        assert_eq!(
            f.dict().and_then(|d| d.get(&Root::VarRoot(x))),
            Some(&AbsRVal::NotZeroAll)
        );
    }

    #[test]
    fn escaping_uninitialized_memory_is_reported() {
        let ctx = Ctx::default();
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let mut f = FlowInfo::empty();
        f.insert(Root::VarRoot(x.clone()), AbsRVal::UnknownR(InitLevel::NoneIL));
        let addr = AbsRVal::AddressOf(Rc::new(Place::root(Root::VarRoot(x.clone()))));
        let f = escape_deref(&ctx, span(0, 1), f, &addr);
        assert_eq!(ctx.error_count(), 1);
        assert_eq!(
            f.dict().and_then(|d| d.get(&Root::VarRoot(x))),
            Some(&AbsRVal::Esc(InitLevel::NoneIL))
        );
    }

    #[test]
    fn differing_addresses_escape_both_targets() {
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let y = b.vardecl("y", Type::sint(), None);
        let p = b.vardecl("p", Type::star(Type::sint(), Type::heap_rgn()), None);
        let at = |vd: &strata_ast::VarRef| {
            AbsRVal::AddressOf(Rc::new(Place::root(Root::VarRoot(vd.clone()))))
        };
        let mut base = FlowInfo::empty();
        base.insert(Root::VarRoot(x.clone()), AbsRVal::Zero);
        base.insert(Root::VarRoot(y.clone()), AbsRVal::Zero);
        let mut f1 = base.clone();
        f1.insert(Root::VarRoot(p.clone()), at(&x));
        let mut f2 = base;
        f2.insert(Root::VarRoot(p.clone()), at(&y));
        let j = join_flow(&f1, &f2);
        let d = j.dict().unwrap();
        assert_eq!(d.get(&Root::VarRoot(p)), Some(&AbsRVal::NotZeroAll));
        assert_eq!(d.get(&Root::VarRoot(x)), Some(&AbsRVal::Esc(InitLevel::AllIL)));
        assert_eq!(d.get(&Root::VarRoot(y)), Some(&AbsRVal::Esc(InitLevel::AllIL)));
    }
}
