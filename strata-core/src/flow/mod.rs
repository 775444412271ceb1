//! Flow analysis: initialization, aliasing and unique-pointer consumption.
//!
//! The abstract state at a program point maps storage roots (locals,
//! allocation sites, parameter slots) to abstract values. Function bodies
//! are interpreted forward once; loops get one join at the back edge and at
//! most one re-analysis of the body.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use strata_ast::{ExpRef, Span, Ty, Type, VarRef};

use crate::tcutil::{aggr_field, aggr_field_types, compress, is_union_type};

mod analyze;
mod ops;

pub use analyze::analyze_fn;
pub use ops::{
    assign_place, escape_deref, flow_lessthan_approx, is_unique_consumed, join_absrval, join_flow,
    join_flow_and_rval, join_tryflow, make_unique_consumed, make_unique_unconsumed, unname_rval,
};

/// Where a piece of storage comes from.
#[derive(Clone, Debug)]
pub enum Root {
    VarRoot(VarRef),
    /// Allocation site and the allocated type.
    MallocPt(ExpRef, Ty),
    /// Storage a pointer parameter marked `initializes` points to.
    InitParam(usize, Ty),
}

impl PartialEq for Root {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Root::VarRoot(a), Root::VarRoot(b)) => Rc::ptr_eq(a, b),
            (Root::MallocPt(a, _), Root::MallocPt(b, _)) => Rc::ptr_eq(a, b),
            (Root::InitParam(a, _), Root::InitParam(b, _)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Root {}

impl Hash for Root {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Root::VarRoot(vd) => Rc::as_ptr(vd).hash(state),
            Root::MallocPt(e, _) => Rc::as_ptr(e).hash(state),
            Root::InitParam(i, _) => i.hash(state),
        }
    }
}

impl Root {
    pub fn ty(&self) -> Ty {
        match self {
            Root::VarRoot(vd) => vd.ty(),
            Root::MallocPt(_, t) | Root::InitParam(_, t) => t.clone(),
        }
    }
}

/// One projection step. Field indices follow declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PathCon {
    Dot(usize),
    Star,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Place {
    pub root: Root,
    pub path: Vec<PathCon>,
}

impl Place {
    pub fn root(root: Root) -> Self {
        Place {
            root,
            path: Vec::new(),
        }
    }

    pub fn extend(&self, step: PathCon) -> Self {
        let mut path = self.path.clone();
        path.push(step);
        Place {
            root: self.root.clone(),
            path,
        }
    }
}

/// How much of a value is initialized. `NoneIL` is the conservative end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InitLevel {
    AllIL,
    NoneIL,
}

/// Which member of a union was written last, when known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UnionRInfo {
    pub is_union: bool,
    pub fieldnum: Option<usize>,
}

impl UnionRInfo {
    pub fn not_union() -> Self {
        UnionRInfo {
            is_union: false,
            fieldnum: None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum AbsRVal {
    /// Known null, initialized.
    Zero,
    /// Non-null, everything reachable from it initialized.
    NotZeroAll,
    UnknownR(InitLevel),
    /// May be aliased by storage the analysis does not track.
    Esc(InitLevel),
    AddressOf(Rc<Place>),
    /// A unique pointer; the payload is the value it points to.
    UniquePtr(Rc<AbsRVal>),
    Aggregate(UnionRInfo, Rc<Vec<AbsRVal>>),
    /// A unique value moved out by `consumer` in loop `iteration`.
    /// `local_alias` marks a consumption by an `alias` pattern, which is
    /// undone when the pattern's scope ends.
    Consumed {
        consumer: Span,
        iteration: u32,
        old: Rc<AbsRVal>,
        local_alias: bool,
    },
    /// A parameter passed without consuming it.
    NamedLocation(VarRef, Rc<AbsRVal>),
}

impl PartialEq for AbsRVal {
    fn eq(&self, other: &Self) -> bool {
        use AbsRVal::*;
        match (self, other) {
            (Zero, Zero) | (NotZeroAll, NotZeroAll) => true,
            (UnknownR(a), UnknownR(b)) | (Esc(a), Esc(b)) => a == b,
            (AddressOf(a), AddressOf(b)) => a == b,
            (UniquePtr(a), UniquePtr(b)) => a == b,
            (Aggregate(i1, v1), Aggregate(i2, v2)) => i1 == i2 && v1 == v2,
            (
                Consumed {
                    consumer: c1,
                    iteration: i1,
                    old: o1,
                    local_alias: a1,
                },
                Consumed {
                    consumer: c2,
                    iteration: i2,
                    old: o2,
                    local_alias: a2,
                },
            ) => c1 == c2 && i1 == i2 && a1 == a2 && o1 == o2,
            (NamedLocation(n1, v1), NamedLocation(n2, v2)) => Rc::ptr_eq(n1, n2) && v1 == v2,
            _ => false,
        }
    }
}

pub type FlowDict = HashMap<Root, AbsRVal>;

#[derive(Clone, Debug, PartialEq)]
pub enum FlowInfo {
    Bottom,
    Reachable(FlowDict),
}

impl FlowInfo {
    pub fn empty() -> Self {
        FlowInfo::Reachable(HashMap::new())
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, FlowInfo::Bottom)
    }

    pub fn dict(&self) -> Option<&FlowDict> {
        match self {
            FlowInfo::Bottom => None,
            FlowInfo::Reachable(d) => Some(d),
        }
    }

    /// Sets `root`; a no-op on unreachable flow.
    pub fn insert(&mut self, root: Root, v: AbsRVal) {
        if let FlowInfo::Reachable(d) = self {
            d.insert(root, v);
        }
    }
}

/// The value a fresh object of type `t` has: aggregates are expanded
/// field by field, everything else is `leaf`.
pub fn typ_to_absrval(t: &Ty, leaf: &AbsRVal) -> AbsRVal {
    let t = compress(t);
    match &*t {
        Type::Aggr(_) | Type::AnonAggr(..) | Type::Tuple(_) => match aggr_field_types(&t) {
            Some(fields) => AbsRVal::Aggregate(
                UnionRInfo {
                    is_union: is_union_type(&t),
                    fieldnum: None,
                },
                Rc::new(aggrfields_to_aggrdict(&fields, leaf)),
            ),
            None => leaf.clone(),
        },
        _ => leaf.clone(),
    }
}

pub fn aggrfields_to_aggrdict(fields: &[Ty], leaf: &AbsRVal) -> Vec<AbsRVal> {
    fields.iter().map(|t| typ_to_absrval(t, leaf)).collect()
}

/// Declaration-order index of `field` in the aggregate type `t`.
pub fn get_field_index(t: &Ty, field: &str) -> Option<usize> {
    aggr_field(t, field).map(|(i, _)| i)
}

/// Initialization level of `r`, following addresses through `d`.
pub fn initlevel(d: &FlowDict, r: &AbsRVal) -> InitLevel {
    let mut visiting = HashSet::new();
    initlevel_rec(d, r, &mut visiting)
}

fn initlevel_rec(d: &FlowDict, r: &AbsRVal, visiting: &mut HashSet<Root>) -> InitLevel {
    match r {
        AbsRVal::Zero | AbsRVal::NotZeroAll => InitLevel::AllIL,
        AbsRVal::UnknownR(il) | AbsRVal::Esc(il) => *il,
        AbsRVal::AddressOf(p) => {
            if !visiting.insert(p.root.clone()) {
                return InitLevel::AllIL;
            }
            let il = match lookup_place(d, p) {
                Some(v) => initlevel_rec(d, &v, visiting),
                None => InitLevel::AllIL,
            };
            visiting.remove(&p.root);
            il
        }
        AbsRVal::UniquePtr(v) | AbsRVal::NamedLocation(_, v) => initlevel_rec(d, v, visiting),
        AbsRVal::Consumed { old, .. } => initlevel_rec(d, old, visiting),
        AbsRVal::Aggregate(info, fields) => {
            if info.is_union {
                if let Some(v) = info.fieldnum.and_then(|i| fields.get(i)) {
                    return initlevel_rec(d, v, visiting);
                }
                // Writing any member initializes the storage.
                return fields
                    .iter()
                    .map(|v| initlevel_rec(d, v, visiting))
                    .min()
                    .unwrap_or(InitLevel::AllIL);
            }
            fields
                .iter()
                .map(|v| initlevel_rec(d, v, visiting))
                .max()
                .unwrap_or(InitLevel::AllIL)
        }
    }
}

/// Projects `v` one step. `None` when the shape of `v` says nothing about
/// the component.
pub(crate) fn project(d: &FlowDict, v: &AbsRVal, step: PathCon) -> Option<AbsRVal> {
    match (unname_rval(v), step) {
        (AbsRVal::Aggregate(_, fields), PathCon::Dot(i)) => fields.get(i).cloned(),
        (AbsRVal::UniquePtr(inner), PathCon::Star) => Some((*inner).clone()),
        (AbsRVal::AddressOf(p), PathCon::Star) => lookup_place(d, &p),
        (AbsRVal::UnknownR(il), PathCon::Dot(_)) => Some(AbsRVal::UnknownR(il)),
        (AbsRVal::Esc(il), PathCon::Dot(_)) => Some(AbsRVal::Esc(il)),
        _ => None,
    }
}

pub fn lookup_place(d: &FlowDict, p: &Place) -> Option<AbsRVal> {
    let mut v = d.get(&p.root)?.clone();
    for step in &p.path {
        v = project(d, &v, *step)?;
    }
    Some(v)
}

/// Whether `vd` is tracked and has not escaped.
pub fn is_unescaped(d: &FlowDict, vd: &VarRef) -> bool {
    match d.get(&Root::VarRoot(vd.clone())) {
        Some(AbsRVal::Esc(_)) | None => false,
        Some(_) => true,
    }
}

/// A pointer value known to be non-null and initialized.
pub fn is_init_pointer(r: &AbsRVal) -> bool {
    matches!(
        unname_rval(r),
        AbsRVal::NotZeroAll | AbsRVal::AddressOf(_) | AbsRVal::UniquePtr(_)
    )
}

/// Name of `p` as written in a diagnostic, or `None` for storage that has
/// no source-level name.
pub fn place_err_string(p: &Place) -> Option<String> {
    let Root::VarRoot(vd) = &p.root else {
        return None;
    };
    let mut s = vd.name.name.clone();
    let mut t = vd.ty();
    for step in &p.path {
        match step {
            PathCon::Star => {
                s = format!("*{s}");
                t = crate::tcutil::pointer_elt_type(&t).unwrap_or_else(Type::void);
            }
            PathCon::Dot(i) => {
                let ct = compress(&t);
                let name = match &*ct {
                    Type::Aggr(a) => a
                        .decl()
                        .and_then(|d| d.imp.as_ref().and_then(|imp| imp.fields.get(*i).cloned()))
                        .map(|f| f.name),
                    Type::AnonAggr(_, fs) => fs.get(*i).map(|f| f.name.clone()),
                    _ => None,
                };
                t = aggr_field_types(&ct)
                    .and_then(|fs| fs.get(*i).cloned())
                    .unwrap_or_else(Type::void);
                match name {
                    Some(n) => s = format!("{s}.{n}"),
                    None => s = format!("{s}[{i}]"),
                }
            }
        }
    }
    Some(s)
}

// ---------------------------------------------------------------------------
// printing

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Root::VarRoot(vd) => write!(f, "Root({})", vd.name),
            Root::MallocPt(e, _) => write!(f, "MallocPt({})", e.span.offset()),
            Root::InitParam(i, _) => write!(f, "InitParam({i})"),
        }
    }
}

impl fmt::Display for PathCon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathCon::Dot(i) => write!(f, ".{i}"),
            PathCon::Star => f.write_str("*"),
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root)?;
        for step in &self.path {
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

impl fmt::Display for InitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitLevel::AllIL => "AllIL",
            InitLevel::NoneIL => "NoneIL",
        })
    }
}

impl fmt::Display for AbsRVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbsRVal::Zero => f.write_str("Zero"),
            AbsRVal::NotZeroAll => f.write_str("NotZeroAll"),
            AbsRVal::UnknownR(il) => write!(f, "Unknown({il})"),
            AbsRVal::Esc(il) => write!(f, "Esc({il})"),
            AbsRVal::AddressOf(p) => write!(f, "&{p}"),
            AbsRVal::UniquePtr(v) => write!(f, "Unique({v})"),
            AbsRVal::Aggregate(info, fields) => {
                if info.is_union {
                    match info.fieldnum {
                        Some(i) => write!(f, "union[{i}]")?,
                        None => f.write_str("union")?,
                    }
                }
                f.write_str("{")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("}")
            }
            AbsRVal::Consumed {
                iteration,
                old,
                local_alias,
                ..
            } => {
                let alias = if *local_alias { ",alias" } else { "" };
                write!(f, "Consumed({iteration}{alias},{old})")
            }
            AbsRVal::NamedLocation(vd, v) => write!(f, "Named({},{v})", vd.name),
        }
    }
}

impl fmt::Display for FlowInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowInfo::Bottom => f.write_str("Bottom"),
            FlowInfo::Reachable(d) => {
                let mut entries: Vec<String> =
                    d.iter().map(|(root, v)| format!("{root} => {v}")).collect();
                entries.sort();
                write!(f, "{{{}}}", entries.join("; "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::AggrKind;
    use strata_ast::build::Builder;

    #[test]
    fn struct_values_expand_by_field() {
        let b = Builder::new();
        let ad = b.aggr_decl(
            AggrKind::Struct,
            "pair",
            vec![("a", Type::sint()), ("b", Type::sint())],
        );
        let t = Type::aggr_known(&ad, vec![]);
        let v = typ_to_absrval(&t, &AbsRVal::UnknownR(InitLevel::NoneIL));
        let AbsRVal::Aggregate(info, fields) = &v else {
            panic!("expected an aggregate, got {v}")
        };
        assert!(!info.is_union);
        assert_eq!(fields.len(), 2);
        assert_eq!(get_field_index(&t, "b"), Some(1));
        assert_eq!(initlevel(&HashMap::new(), &v), InitLevel::NoneIL);
    }

    #[test]
    fn initlevel_follows_addresses() {
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let mut d = FlowDict::new();
        d.insert(Root::VarRoot(x.clone()), AbsRVal::UnknownR(InitLevel::NoneIL));
        let addr = AbsRVal::AddressOf(Rc::new(Place::root(Root::VarRoot(x.clone()))));
        assert_eq!(initlevel(&d, &addr), InitLevel::NoneIL);
        d.insert(Root::VarRoot(x), AbsRVal::Zero);
        assert_eq!(initlevel(&d, &addr), InitLevel::AllIL);
        assert!(is_init_pointer(&addr));
    }

    #[test]
    fn escaped_locals_are_not_unescaped() {
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let mut d = FlowDict::new();
        assert!(!is_unescaped(&d, &x));
        d.insert(Root::VarRoot(x.clone()), AbsRVal::NotZeroAll);
        assert!(is_unescaped(&d, &x));
        d.insert(Root::VarRoot(x.clone()), AbsRVal::Esc(InitLevel::AllIL));
        assert!(!is_unescaped(&d, &x));
    }

    #[test]
    fn place_names_use_field_names() {
        let b = Builder::new();
        let ad = b.aggr_decl(
            AggrKind::Struct,
            "pair",
            vec![("a", Type::sint()), ("b", Type::sint())],
        );
        let x = b.vardecl("x", Type::aggr_known(&ad, vec![]), None);
        let p = Place::root(Root::VarRoot(x)).extend(PathCon::Dot(1));
        assert_eq!(place_err_string(&p).as_deref(), Some("x.b"));
        assert_eq!(p.to_string(), "Root(x).1");
    }

    #[test]
    fn flows_print_sorted() {
        let b = Builder::new();
        let x = b.vardecl("x", Type::sint(), None);
        let y = b.vardecl("y", Type::sint(), None);
        let mut f = FlowInfo::empty();
        f.insert(Root::VarRoot(y), AbsRVal::Zero);
        f.insert(Root::VarRoot(x), AbsRVal::Esc(InitLevel::AllIL));
        assert_eq!(f.to_string(), "{Root(x) => Esc(AllIL); Root(y) => Zero}");
        assert_eq!(FlowInfo::Bottom.to_string(), "Bottom");
    }
}
