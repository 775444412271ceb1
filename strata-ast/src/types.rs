use std::cell::RefCell;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

use crate::conref::Conref;
use crate::decl::{
    AggrDecl, AggrField, AggrKind, DatatypeDecl, DatatypeField, EnumDecl, EnumField, TypedefDecl,
};
use crate::exp::ExpRef;
use crate::{fresh_identity, QualName};

pub type Ty = Rc<Type>;

/// Kinds classify types by how their values may be stored.
///
/// `Box` ⊂ `Mem` ⊂ `Any`; the remaining kinds only relate to themselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Any type, including abstract ones of unknown size.
    Any,
    /// Types with a known size.
    Mem,
    /// Word-sized values (thin pointers, `int`).
    Box,
    /// Regions.
    Rgn,
    /// Effects (sets of regions).
    Eff,
    /// Compile-time integers (array bounds).
    Int,
}

impl Kind {
    pub fn leq(self, other: Kind) -> bool {
        use Kind::*;
        self == other
            || matches!(
                (self, other),
                (Box, Mem) | (Box, Any) | (Mem, Any)
            )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KindBound {
    Eq(Kind),
    Unknown,
    /// Known to be at most the given kind; refined by checking.
    Less(Kind),
}

/// A type variable. Two tvars are the same variable iff their identities
/// match; the kind is deliberately ignored by equality and hashing.
#[derive(Clone, Debug)]
pub struct Tvar {
    pub name: Rc<str>,
    pub identity: u32,
    pub kind: Rc<RefCell<KindBound>>,
}

impl Tvar {
    pub fn new(name: impl Into<Rc<str>>, kind: Kind) -> Self {
        Self::with_bound(name, KindBound::Eq(kind))
    }

    pub fn with_bound(name: impl Into<Rc<str>>, bound: KindBound) -> Self {
        Self {
            name: name.into(),
            identity: fresh_identity(),
            kind: Rc::new(RefCell::new(bound)),
        }
    }

    /// A fresh variable with a generated name, used for alpha-renaming and
    /// for regions introduced by the checker itself.
    pub fn fresh(kind: Kind) -> Self {
        let identity = fresh_identity();
        Self {
            name: format!("`t{identity}").into(),
            identity,
            kind: Rc::new(RefCell::new(KindBound::Eq(kind))),
        }
    }

    pub fn kind(&self) -> Option<Kind> {
        match &*self.kind.borrow() {
            KindBound::Eq(k) => Some(*k),
            KindBound::Unknown | KindBound::Less(_) => None,
        }
    }

    pub fn bound(&self) -> KindBound {
        self.kind.borrow().clone()
    }

    pub fn same(&self, other: &Tvar) -> bool {
        self.identity == other.identity
    }
}

impl PartialEq for Tvar {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Tvar {}

impl Hash for Tvar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

/// Unification variable. `resolved` is written at most once per
/// successful unification (and reset only by unification rollback).
#[derive(Debug)]
pub struct Evar {
    pub id: u32,
    pub kind: RefCell<Option<Kind>>,
    pub resolved: RefCell<Option<Ty>>,
    /// Type variables the resolution may mention; `None` means unrestricted.
    pub deps: RefCell<Option<Vec<Tvar>>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Tqual {
    pub is_const: bool,
    pub is_volatile: bool,
    pub is_restrict: bool,
}

impl Tqual {
    pub fn constant() -> Self {
        Self {
            is_const: true,
            ..Self::default()
        }
    }

    /// `self` may be used where `other` is expected (qualifiers only grow).
    pub fn leq(self, other: Tqual) -> bool {
        (!self.is_const || other.is_const)
            && (!self.is_volatile || other.is_volatile)
            && (!self.is_restrict || other.is_restrict)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Sign {
    Signed,
    Unsigned,
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntSize {
    Char,
    Short,
    Int,
    Long,
    LongLong,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FloatKind {
    Float,
    Double,
    LongDouble,
}

/// Pointer bounds: `Fat` pointers carry their length at run time,
/// `Upper(n)` pointers are statically known to point at `n` elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bounds {
    Fat,
    Upper(u64),
}

#[derive(Clone, Debug)]
pub struct PtrAtts {
    pub rgn: Ty,
    pub nullable: Conref<bool>,
    pub bounds: Conref<Bounds>,
    pub zero_term: Conref<bool>,
}

#[derive(Clone, Debug)]
pub struct PtrInfo {
    pub elt: Ty,
    pub elt_tq: Tqual,
    pub atts: PtrAtts,
}

#[derive(Clone, Debug)]
pub struct ArrayInfo {
    pub elt: Ty,
    pub tq: Tqual,
    pub num_elts: Option<ExpRef>,
    pub zero_term: Conref<bool>,
}

#[derive(Clone, Debug)]
pub struct FnArg {
    pub name: Option<String>,
    pub tq: Tqual,
    pub ty: Ty,
}

/// Typed `...` varargs: all extra arguments share one type.
#[derive(Clone, Debug)]
pub struct VarargInfo {
    pub name: Option<String>,
    pub tq: Tqual,
    pub ty: Ty,
    pub inject: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FnAttr {
    Noreturn,
    Const,
    Pure,
    /// The (0-based) pointer argument is not consumed by the call.
    Noconsume(usize),
    /// The callee initializes the memory behind the (0-based) pointer argument.
    Initializes(usize),
}

#[derive(Clone, Debug)]
pub struct FnInfo {
    pub tvars: Vec<Tvar>,
    /// Filled in with the default effect by well-formedness checking.
    pub effect: RefCell<Option<Ty>>,
    pub ret_tq: Tqual,
    pub ret: Ty,
    pub args: Vec<FnArg>,
    pub c_varargs: bool,
    pub cyc_varargs: Option<VarargInfo>,
    /// `(effect, region)` pairs: the effect outlives the region.
    pub rgn_po: Vec<(Ty, Ty)>,
    pub attributes: Vec<FnAttr>,
}

impl FnInfo {
    pub fn has_attr(&self, attr: FnAttr) -> bool {
        self.attributes.contains(&attr)
    }
}

#[derive(Clone, Debug)]
pub enum AggrRef {
    Unknown(AggrKind, QualName),
    Known(Weak<AggrDecl>),
}

#[derive(Debug)]
pub struct AggrInfo {
    pub aggr: RefCell<AggrRef>,
    pub targs: Vec<Ty>,
}

impl AggrInfo {
    pub fn decl(&self) -> Option<Rc<AggrDecl>> {
        match &*self.aggr.borrow() {
            AggrRef::Known(w) => w.upgrade(),
            AggrRef::Unknown(..) => None,
        }
    }

    pub fn kind_and_name(&self) -> (AggrKind, QualName) {
        match &*self.aggr.borrow() {
            AggrRef::Unknown(k, n) => (*k, n.clone()),
            AggrRef::Known(w) => match w.upgrade() {
                Some(d) => (d.kind, d.name.clone()),
                None => (AggrKind::Struct, QualName::local("<dropped>")),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub enum DatatypeRef {
    Unknown { name: QualName, is_extensible: bool },
    Known(Weak<DatatypeDecl>),
}

#[derive(Debug)]
pub struct DatatypeInfo {
    pub dt: RefCell<DatatypeRef>,
    pub targs: Vec<Ty>,
}

impl DatatypeInfo {
    pub fn decl(&self) -> Option<Rc<DatatypeDecl>> {
        match &*self.dt.borrow() {
            DatatypeRef::Known(w) => w.upgrade(),
            DatatypeRef::Unknown { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub enum DatatypeFieldRef {
    Unknown { dt_name: QualName, field_name: QualName },
    Known(Weak<DatatypeDecl>, Rc<DatatypeField>),
}

#[derive(Debug)]
pub struct DatatypeFieldInfo {
    pub field: RefCell<DatatypeFieldRef>,
    pub targs: Vec<Ty>,
}

#[derive(Debug)]
pub struct TypedefInfo {
    pub name: QualName,
    pub args: Vec<Ty>,
    pub decl: RefCell<Option<Rc<TypedefDecl>>>,
    pub expanded: RefCell<Option<Ty>>,
}

#[derive(Debug)]
pub enum Type {
    Void,
    Evar(Rc<Evar>),
    Var(Tvar),
    Pointer(PtrInfo),
    Int(Sign, IntSize),
    Float(FloatKind),
    Array(ArrayInfo),
    Fn(FnInfo),
    Tuple(Vec<(Tqual, Ty)>),
    Aggr(AggrInfo),
    AnonAggr(AggrKind, Vec<AggrField>),
    Enum(QualName, RefCell<Option<Rc<EnumDecl>>>),
    AnonEnum(Vec<EnumField>),
    Datatype(DatatypeInfo),
    DatatypeField(DatatypeFieldInfo),
    RgnHandle(Ty),
    HeapRgn,
    UniqueRgn,
    AccessEff(Ty),
    JoinEff(Vec<Ty>),
    RgnsEff(Ty),
    Typedef(TypedefInfo),
}

impl Type {
    pub fn void() -> Ty {
        Rc::new(Type::Void)
    }

    pub fn int(sign: Sign, size: IntSize) -> Ty {
        Rc::new(Type::Int(sign, size))
    }

    pub fn sint() -> Ty {
        Self::int(Sign::Signed, IntSize::Int)
    }

    pub fn uint() -> Ty {
        Self::int(Sign::Unsigned, IntSize::Int)
    }

    pub fn char() -> Ty {
        Self::int(Sign::None, IntSize::Char)
    }

    pub fn float(kind: FloatKind) -> Ty {
        Rc::new(Type::Float(kind))
    }

    pub fn heap_rgn() -> Ty {
        Rc::new(Type::HeapRgn)
    }

    pub fn unique_rgn() -> Ty {
        Rc::new(Type::UniqueRgn)
    }

    pub fn var(tv: &Tvar) -> Ty {
        Rc::new(Type::Var(tv.clone()))
    }

    pub fn rgn_handle(rgn: Ty) -> Ty {
        Rc::new(Type::RgnHandle(rgn))
    }

    pub fn access_eff(rgn: Ty) -> Ty {
        Rc::new(Type::AccessEff(rgn))
    }

    pub fn join_eff(effs: Vec<Ty>) -> Ty {
        Rc::new(Type::JoinEff(effs))
    }

    pub fn rgns_eff(t: Ty) -> Ty {
        Rc::new(Type::RgnsEff(t))
    }

    pub fn evar(kind: Option<Kind>, deps: Option<Vec<Tvar>>) -> Ty {
        Rc::new(Type::Evar(Rc::new(Evar {
            id: fresh_identity(),
            kind: RefCell::new(kind),
            resolved: RefCell::new(None),
            deps: RefCell::new(deps),
        })))
    }

    /// Pointer type builder: element type, region, element qualifiers,
    /// nullability, bounds and zero termination.
    pub fn pointer(
        elt: Ty,
        rgn: Ty,
        elt_tq: Tqual,
        nullable: Conref<bool>,
        bounds: Conref<Bounds>,
        zero_term: Conref<bool>,
    ) -> Ty {
        Rc::new(Type::Pointer(PtrInfo {
            elt,
            elt_tq,
            atts: PtrAtts {
                rgn,
                nullable,
                bounds,
                zero_term,
            },
        }))
    }

    /// `T *r`: nullable, thin, not zero-terminated.
    pub fn star(elt: Ty, rgn: Ty) -> Ty {
        Self::pointer(
            elt,
            rgn,
            Tqual::default(),
            Conref::eq(true),
            Conref::eq(Bounds::Upper(1)),
            Conref::eq(false),
        )
    }

    /// `T @r`: never null, thin, not zero-terminated.
    pub fn at(elt: Ty, rgn: Ty) -> Ty {
        Self::pointer(
            elt,
            rgn,
            Tqual::default(),
            Conref::eq(false),
            Conref::eq(Bounds::Upper(1)),
            Conref::eq(false),
        )
    }

    /// `T ?r`: nullable fat pointer.
    pub fn fat(elt: Ty, rgn: Ty) -> Ty {
        Self::pointer(
            elt,
            rgn,
            Tqual::default(),
            Conref::eq(true),
            Conref::eq(Bounds::Fat),
            Conref::eq(false),
        )
    }

    pub fn aggr_unknown(kind: AggrKind, name: QualName, targs: Vec<Ty>) -> Ty {
        Rc::new(Type::Aggr(AggrInfo {
            aggr: RefCell::new(AggrRef::Unknown(kind, name)),
            targs,
        }))
    }

    pub fn aggr_known(decl: &Rc<AggrDecl>, targs: Vec<Ty>) -> Ty {
        Rc::new(Type::Aggr(AggrInfo {
            aggr: RefCell::new(AggrRef::Known(Rc::downgrade(decl))),
            targs,
        }))
    }

    pub fn datatype_known(decl: &Rc<DatatypeDecl>, targs: Vec<Ty>) -> Ty {
        Rc::new(Type::Datatype(DatatypeInfo {
            dt: RefCell::new(DatatypeRef::Known(Rc::downgrade(decl))),
            targs,
        }))
    }

    pub fn datatype_field_known(
        decl: &Rc<DatatypeDecl>,
        field: &Rc<DatatypeField>,
        targs: Vec<Ty>,
    ) -> Ty {
        Rc::new(Type::DatatypeField(DatatypeFieldInfo {
            field: RefCell::new(DatatypeFieldRef::Known(Rc::downgrade(decl), field.clone())),
            targs,
        }))
    }

    pub fn enum_known(decl: &Rc<EnumDecl>) -> Ty {
        Rc::new(Type::Enum(decl.name.clone(), RefCell::new(Some(decl.clone()))))
    }

    pub fn typedef(name: QualName, args: Vec<Ty>) -> Ty {
        Rc::new(Type::Typedef(TypedefInfo {
            name,
            args,
            decl: RefCell::new(None),
            expanded: RefCell::new(None),
        }))
    }

    pub fn tuple(fields: Vec<Ty>) -> Ty {
        Rc::new(Type::Tuple(
            fields.into_iter().map(|t| (Tqual::default(), t)).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_form_a_chain_below_any() {
        assert!(Kind::Box.leq(Kind::Mem));
        assert!(Kind::Mem.leq(Kind::Any));
        assert!(Kind::Box.leq(Kind::Any));
        assert!(!Kind::Any.leq(Kind::Mem));
        assert!(!Kind::Rgn.leq(Kind::Any));
        assert!(Kind::Eff.leq(Kind::Eff));
    }

    #[test]
    fn tvar_equality_ignores_kind() {
        let a = Tvar::new("a", Kind::Box);
        let same = Tvar {
            kind: Rc::new(RefCell::new(KindBound::Eq(Kind::Any))),
            ..a.clone()
        };
        assert_eq!(a, same);
        assert_ne!(a, Tvar::new("a", Kind::Box));
    }
}
