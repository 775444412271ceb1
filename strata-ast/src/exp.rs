use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::decl::{AggrDecl, DatatypeDecl, DatatypeField, EnumDecl, FnDecl, VarRef};
use crate::stmt::StmtRef;
use crate::types::{Sign, Tvar, Ty};
use crate::{QualName, Span};

pub type ExpRef = Rc<Exp>;
pub type PatRef = Rc<Pat>;

#[derive(Clone, Debug, PartialEq)]
pub enum Cnst {
    Null,
    Char(u8),
    Int(Sign, i64),
    LongLong(Sign, i64),
    Float(String),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Primop {
    Plus,
    Times,
    Minus,
    Div,
    Mod,
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Not,
    Bitnot,
    Bitand,
    Bitor,
    Bitxor,
    Bitlshift,
    Bitrshift,
    Numelts,
}

impl Primop {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Primop::Eq | Primop::Neq | Primop::Gt | Primop::Lt | Primop::Gte | Primop::Lte
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Incrementor {
    PreInc,
    PostInc,
    PreDec,
    PostDec,
}

/// What an identifier resolved to. Function bindings are weak: a recursive
/// function's body refers back to its own declaration.
#[derive(Clone, Debug)]
pub enum Binding {
    Unresolved,
    Global(VarRef),
    Fun(Weak<FnDecl>),
    Param(VarRef),
    Local(VarRef),
    Pat(VarRef),
}

impl Binding {
    pub fn vardecl(&self) -> Option<&VarRef> {
        match self {
            Binding::Global(vd) | Binding::Param(vd) | Binding::Local(vd) | Binding::Pat(vd) => {
                Some(vd)
            }
            Binding::Unresolved | Binding::Fun(_) => None,
        }
    }

    /// Bindings whose storage belongs to the current function.
    pub fn is_local(&self) -> bool {
        matches!(self, Binding::Param(_) | Binding::Local(_) | Binding::Pat(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coercion {
    Unknown,
    NoCoercion,
    /// Nullable to non-null: a run-time check is inserted.
    NullCheck,
    Other,
}

/// Flow-analysis certificate attached to dereferencing expressions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Annot {
    #[default]
    Empty,
    IsZero,
    NotZero,
    UnknownZ,
}

#[derive(Clone, Debug)]
pub struct FieldInit {
    pub field: Option<String>,
    pub exp: ExpRef,
}

#[derive(Clone, Debug)]
pub struct MallocInfo {
    pub is_calloc: bool,
    /// `None` allocates in the heap.
    pub rgn: Option<ExpRef>,
    /// Element type, filled in by the checker from `sizeof(T)`.
    pub elt_type: RefCell<Option<Ty>>,
    pub num_elts: ExpRef,
    pub fat_result: bool,
}

#[derive(Debug)]
pub enum ExpKind {
    Const(Cnst),
    Var(QualName, Binding),
    UnknownId(QualName),
    Primop(Primop, Vec<ExpRef>),
    AssignOp(ExpRef, Option<Primop>, ExpRef),
    Increment(ExpRef, Incrementor),
    Conditional(ExpRef, ExpRef, ExpRef),
    And(ExpRef, ExpRef),
    Or(ExpRef, ExpRef),
    SeqExp(ExpRef, ExpRef),
    UnknownCall(ExpRef, Vec<ExpRef>),
    FnCall(ExpRef, Vec<ExpRef>),
    Throw(ExpRef),
    NoInstantiate(ExpRef),
    Instantiate(ExpRef, Vec<Ty>),
    /// Target type, operand, user-written, inserted coercion.
    Cast(Ty, ExpRef, bool, Coercion),
    Address(ExpRef),
    New(Option<ExpRef>, ExpRef),
    Sizeoftyp(Ty),
    Sizeofexp(ExpRef),
    Deref(ExpRef),
    AggrMember(ExpRef, String),
    AggrArrow(ExpRef, String),
    Subscript(ExpRef, ExpRef),
    Tuple(Vec<ExpRef>),
    Aggregate {
        name: QualName,
        targs: Vec<Ty>,
        fields: Vec<FieldInit>,
        decl: Option<Rc<AggrDecl>>,
    },
    AnonStruct(Ty, Vec<FieldInit>),
    Datatype(Vec<ExpRef>, Rc<DatatypeDecl>, Rc<DatatypeField>),
    Enum(Rc<EnumDecl>, usize),
    AnonEnum(Ty, String),
    Malloc(MallocInfo),
    Swap(ExpRef, ExpRef),
    UnresolvedMem(Option<QualName>, Vec<FieldInit>),
    StmtExp(StmtRef),
    Array(Vec<ExpRef>),
}

#[derive(Debug)]
pub struct Exp {
    pub span: Span,
    pub kind: RefCell<ExpKind>,
    pub ty: RefCell<Option<Ty>>,
    pub annot: RefCell<Annot>,
}

impl Exp {
    pub fn new(kind: ExpKind, span: Span) -> ExpRef {
        Rc::new(Exp {
            span,
            kind: RefCell::new(kind),
            ty: RefCell::new(None),
            annot: RefCell::new(Annot::Empty),
        })
    }

    pub fn typed(kind: ExpKind, span: Span, ty: Ty) -> ExpRef {
        let e = Self::new(kind, span);
        e.set_ty(ty);
        e
    }

    pub fn ty(&self) -> Option<Ty> {
        self.ty.borrow().clone()
    }

    pub fn set_ty(&self, ty: Ty) {
        *self.ty.borrow_mut() = Some(ty);
    }

    pub fn set_annot(&self, annot: Annot) {
        *self.annot.borrow_mut() = annot;
    }

    /// Replaces this node's payload, returning the old one. Used when the
    /// checker rewrites an expression in place (resolution, coercions).
    pub fn replace_kind(&self, kind: ExpKind) -> ExpKind {
        std::mem::replace(&mut *self.kind.borrow_mut(), kind)
    }

    /// The variable named by a plain variable reference, if any.
    pub fn var_binding(&self) -> Option<Binding> {
        match &*self.kind.borrow() {
            ExpKind::Var(_, b) => Some(b.clone()),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum PatKind {
    Wild,
    Var(VarRef),
    /// `alias <'r> T x`: binds `x` as a non-consuming alias in fresh region `'r`.
    Alias(Tvar, VarRef),
    Tuple(Vec<PatRef>),
    Pointer(PatRef),
    Aggr {
        name: Option<QualName>,
        fields: Vec<(Option<String>, PatRef)>,
        decl: Option<Rc<AggrDecl>>,
    },
    Datatype(Rc<DatatypeDecl>, Rc<DatatypeField>, Vec<PatRef>),
    Null,
    Int(Sign, i64),
    Char(u8),
    Float(String),
    Enum(Rc<EnumDecl>, usize),
    AnonEnum(Ty, String),
    UnknownId(QualName),
    UnknownCall(QualName, Vec<PatRef>),
}

#[derive(Debug)]
pub struct Pat {
    pub span: Span,
    pub kind: RefCell<PatKind>,
    pub ty: RefCell<Option<Ty>>,
}

impl Pat {
    pub fn new(kind: PatKind, span: Span) -> PatRef {
        Rc::new(Pat {
            span,
            kind: RefCell::new(kind),
            ty: RefCell::new(None),
        })
    }

    pub fn ty(&self) -> Option<Ty> {
        self.ty.borrow().clone()
    }
}
