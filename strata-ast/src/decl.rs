use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::exp::{ExpRef, PatRef};
use crate::stmt::StmtRef;
use crate::types::{FnArg, FnAttr, Kind, Tqual, Tvar, Ty, VarargInfo};
use crate::{QualName, Span};

pub type DeclRef = Rc<Decl>;
pub type VarRef = Rc<VarDecl>;
pub type FnRef = Rc<FnDecl>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Scope {
    Static,
    Abstract,
    #[default]
    Public,
    Extern,
    ExternC,
}

#[derive(Debug)]
pub struct VarDecl {
    pub span: Span,
    pub sc: Scope,
    pub name: QualName,
    pub tq: Tqual,
    /// Pattern variables start as evars and are fixed by pattern checking.
    pub ty: RefCell<Ty>,
    pub initializer: Option<ExpRef>,
    /// Region the variable lives in, set when the declaration is checked.
    pub rgn: RefCell<Option<Ty>>,
    /// Set once the variable's address has been taken.
    pub escapes: Cell<bool>,
}

impl VarDecl {
    pub fn new(span: Span, name: QualName, ty: Ty, initializer: Option<ExpRef>) -> VarRef {
        Rc::new(VarDecl {
            span,
            sc: Scope::Public,
            name,
            tq: Tqual::default(),
            ty: RefCell::new(ty),
            initializer,
            rgn: RefCell::new(None),
            escapes: Cell::new(false),
        })
    }

    pub fn ty(&self) -> Ty {
        self.ty.borrow().clone()
    }
}

#[derive(Debug)]
pub struct FnDecl {
    pub span: Span,
    pub sc: Scope,
    pub is_inline: bool,
    pub name: QualName,
    pub tvars: Vec<Tvar>,
    pub effect: RefCell<Option<Ty>>,
    pub ret_tq: Tqual,
    pub ret: Ty,
    pub args: Vec<FnArg>,
    pub c_varargs: bool,
    pub cyc_varargs: Option<VarargInfo>,
    pub rgn_po: Vec<(Ty, Ty)>,
    pub body: StmtRef,
    pub attributes: Vec<FnAttr>,
    /// Parameter declarations created by the checker, in argument order.
    pub param_vardecls: RefCell<Option<Vec<VarRef>>>,
    /// The function's type, filled in by the checker.
    pub fn_ty: RefCell<Option<Ty>>,
}

impl FnDecl {
    pub fn has_attr(&self, attr: FnAttr) -> bool {
        self.attributes.contains(&attr)
    }

    pub fn fn_ty(&self) -> Option<Ty> {
        self.fn_ty.borrow().clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AggrKind {
    Struct,
    Union,
}

#[derive(Clone, Debug)]
pub struct AggrField {
    pub name: String,
    pub tq: Tqual,
    pub ty: Ty,
    pub width: Option<ExpRef>,
}

#[derive(Clone, Debug)]
pub struct AggrDeclImpl {
    pub exist_vars: Vec<Tvar>,
    pub rgn_po: Vec<(Ty, Ty)>,
    pub fields: Vec<AggrField>,
    pub tagged: bool,
}

#[derive(Debug)]
pub struct AggrDecl {
    pub span: Span,
    pub kind: AggrKind,
    pub sc: Scope,
    pub name: QualName,
    pub tvars: Vec<Tvar>,
    /// `None` for abstract (forward-declared) aggregates.
    pub imp: Option<AggrDeclImpl>,
}

impl AggrDecl {
    pub fn field(&self, name: &str) -> Option<(usize, &AggrField)> {
        self.imp
            .as_ref()?
            .fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }
}

#[derive(Debug)]
pub struct DatatypeField {
    pub span: Span,
    pub name: QualName,
    pub typs: Vec<(Tqual, Ty)>,
    pub sc: Scope,
}

#[derive(Debug)]
pub struct DatatypeDecl {
    pub span: Span,
    pub sc: Scope,
    pub name: QualName,
    pub tvars: Vec<Tvar>,
    pub fields: Option<Vec<Rc<DatatypeField>>>,
    pub is_extensible: bool,
}

#[derive(Clone, Debug)]
pub struct EnumField {
    pub span: Span,
    pub name: QualName,
    pub tag: Option<ExpRef>,
}

#[derive(Debug)]
pub struct EnumDecl {
    pub span: Span,
    pub sc: Scope,
    pub name: QualName,
    pub fields: Option<Vec<EnumField>>,
}

#[derive(Debug)]
pub struct TypedefDecl {
    pub span: Span,
    pub name: QualName,
    pub tq: Tqual,
    pub tvars: Vec<Tvar>,
    /// `None` for an abstract typedef of the given kind.
    pub defn: Option<Ty>,
    pub kind: Option<Kind>,
}

#[derive(Debug)]
pub enum DeclKind {
    Var(VarRef),
    Fn(FnRef),
    Let {
        pat: PatRef,
        pat_vars: RefCell<Option<Vec<VarRef>>>,
        init: ExpRef,
    },
    Aggr(Rc<AggrDecl>),
    Datatype(Rc<DatatypeDecl>),
    Enum(Rc<EnumDecl>),
    Typedef(Rc<TypedefDecl>),
    Namespace(String, Vec<DeclRef>),
    Using(QualName, Vec<DeclRef>),
}

#[derive(Debug)]
pub struct Decl {
    pub span: Span,
    pub kind: DeclKind,
}

impl Decl {
    pub fn new(kind: DeclKind, span: Span) -> DeclRef {
        Rc::new(Decl { span, kind })
    }
}
