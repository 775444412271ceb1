//! Type environments.
//!
//! `Tenv` values are persistent: entering a scope, binding a variable,
//! opening a region or a loop returns a new environment and leaves the old
//! one untouched, so leaving a scope is just dropping the extended value.
//! The global tables are shared between all environments of a run and only
//! grow while top-level declarations are processed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use strata_ast::{
    AggrDecl, Binding, DatatypeDecl, DatatypeField, EnumDecl, FnDecl, Kind, Nmspace, QualName,
    Span, StmtRef, Tvar, Ty, Type, TypedefDecl, VarDecl, VarRef, dummy_span,
};

use crate::ctx::Ctx;
use crate::error::{ErrorKind, impos};
use crate::rgnorder::{RgnPO, pin};
use crate::tcutil::{compress, normalize_effect, typecmp};

/// What an ordinary identifier denotes.
#[derive(Clone, Debug)]
pub enum Resolved {
    Var(Binding),
    Aggr(Rc<AggrDecl>),
    Datatype(Rc<DatatypeDecl>, Rc<DatatypeField>),
    Enum(Rc<EnumDecl>, usize),
    AnonEnum(Ty, usize),
}

/// Declarations of one namespace.
#[derive(Debug, Default)]
pub struct Genv {
    pub aggrdecls: RefCell<HashMap<String, Rc<AggrDecl>>>,
    pub datatypedecls: RefCell<HashMap<String, Rc<DatatypeDecl>>>,
    pub enumdecls: RefCell<HashMap<String, Rc<EnumDecl>>>,
    pub typedefs: RefCell<HashMap<String, Rc<TypedefDecl>>>,
    /// Identifier, resolution and whether it has been referred to.
    pub ordinaries: RefCell<HashMap<String, (Resolved, Rc<Cell<bool>>)>>,
}

pub type GenvRef = Rc<Genv>;

impl Genv {
    pub fn add_ordinary(&self, name: &str, r: Resolved) {
        self.ordinaries
            .borrow_mut()
            .insert(name.to_string(), (r, Rc::new(Cell::new(false))));
    }
}

/// Per-function state shared by every environment inside one body.
#[derive(Debug)]
pub struct SharedFenv {
    pub fd_name: QualName,
    pub return_typ: Ty,
    seen_labels: RefCell<HashMap<String, StmtRef>>,
    /// `goto` statements waiting for their label.
    needed_labels: RefCell<Vec<(String, StmtRef)>>,
    /// Effect checks postponed until evars are resolved: capability,
    /// required effect, order, location.
    delayed_effects: RefCell<Vec<(Ty, Ty, RgnPO, Span)>>,
    delayed_constraints: RefCell<Vec<(RgnPO, Vec<(Ty, Ty)>, Span)>>,
}

#[derive(Clone, Debug, Default)]
struct CtrlEnv {
    break_target: Option<StmtRef>,
    continue_target: Option<StmtRef>,
    /// Body of the next switch clause and the variables its pattern binds.
    fallthru: Option<(StmtRef, Vec<VarRef>)>,
    try_depth: u32,
}

#[derive(Clone, Debug)]
pub struct Fenv {
    pub shared: Rc<SharedFenv>,
    pub type_vars: Vec<Tvar>,
    pub region_order: RgnPO,
    locals: HashMap<String, Binding>,
    ctrl: CtrlEnv,
    pub capability: Ty,
    pub curr_rgn: Ty,
    pub fn_rgn: Tvar,
}

/// A `using` in effect: the namespace it was written in and the absolute
/// path it opens. Newest first.
#[derive(Debug)]
struct Using {
    at: Vec<String>,
    path: Vec<String>,
    next: Option<Rc<Using>>,
}

#[derive(Clone, Debug)]
pub struct Tenv {
    pub ns: Vec<String>,
    ae: Rc<RefCell<HashMap<Vec<String>, GenvRef>>>,
    usings: Option<Rc<Using>>,
    pub le: Option<Rc<Fenv>>,
}

impl Tenv {
    /// The top-level environment with the builtin region handles declared.
    pub fn new() -> Tenv {
        let root: GenvRef = Rc::default();
        let builtins = [
            ("heap_region", Type::heap_rgn()),
            ("unique_region", Type::unique_rgn()),
        ];
        for (name, rgn) in builtins {
            let vd = VarDecl::new(
                dummy_span(),
                QualName::abs(Vec::new(), name),
                Type::rgn_handle(rgn),
                None,
            );
            root.add_ordinary(name, Resolved::Var(Binding::Global(vd)));
        }
        let mut ae = HashMap::new();
        ae.insert(Vec::new(), root);
        Tenv {
            ns: Vec::new(),
            ae: Rc::new(RefCell::new(ae)),
            usings: None,
            le: None,
        }
    }

    fn genv_at(&self, path: &[String]) -> Option<GenvRef> {
        self.ae.borrow().get(path).cloned()
    }

    pub fn current_genv(&self) -> GenvRef {
        match self.genv_at(&self.ns) {
            Some(g) => g,
            None => impos(format!("namespace {:?} has no global environment", self.ns)),
        }
    }

    pub fn enter_ns(&self, name: &str) -> Tenv {
        let mut ns = self.ns.clone();
        ns.push(name.to_string());
        self.ae.borrow_mut().entry(ns.clone()).or_default();
        Tenv {
            ns,
            ..self.clone()
        }
    }

    /// Resolves the namespace named by a `using` declaration to an absolute
    /// path.
    pub fn resolve_namespace(&self, q: &QualName) -> Option<Vec<String>> {
        let mut rel = match &q.ns {
            Nmspace::Abs(p) => {
                let mut p = p.clone();
                p.push(q.name.clone());
                return self.genv_at(&p).map(|_| p);
            }
            Nmspace::Loc => Vec::new(),
            Nmspace::Rel(p) => p.clone(),
        };
        rel.push(q.name.clone());
        (0..=self.ns.len()).rev().find_map(|i| {
            let mut cand = self.ns[..i].to_vec();
            cand.extend(rel.iter().cloned());
            self.genv_at(&cand).map(|_| cand)
        })
    }

    /// Opens the namespace at `path` for the current namespace.
    pub fn add_using(&self, path: Vec<String>) -> Tenv {
        Tenv {
            usings: Some(Rc::new(Using {
                at: self.ns.clone(),
                path,
                next: self.usings.clone(),
            })),
            ..self.clone()
        }
    }

    fn usings_at<'a>(&'a self, base: &'a [String]) -> impl Iterator<Item = &'a [String]> + 'a {
        std::iter::successors(self.usings.as_deref(), |u| u.next.as_deref())
            .filter(move |u| u.at == base)
            .map(|u| u.path.as_slice())
    }

    /// Namespaces searched for `q`, in order: the current namespace and its
    /// `using` list, each enclosing namespace likewise, then the root.
    fn candidates(&self, q: &QualName) -> Vec<Vec<String>> {
        let rel = match &q.ns {
            Nmspace::Abs(p) => return vec![p.clone()],
            Nmspace::Loc => Vec::new(),
            Nmspace::Rel(p) => p.clone(),
        };
        let mut out = Vec::new();
        for i in (0..=self.ns.len()).rev() {
            let base = &self.ns[..i];
            let mut here = base.to_vec();
            here.extend(rel.iter().cloned());
            out.push(here);
            for using in self.usings_at(base) {
                let mut p = using.to_vec();
                p.extend(rel.iter().cloned());
                out.push(p);
            }
        }
        out
    }

    fn lookup_global<T>(
        &self,
        q: &QualName,
        get: impl Fn(&Genv, &str) -> Option<T>,
    ) -> Option<(Vec<String>, T)> {
        self.candidates(q).into_iter().find_map(|path| {
            let g = self.genv_at(&path)?;
            get(&g, &q.name).map(|t| (path, t))
        })
    }

    /// Resolves an identifier and marks the entry used.
    pub fn lookup_ordinary(&self, q: &QualName) -> Option<Resolved> {
        if q.is_local() {
            if let Some(b) = self.le.as_ref().and_then(|le| le.locals.get(&q.name)) {
                return Some(Resolved::Var(b.clone()));
            }
        }
        let (_, (r, used)) = self.lookup_global(q, |g, n| g.ordinaries.borrow().get(n).cloned())?;
        used.set(true);
        Some(r)
    }

    pub fn lookup_aggrdecl(&self, q: &QualName) -> Option<Rc<AggrDecl>> {
        self.lookup_global(q, |g, n| g.aggrdecls.borrow().get(n).cloned())
            .map(|(_, d)| d)
    }

    pub fn lookup_datatypedecl(&self, q: &QualName) -> Option<Rc<DatatypeDecl>> {
        self.lookup_global(q, |g, n| g.datatypedecls.borrow().get(n).cloned())
            .map(|(_, d)| d)
    }

    pub fn lookup_enumdecl(&self, q: &QualName) -> Option<Rc<EnumDecl>> {
        self.lookup_global(q, |g, n| g.enumdecls.borrow().get(n).cloned())
            .map(|(_, d)| d)
    }

    pub fn lookup_typedefdecl(&self, q: &QualName) -> Option<Rc<TypedefDecl>> {
        self.lookup_global(q, |g, n| g.typedefs.borrow().get(n).cloned())
            .map(|(_, d)| d)
    }

    /// Static functions of the current namespace that were never referred to.
    pub fn unused_statics(&self) -> Vec<Rc<FnDecl>> {
        let g = self.current_genv();
        let ords = g.ordinaries.borrow();
        let mut out: Vec<Rc<FnDecl>> = ords
            .values()
            .filter(|(_, used)| !used.get())
            .filter_map(|(r, _)| match r {
                Resolved::Var(Binding::Fun(w)) => w.upgrade(),
                _ => None,
            })
            .filter(|fd| fd.sc == strata_ast::Scope::Static)
            .collect();
        out.sort_by_key(|fd| fd.span.offset());
        out
    }

    // -------------------------------------------------------------------
    // function environments

    pub fn fenv(&self) -> &Fenv {
        match &self.le {
            Some(le) => le,
            None => impos("function environment requested outside a function"),
        }
    }

    fn with_fenv(&self, f: impl FnOnce(&mut Fenv)) -> Tenv {
        let mut le = self.fenv().clone();
        f(&mut le);
        Tenv {
            le: Some(Rc::new(le)),
            ..self.clone()
        }
    }

    /// Environment for checking the body of `fd`, whose effect has already
    /// been defaulted. Parameters live in the function's own region.
    pub fn new_fenv(&self, ctx: &Ctx, fd: &FnDecl, effect: &Ty, params: &[VarRef]) -> Tenv {
        let fn_rgn = Tvar::new(format!("`{}", fd.name.name), Kind::Rgn);
        let region_order = match RgnPO::initial_fn_po(&fd.tvars, &fd.rgn_po, effect, &fn_rgn) {
            Ok(po) => po,
            Err(e) => {
                ctx.error(ErrorKind::Region, fd.span, e.to_string());
                RgnPO::initial_fn_po(&fd.tvars, &[], effect, &fn_rgn)
                    .unwrap_or_else(|e| impos(e))
            }
        };
        let mut locals = HashMap::new();
        for vd in params {
            *vd.rgn.borrow_mut() = Some(Type::var(&fn_rgn));
            locals.insert(vd.name.name.clone(), Binding::Param(vd.clone()));
        }
        let mut type_vars = fd.tvars.clone();
        type_vars.push(fn_rgn.clone());
        let capability = Type::join_eff(vec![Type::access_eff(Type::var(&fn_rgn)), effect.clone()]);
        let shared = Rc::new(SharedFenv {
            fd_name: fd.name.clone(),
            return_typ: fd.ret.clone(),
            seen_labels: RefCell::new(HashMap::new()),
            needed_labels: RefCell::new(Vec::new()),
            delayed_effects: RefCell::new(Vec::new()),
            delayed_constraints: RefCell::new(Vec::new()),
        });
        tracing::debug!(function = %fd.name, po = %region_order, "entering function");
        Tenv {
            le: Some(Rc::new(Fenv {
                shared,
                type_vars,
                region_order,
                locals,
                ctrl: CtrlEnv::default(),
                capability,
                curr_rgn: Type::var(&fn_rgn),
                fn_rgn,
            })),
            ..self.clone()
        }
    }

    pub fn in_function(&self) -> bool {
        self.le.is_some()
    }

    pub fn return_typ(&self) -> Ty {
        self.fenv().shared.return_typ.clone()
    }

    pub fn add_local_var(&self, vd: &VarRef) -> Tenv {
        self.add_binding(vd, Binding::Local(vd.clone()))
    }

    pub fn add_pat_var(&self, vd: &VarRef) -> Tenv {
        self.add_binding(vd, Binding::Pat(vd.clone()))
    }

    fn add_binding(&self, vd: &VarRef, b: Binding) -> Tenv {
        let rgn = self.curr_rgn();
        *vd.rgn.borrow_mut() = Some(rgn);
        self.with_fenv(|le| {
            le.locals.insert(vd.name.name.clone(), b);
        })
    }

    pub fn add_type_vars(&self, tvs: &[Tvar]) -> Tenv {
        if tvs.is_empty() || self.le.is_none() {
            return self.clone();
        }
        self.with_fenv(|le| {
            for tv in tvs {
                if !le.type_vars.contains(tv) {
                    le.type_vars.push(tv.clone());
                }
            }
        })
    }

    pub fn lookup_type_vars(&self) -> Vec<Tvar> {
        self.le
            .as_ref()
            .map(|le| le.type_vars.clone())
            .unwrap_or_default()
    }

    /// Opens `region<tv> h { ... }`: `tv` becomes the youngest region, is
    /// accessible, and new locals live in it.
    pub fn new_named_block(&self, tv: &Tvar, resetable: bool) -> Tenv {
        self.with_fenv(|le| {
            le.type_vars.push(tv.clone());
            le.region_order = le.region_order.add_youngest(tv, resetable);
            le.capability = Type::join_eff(vec![
                Type::access_eff(Type::var(tv)),
                le.capability.clone(),
            ]);
            le.curr_rgn = Type::var(tv);
        })
    }

    /// Adds a region unrelated to the others (the region of an alias
    /// pattern). It is accessible but locals do not move into it.
    pub fn add_region(&self, tv: &Tvar) -> Tenv {
        self.with_fenv(|le| {
            le.type_vars.push(tv.clone());
            le.region_order = le.region_order.add_unordered(tv);
            le.capability = Type::join_eff(vec![
                Type::access_eff(Type::var(tv)),
                le.capability.clone(),
            ]);
        })
    }

    pub fn curr_rgn(&self) -> Ty {
        match &self.le {
            Some(le) => le.curr_rgn.clone(),
            None => Type::heap_rgn(),
        }
    }

    /// The region function parameters live in.
    pub fn parameter_rgn(&self) -> Ty {
        Type::var(&self.fenv().fn_rgn)
    }

    pub fn region_outlives(&self, r1: &Ty, r2: &Ty) -> bool {
        match &self.le {
            Some(le) => le.region_order.rgn_outlives_rgn(r1, r2),
            None => matches!(&*compress(r1), Type::HeapRgn) || typecmp(r1, r2),
        }
    }

    fn region_accessible(&self, rgn: &Ty) -> bool {
        let rgn = compress(rgn);
        if matches!(&*rgn, Type::HeapRgn | Type::UniqueRgn) {
            return true;
        }
        let Some(le) = &self.le else { return false };
        // A region is live if it outlives a region we may access.
        normalize_effect(&le.capability).iter().any(|atom| match &**atom {
            Type::AccessEff(r) => le.region_order.rgn_outlives_rgn(&rgn, r),
            _ => false,
        })
    }

    fn effect_accessible(&self, atom: &Ty) -> bool {
        match &**atom {
            Type::AccessEff(r) => self.region_accessible(r),
            _ => match &self.le {
                Some(le) => normalize_effect(&le.capability)
                    .iter()
                    .any(|cap| typecmp(cap, atom)),
                None => false,
            },
        }
    }

    pub fn check_rgn_accessible(&self, ctx: &Ctx, span: Span, rgn: &Ty) {
        self.check_effect_accessible(ctx, span, &Type::access_eff(rgn.clone()));
    }

    /// Reports an error unless every region in `eff` is accessible here.
    /// Checks involving unresolved evars are postponed to the end of the
    /// function.
    pub fn check_effect_accessible(&self, ctx: &Ctx, span: Span, eff: &Ty) {
        let Some(le) = &self.le else { return };
        for atom in normalize_effect(eff) {
            if self.effect_accessible(&atom) {
                continue;
            }
            if has_evar(&atom) {
                le.shared.delayed_effects.borrow_mut().push((
                    le.capability.clone(),
                    atom,
                    le.region_order.clone(),
                    span,
                ));
                continue;
            }
            ctx.error(
                ErrorKind::Region,
                span,
                format!("expression accesses unavailable region {}", effect_region_name(&atom)),
            );
        }
    }

    /// Checks a callee's `(effect, region)` constraints against the current
    /// order.
    pub fn check_rgn_partial_order(&self, ctx: &Ctx, span: Span, po: &[(Ty, Ty)]) {
        let Some(le) = &self.le else { return };
        if po.is_empty() || le.region_order.satisfies_constraints(po, &Type::heap_rgn(), false) {
            return;
        }
        if po.iter().any(|(e, r)| has_evar(e) || has_evar(r)) {
            le.shared
                .delayed_constraints
                .borrow_mut()
                .push((le.region_order.clone(), po.to_vec(), span));
            return;
        }
        ctx.error(
            ErrorKind::Region,
            span,
            "the caller's region order does not satisfy the callee's outlives constraints",
        );
    }

    /// Re-runs postponed region checks now that evars are resolved. A region
    /// evar still unresolved is pinned to the heap, an effect evar to the
    /// capability in effect at the check.
    pub fn check_delayed(&self, ctx: &Ctx) {
        let le = self.fenv();
        for (cap, atom, po, span) in le.shared.delayed_effects.borrow_mut().drain(..) {
            let atom = normalize_effect(&atom);
            let ok = atom.iter().all(|a| match &**a {
                Type::AccessEff(r) => {
                    pin(r, &Type::heap_rgn());
                    let r = compress(r);
                    matches!(&*r, Type::Evar(_) | Type::HeapRgn | Type::UniqueRgn)
                        || normalize_effect(&cap).iter().any(|c| match &**c {
                            Type::AccessEff(c) => po.rgn_outlives_rgn(&r, c),
                            _ => false,
                        })
                }
                Type::Evar(_) => {
                    pin(a, &cap);
                    true
                }
                _ => normalize_effect(&cap).iter().any(|c| typecmp(c, a)),
            });
            if !ok {
                ctx.error(
                    ErrorKind::Region,
                    span,
                    format!(
                        "expression accesses unavailable region {}",
                        atom.first().map(effect_region_name).unwrap_or_default()
                    ),
                );
            }
        }
        for (po, cs, span) in le.shared.delayed_constraints.borrow_mut().drain(..) {
            if !po.satisfies_constraints(&cs, &Type::heap_rgn(), true) {
                ctx.error(
                    ErrorKind::Region,
                    span,
                    "the caller's region order does not satisfy the callee's outlives constraints",
                );
            }
        }
    }

    // -------------------------------------------------------------------
    // control flow

    pub fn set_in_loop(&self, loop_stmt: &StmtRef, continue_dest: &StmtRef) -> Tenv {
        self.with_fenv(|le| {
            le.ctrl.break_target = Some(loop_stmt.clone());
            le.ctrl.continue_target = Some(continue_dest.clone());
        })
    }

    pub fn set_in_switch(&self, switch_stmt: &StmtRef) -> Tenv {
        self.with_fenv(|le| {
            le.ctrl.break_target = Some(switch_stmt.clone());
        })
    }

    /// Where `fallthru` in the current clause goes: the next clause's body
    /// and pattern variables, or nowhere for the last clause.
    pub fn set_fallthru(&self, next: Option<(StmtRef, Vec<VarRef>)>) -> Tenv {
        self.with_fenv(|le| le.ctrl.fallthru = next)
    }

    pub fn enter_try(&self) -> Tenv {
        self.with_fenv(|le| le.ctrl.try_depth += 1)
    }

    pub fn try_depth(&self) -> u32 {
        self.le.as_ref().map(|le| le.ctrl.try_depth).unwrap_or(0)
    }

    fn resolve_jump(s: &StmtRef, target: &StmtRef) {
        match s.jump_target() {
            Some(slot) => slot.set(target),
            None => impos("jump target requested for a non-jump statement"),
        }
        target.add_non_local_pred(s);
    }

    pub fn process_break(&self, ctx: &Ctx, s: &StmtRef) {
        match &self.fenv().ctrl.break_target {
            Some(t) => Self::resolve_jump(s, t),
            None => ctx.error(ErrorKind::Jump, s.span, "break not in a loop or switch"),
        }
    }

    pub fn process_continue(&self, ctx: &Ctx, s: &StmtRef) {
        match &self.fenv().ctrl.continue_target {
            Some(t) => Self::resolve_jump(s, t),
            None => ctx.error(ErrorKind::Jump, s.span, "continue not in a loop"),
        }
    }

    /// Resolves `goto label` now if the label was seen, otherwise when it is.
    pub fn process_goto(&self, s: &StmtRef, label: &str) {
        let shared = &self.fenv().shared;
        let target = shared.seen_labels.borrow().get(label).cloned();
        match target {
            Some(t) => Self::resolve_jump(s, &t),
            None => shared
                .needed_labels
                .borrow_mut()
                .push((label.to_string(), s.clone())),
        }
    }

    /// Resolves `fallthru` and returns the pattern variables of the clause
    /// it enters.
    pub fn process_fallthru(&self, ctx: &Ctx, s: &StmtRef) -> Option<Vec<VarRef>> {
        match &self.fenv().ctrl.fallthru {
            Some((body, vars)) => {
                Self::resolve_jump(s, body);
                Some(vars.clone())
            }
            None => {
                ctx.error(ErrorKind::Jump, s.span, "fallthru not in a non-last case");
                None
            }
        }
    }

    pub fn add_label(&self, ctx: &Ctx, label: &str, s: &StmtRef) {
        let shared = &self.fenv().shared;
        if shared.seen_labels.borrow().contains_key(label) {
            ctx.error(ErrorKind::Jump, s.span, format!("repeated label {label}"));
            return;
        }
        shared
            .seen_labels
            .borrow_mut()
            .insert(label.to_string(), s.clone());
        let mut needed = shared.needed_labels.borrow_mut();
        let (now, later): (Vec<_>, Vec<_>) = needed.drain(..).partition(|(l, _)| l == label);
        *needed = later;
        for (_, goto) in now {
            Self::resolve_jump(&goto, s);
        }
    }

    /// Reports every `goto` whose label never appeared. Returns whether all
    /// were resolved.
    pub fn all_labels_resolved(&self, ctx: &Ctx) -> bool {
        let needed = self.fenv().shared.needed_labels.borrow();
        for (label, goto) in needed.iter() {
            ctx.error(ErrorKind::Jump, goto.span, format!("label {label} undefined"));
        }
        needed.is_empty()
    }
}

impl Default for Tenv {
    fn default() -> Self {
        Self::new()
    }
}

fn has_evar(t: &Ty) -> bool {
    !crate::tcutil::free_evars(t).is_empty()
}

fn effect_region_name(atom: &Ty) -> String {
    match &**atom {
        Type::AccessEff(r) => compress(r).to_string(),
        _ => atom.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ast::build::Builder;
    use strata_ast::{DeclKind, StmtKind};

    fn fn_env(b: &Builder, ctx: &Ctx) -> (Tenv, Rc<FnDecl>) {
        let d = b.fn_decl("f", vec![], Type::void(), b.skip());
        let DeclKind::Fn(fd) = &d.kind else { unreachable!() };
        let te = Tenv::new().new_fenv(ctx, fd, &Type::join_eff(vec![]), &[]);
        (te, fd.clone())
    }

    #[test]
    fn builtin_regions_resolve() {
        let te = Tenv::new();
        assert!(matches!(
            te.lookup_ordinary(&QualName::local("heap_region")),
            Some(Resolved::Var(Binding::Global(_)))
        ));
    }

    #[test]
    fn namespaces_and_using() {
        let te = Tenv::new();
        let inner = te.enter_ns("Core");
        let vd = VarDecl::new(dummy_span(), QualName::local("x"), Type::sint(), None);
        inner
            .current_genv()
            .add_ordinary("x", Resolved::Var(Binding::Global(vd)));

        assert!(te.lookup_ordinary(&QualName::local("x")).is_none());
        assert!(te.lookup_ordinary(&QualName::rel(vec!["Core".into()], "x")).is_some());
        assert!(te.lookup_ordinary(&QualName::abs(vec!["Core".into()], "x")).is_some());

        let path = te.resolve_namespace(&QualName::local("Core")).unwrap();
        let opened = te.add_using(path);
        assert!(opened.lookup_ordinary(&QualName::local("x")).is_some());
        assert!(te.lookup_ordinary(&QualName::local("x")).is_none());

        // A using written at the root still applies inside a nested namespace.
        let nested = opened.enter_ns("Other");
        assert!(nested.lookup_ordinary(&QualName::local("x")).is_some());
        let reopened = nested.add_using(vec!["Core".into()]);
        assert!(reopened.lookup_ordinary(&QualName::local("x")).is_some());
    }

    #[test]
    fn delayed_region_evar_is_pinned_to_the_heap() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let (te, _) = fn_env(&b, &ctx);
        let ev = Type::evar(Some(Kind::Rgn), None);
        te.check_rgn_accessible(&ctx, dummy_span(), &ev);
        te.check_delayed(&ctx);
        assert_eq!(ctx.error_count(), 0);
        assert!(matches!(&*compress(&ev), Type::HeapRgn));
    }

    #[test]
    fn locals_are_scoped_functionally() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let (te, _) = fn_env(&b, &ctx);
        let vd = b.vardecl("y", Type::sint(), None);
        let inner = te.add_local_var(&vd);
        assert!(inner.lookup_ordinary(&QualName::local("y")).is_some());
        assert!(te.lookup_ordinary(&QualName::local("y")).is_none());
    }

    #[test]
    fn break_outside_loop_is_reported() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let (te, _) = fn_env(&b, &ctx);
        let brk = b.break_();
        te.process_break(&ctx, &brk);
        assert_eq!(ctx.error_count(), 1);

        let lp = b.while_(b.int(1), brk.clone());
        let StmtKind::While(cond, _) = &lp.kind else { unreachable!() };
        te.set_in_loop(&lp, &cond.point).process_break(&ctx, &brk);
        let target = brk.jump_target().unwrap().get().unwrap();
        assert!(Rc::ptr_eq(&target, &lp));
        assert_eq!(lp.non_local_preds.borrow().len(), 1);
    }

    #[test]
    fn forward_goto_resolves_at_label() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let (te, _) = fn_env(&b, &ctx);
        let g = b.goto("out");
        te.process_goto(&g, "out");
        let l = b.label("out", b.skip());
        te.add_label(&ctx, "out", &l);
        assert!(te.all_labels_resolved(&ctx));
        assert!(g.jump_target().unwrap().is_resolved());

        let dangling = b.goto("nowhere");
        te.process_goto(&dangling, "nowhere");
        assert!(!te.all_labels_resolved(&ctx));
        assert_eq!(ctx.error_count(), 1);
    }

    #[test]
    fn named_block_region_is_accessible_only_inside() {
        let b = Builder::new();
        let ctx = Ctx::default();
        let (te, _) = fn_env(&b, &ctx);
        let r = Tvar::new("`r", Kind::Rgn);
        let inner = te.new_named_block(&r, false);
        inner.check_rgn_accessible(&ctx, b.sp(), &Type::var(&r));
        assert_eq!(ctx.error_count(), 0);
        assert!(inner.region_outlives(&te.parameter_rgn(), &Type::var(&r)));
        te.check_rgn_accessible(&ctx, b.sp(), &Type::var(&r));
        assert_eq!(ctx.error_count(), 1);
    }
}
