use std::fmt;

use crate::decl::AggrKind;
use crate::exp::{Cnst, Exp, ExpKind, Primop};
use crate::types::{Bounds, FloatKind, IntSize, Kind, KindBound, Sign, Tvar, Type};

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Any => "A",
            Kind::Mem => "M",
            Kind::Box => "B",
            Kind::Rgn => "R",
            Kind::Eff => "E",
            Kind::Int => "I",
        })
    }
}

impl fmt::Display for Tvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match &*self.kind.borrow() {
            KindBound::Eq(Kind::Box) | KindBound::Unknown => Ok(()),
            KindBound::Eq(k) => write!(f, "::{k}"),
            KindBound::Less(k) => write!(f, "::<{k}"),
        }
    }
}

impl fmt::Display for AggrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AggrKind::Struct => "struct",
            AggrKind::Union => "union",
        })
    }
}

impl fmt::Display for Primop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Primop::Plus => "+",
            Primop::Times => "*",
            Primop::Minus => "-",
            Primop::Div => "/",
            Primop::Mod => "%",
            Primop::Eq => "==",
            Primop::Neq => "!=",
            Primop::Gt => ">",
            Primop::Lt => "<",
            Primop::Gte => ">=",
            Primop::Lte => "<=",
            Primop::Not => "!",
            Primop::Bitnot => "~",
            Primop::Bitand => "&",
            Primop::Bitor => "|",
            Primop::Bitxor => "^",
            Primop::Bitlshift => "<<",
            Primop::Bitrshift => ">>",
            Primop::Numelts => "numelts",
        })
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T], sep: &str) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_targs(f: &mut fmt::Formatter<'_>, targs: &[crate::Ty]) -> fmt::Result {
    if targs.is_empty() {
        return Ok(());
    }
    f.write_str("<")?;
    write_list(f, targs, ",")?;
    f.write_str(">")
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Evar(ev) => match &*ev.resolved.borrow() {
                Some(t) => write!(f, "{t}"),
                None => match *ev.kind.borrow() {
                    Some(k) => write!(f, "%{}::{k}", ev.id),
                    None => write!(f, "%{}", ev.id),
                },
            },
            Type::Var(tv) => f.write_str(&tv.name),
            Type::Pointer(p) => {
                if p.elt_tq.is_const {
                    f.write_str("const ")?;
                }
                write!(f, "{}", p.elt)?;
                let nullable = p.atts.nullable.value().ok().flatten();
                let bounds = p.atts.bounds.value().ok().flatten();
                match (bounds, nullable) {
                    (Some(Bounds::Fat), _) => f.write_str("?")?,
                    (_, Some(false)) => f.write_str("@")?,
                    _ => f.write_str("*")?,
                }
                if let Some(Bounds::Upper(n)) = bounds {
                    if n != 1 {
                        write!(f, "{{{n}}}")?;
                    }
                }
                if p.atts.zero_term.value().ok().flatten() == Some(true) {
                    f.write_str("@zeroterm")?;
                }
                match &*p.atts.rgn {
                    Type::HeapRgn => Ok(()),
                    r => write!(f, "{r}"),
                }
            }
            Type::Int(sign, size) => {
                match sign {
                    Sign::Unsigned => f.write_str("unsigned ")?,
                    Sign::Signed if *size == IntSize::Char => f.write_str("signed ")?,
                    Sign::Signed | Sign::None => {}
                }
                f.write_str(match size {
                    IntSize::Char => "char",
                    IntSize::Short => "short",
                    IntSize::Int => "int",
                    IntSize::Long => "long",
                    IntSize::LongLong => "long long",
                })
            }
            Type::Float(k) => f.write_str(match k {
                FloatKind::Float => "float",
                FloatKind::Double => "double",
                FloatKind::LongDouble => "long double",
            }),
            Type::Array(a) => {
                write!(f, "{}[", a.elt)?;
                if let Some(n) = &a.num_elts {
                    write!(f, "{n}")?;
                }
                f.write_str("]")
            }
            Type::Fn(info) => {
                if !info.tvars.is_empty() {
                    f.write_str("<")?;
                    write_list(f, &info.tvars, ",")?;
                    f.write_str(">")?;
                }
                write!(f, "{}(", info.ret)?;
                for (i, a) in info.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", a.ty)?;
                }
                if info.c_varargs || info.cyc_varargs.is_some() {
                    f.write_str(if info.args.is_empty() { "..." } else { ",..." })?;
                }
                f.write_str(")")?;
                if let Some(eff) = &*info.effect.borrow() {
                    write!(f, "; {eff}")?;
                }
                Ok(())
            }
            Type::Tuple(ts) => {
                f.write_str("$(")?;
                for (i, (_, t)) in ts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{t}")?;
                }
                f.write_str(")")
            }
            Type::Aggr(a) => {
                let (kind, name) = a.kind_and_name();
                write!(f, "{kind} {name}")?;
                write_targs(f, &a.targs)
            }
            Type::AnonAggr(kind, fields) => {
                write!(f, "{kind} {{")?;
                for field in fields {
                    write!(f, " {} {};", field.ty, field.name)?;
                }
                f.write_str(" }")
            }
            Type::Enum(name, _) => write!(f, "enum {name}"),
            Type::AnonEnum(fields) => {
                f.write_str("enum {")?;
                let names: Vec<String> = fields.iter().map(|fd| fd.name.to_string()).collect();
                f.write_str(&names.join(","))?;
                f.write_str("}")
            }
            Type::Datatype(d) => {
                match &*d.dt.borrow() {
                    crate::types::DatatypeRef::Unknown { name, .. } => {
                        write!(f, "datatype {name}")?
                    }
                    crate::types::DatatypeRef::Known(w) => match w.upgrade() {
                        Some(decl) => write!(f, "datatype {}", decl.name)?,
                        None => f.write_str("datatype <dropped>")?,
                    },
                }
                write_targs(f, &d.targs)
            }
            Type::DatatypeField(d) => {
                match &*d.field.borrow() {
                    crate::types::DatatypeFieldRef::Unknown {
                        dt_name,
                        field_name,
                    } => write!(f, "datatype {dt_name}.{field_name}")?,
                    crate::types::DatatypeFieldRef::Known(dt, field) => match dt.upgrade() {
                        Some(decl) => write!(f, "datatype {}.{}", decl.name, field.name)?,
                        None => write!(f, "datatype <dropped>.{}", field.name)?,
                    },
                }
                write_targs(f, &d.targs)
            }
            Type::RgnHandle(r) => write!(f, "region_t<{r}>"),
            Type::HeapRgn => f.write_str("`H"),
            Type::UniqueRgn => f.write_str("`U"),
            Type::AccessEff(r) => write!(f, "{r}"),
            Type::JoinEff(es) => {
                f.write_str("{")?;
                write_list(f, es, ",")?;
                f.write_str("}")
            }
            Type::RgnsEff(t) => write!(f, "regions({t})"),
            Type::Typedef(td) => {
                write!(f, "{}", td.name)?;
                write_targs(f, &td.args)
            }
        }
    }
}

impl fmt::Display for Cnst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cnst::Null => f.write_str("NULL"),
            Cnst::Char(c) => write!(f, "'{}'", char::from(*c).escape_default()),
            Cnst::Int(_, i) => write!(f, "{i}"),
            Cnst::LongLong(_, i) => write!(f, "{i}LL"),
            Cnst::Float(s) => f.write_str(s),
            Cnst::Str(s) => write!(f, "\"{}\"", s.escape_default()),
        }
    }
}

/// Compact source-like rendering used in diagnostics.
impl fmt::Display for Exp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.kind.borrow() {
            ExpKind::Const(c) => write!(f, "{c}"),
            ExpKind::Var(q, _) | ExpKind::UnknownId(q) => write!(f, "{q}"),
            ExpKind::Primop(op, args) => match args.as_slice() {
                [a] => write!(f, "{op}{a}"),
                [a, b] => write!(f, "{a} {op} {b}"),
                _ => write!(f, "{op}(...)"),
            },
            ExpKind::AssignOp(l, op, r) => match op {
                Some(op) => write!(f, "{l} {op}= {r}"),
                None => write!(f, "{l} = {r}"),
            },
            ExpKind::Increment(e, inc) => {
                use crate::exp::Incrementor::*;
                match inc {
                    PreInc => write!(f, "++{e}"),
                    PostInc => write!(f, "{e}++"),
                    PreDec => write!(f, "--{e}"),
                    PostDec => write!(f, "{e}--"),
                }
            }
            ExpKind::Conditional(c, a, b) => write!(f, "{c} ? {a} : {b}"),
            ExpKind::And(a, b) => write!(f, "{a} && {b}"),
            ExpKind::Or(a, b) => write!(f, "{a} || {b}"),
            ExpKind::SeqExp(a, b) => write!(f, "({a}, {b})"),
            ExpKind::UnknownCall(func, args) | ExpKind::FnCall(func, args) => {
                write!(f, "{func}(")?;
                write_list(f, args, ", ")?;
                f.write_str(")")
            }
            ExpKind::Throw(e) => write!(f, "throw {e}"),
            ExpKind::NoInstantiate(e) | ExpKind::Instantiate(e, _) => write!(f, "{e}"),
            ExpKind::Cast(t, e, _, _) => write!(f, "({t}){e}"),
            ExpKind::Address(e) => write!(f, "&{e}"),
            ExpKind::New(Some(r), e) => write!(f, "rnew({r}) {e}"),
            ExpKind::New(None, e) => write!(f, "new {e}"),
            ExpKind::Sizeoftyp(t) => write!(f, "sizeof({t})"),
            ExpKind::Sizeofexp(e) => write!(f, "sizeof({e})"),
            ExpKind::Deref(e) => write!(f, "*{e}"),
            ExpKind::AggrMember(e, n) => write!(f, "{e}.{n}"),
            ExpKind::AggrArrow(e, n) => write!(f, "{e}->{n}"),
            ExpKind::Subscript(a, i) => write!(f, "{a}[{i}]"),
            ExpKind::Tuple(es) => {
                f.write_str("$(")?;
                write_list(f, es, ", ")?;
                f.write_str(")")
            }
            ExpKind::Aggregate { name, .. } => write!(f, "{name}{{...}}"),
            ExpKind::AnonStruct(..) | ExpKind::UnresolvedMem(..) => f.write_str("{...}"),
            ExpKind::Datatype(args, _, field) => {
                write!(f, "{}(", field.name)?;
                write_list(f, args, ", ")?;
                f.write_str(")")
            }
            ExpKind::Enum(ed, i) => match ed.fields.as_ref().and_then(|fs| fs.get(*i)) {
                Some(field) => write!(f, "{}", field.name),
                None => write!(f, "enum {}", ed.name),
            },
            ExpKind::AnonEnum(_, n) => f.write_str(n),
            ExpKind::Malloc(m) => match &m.rgn {
                Some(r) => write!(f, "rmalloc({r}, ...)"),
                None => f.write_str("malloc(...)"),
            },
            ExpKind::Swap(a, b) => write!(f, "{a} :=: {b}"),
            ExpKind::StmtExp(_) => f.write_str("({...})"),
            ExpKind::Array(es) => {
                f.write_str("{")?;
                write_list(f, es, ", ")?;
                f.write_str("}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tvar;

    #[test]
    fn pointer_types_render_with_region() {
        let r = Tvar::new("`r", Kind::Rgn);
        let t = Type::at(Type::sint(), Type::var(&r));
        assert_eq!(t.to_string(), "int@`r");
        let h = Type::star(Type::char(), Type::heap_rgn());
        assert_eq!(h.to_string(), "char*");
        let u = Type::star(Type::sint(), Type::unique_rgn());
        assert_eq!(u.to_string(), "int*`U");
    }

    #[test]
    fn effects_render_as_sets() {
        let r = Tvar::new("`r", Kind::Rgn);
        let e = Type::join_eff(vec![
            Type::access_eff(Type::var(&r)),
            Type::access_eff(Type::heap_rgn()),
        ]);
        assert_eq!(e.to_string(), "{`r,`H}");
    }
}
