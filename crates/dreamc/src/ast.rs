//! The DM abstract syntax tree and constant evaluation over it.
//!
//! Two tagged-union families: statements and expressions. Every node
//! carries a location. `Expression::try_const` is the shared constant
//! evaluator used by both the folder and the JSON serializer.

use crate::{location::Location, path::DreamPath};

/// A statement with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub loc: Location,
    pub kind: StmtKind,
}

/// A single local variable declared by a `var` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVarDecl {
    pub name: String,
    pub type_path: Option<DreamPath>,
    pub value: Option<Expr>,
}

/// One parameter of a proc definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcParam {
    pub name: String,
    pub type_path: Option<DreamPath>,
    pub default: Option<Expr>,
    /// `as` clause type names, e.g. `num|text`.
    pub as_types: Vec<String>,
    /// `in` clause restricting the accepted values.
    pub in_list: Option<Expr>,
}

/// A `switch` case: one or more values/ranges guarding a body.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub values: Vec<SwitchValue>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SwitchValue {
    Exact(Expr),
    Range(Expr, Expr),
}

/// The iterable of a `for (x in …)` loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ForList {
    Expr(Expr),
    Range {
        start: Expr,
        end: Expr,
        step: Option<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// A path-structured object definition with nested statements.
    ObjectDef { path: DreamPath, body: Vec<Stmt> },
    /// A variable definition; `path` is everything written before the name,
    /// including the `var` segment, modifiers, and the declared type.
    VarDef {
        path: DreamPath,
        name: String,
        value: Option<Expr>,
    },
    /// A bare `name = expr` under an object path.
    VarOverride {
        path: DreamPath,
        name: String,
        value: Expr,
    },
    /// A proc or verb definition.
    ProcDef {
        object_path: DreamPath,
        name: String,
        is_verb: bool,
        params: Vec<ProcParam>,
        body: Vec<Stmt>,
    },

    // Proc-level statements.
    Expr(Expr),
    VarDecls(Vec<LocalVarDecl>),
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        else_body: Option<Vec<Stmt>>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    DoWhile {
        body: Vec<Stmt>,
        cond: Expr,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },
    ForIn {
        decl: Option<LocalVarDecl>,
        var: String,
        list: ForList,
        body: Vec<Stmt>,
    },
    Switch {
        subject: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Vec<Stmt>>,
    },
    Spawn {
        delay: Option<Expr>,
        body: Vec<Stmt>,
    },
    TryCatch {
        try_body: Vec<Stmt>,
        catch_var: Option<String>,
        catch_body: Vec<Stmt>,
    },
    Throw(Expr),
    Return(Option<Expr>),
    Break(Option<String>),
    Continue(Option<String>),
    Goto(String),
    Label {
        name: String,
        body: Vec<Stmt>,
    },
    Del(Expr),
    Set {
        attr: String,
        value: Expr,
        /// `set attr in expr` instead of `set attr = expr`.
        in_list: bool,
    },
}

/// An expression with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub loc: Location,
    pub kind: ExprKind,
}

/// One argument of a call; DM allows `name = value` named arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    FloatMod,
    Power,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Equiv,
    NotEquiv,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AssignOp {
    Assign,
    Into,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    FloatMod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

/// Member-access flavor. The null-conditional forms skip the access when
/// the receiver is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DerefOp {
    Dot,
    Colon,
    DoubleColon,
    SafeDot,
    SafeColon,
}

impl DerefOp {
    #[must_use]
    pub fn is_safe(self) -> bool {
        matches!(self, Self::SafeDot | Self::SafeColon)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Resource(String),
    Path(DreamPath),
    /// A string with embedded expression slots; `parts.len() == exprs.len() + 1`.
    FormatStr {
        parts: Vec<String>,
        exprs: Vec<Expr>,
    },
    Ident(String),
    /// The implicit return-value variable `.`.
    DotValue,
    ParentCall(Vec<CallArg>),
    SelfCall(Vec<CallArg>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Assign {
        op: AssignOp,
        target: Box<Expr>,
        value: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    PreIncrement(Box<Expr>),
    PostIncrement(Box<Expr>),
    PreDecrement(Box<Expr>),
    PostDecrement(Box<Expr>),
    Ternary {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Deref {
        object: Box<Expr>,
        op: DerefOp,
        field: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        safe: bool,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<CallArg>,
    },
    New {
        type_expr: Option<Box<Expr>>,
        args: Vec<CallArg>,
    },
}

impl Expr {
    #[must_use]
    pub fn new(loc: Location, kind: ExprKind) -> Self {
        Self { loc, kind }
    }

    #[must_use]
    pub fn null(loc: Location) -> Self {
        Self::new(loc, ExprKind::Null)
    }

    /// Attempts to evaluate this expression as a compile-time constant.
    ///
    /// Used by the constant folder and by JSON serialization of variable
    /// defaults. Division by zero and any non-constant operand yield `None`.
    #[must_use]
    pub fn try_const(&self) -> Option<ConstValue> {
        match &self.kind {
            ExprKind::Null => Some(ConstValue::Null),
            ExprKind::Int(i) => Some(ConstValue::Int(*i)),
            ExprKind::Float(f) => Some(ConstValue::Float(*f)),
            ExprKind::Str(s) => Some(ConstValue::Str(s.clone())),
            ExprKind::Resource(r) => Some(ConstValue::Resource(r.clone())),
            ExprKind::Path(p) => Some(ConstValue::Path(p.to_string())),
            ExprKind::FormatStr { parts, exprs } if exprs.is_empty() => Some(ConstValue::Str(parts.concat())),
            ExprKind::Unary { op, operand } => ConstValue::unary(*op, &operand.try_const()?),
            ExprKind::Binary { op, lhs, rhs } => ConstValue::binary(*op, &lhs.try_const()?, &rhs.try_const()?),
            ExprKind::Ternary { cond, then, otherwise } => {
                let cond = cond.try_const()?;
                if cond.is_truthy() {
                    then.try_const()
                } else {
                    otherwise.try_const()
                }
            }
            _ => None,
        }
    }
}

/// A fully evaluated constant.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Resource(String),
    Path(String),
}

impl ConstValue {
    /// DM truthiness: null, zero, and the empty string are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Null => false,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Resource(_) | Self::Path(_) => true,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    fn from_bool(b: bool) -> Self {
        Self::Int(i64::from(b))
    }

    /// Evaluates a unary operator on a constant operand.
    #[must_use]
    pub fn unary(op: UnaryOp, operand: &Self) -> Option<Self> {
        match op {
            UnaryOp::Neg => match operand {
                Self::Int(i) => i.checked_neg().map(Self::Int),
                Self::Float(f) => Some(Self::Float(-f)),
                _ => None,
            },
            UnaryOp::Not => Some(Self::from_bool(!operand.is_truthy())),
            UnaryOp::BitNot => operand.as_i64().map(|i| Self::Int(!i & 0xFF_FFFF)),
        }
    }

    /// Evaluates a binary operator on constant operands. Returns `None` for
    /// anything that cannot be folded, including division by zero.
    #[must_use]
    pub fn binary(op: BinaryOp, lhs: &Self, rhs: &Self) -> Option<Self> {
        use BinaryOp as B;
        match op {
            B::Add => match (lhs, rhs) {
                (Self::Int(a), Self::Int(b)) => a.checked_add(*b).map(Self::Int),
                (Self::Str(a), Self::Str(b)) => Some(Self::Str(format!("{a}{b}"))),
                _ => Some(Self::Float(lhs.as_f64()? + rhs.as_f64()?)),
            },
            B::Sub => match (lhs, rhs) {
                (Self::Int(a), Self::Int(b)) => a.checked_sub(*b).map(Self::Int),
                _ => Some(Self::Float(lhs.as_f64()? - rhs.as_f64()?)),
            },
            B::Mul => match (lhs, rhs) {
                (Self::Int(a), Self::Int(b)) => a.checked_mul(*b).map(Self::Int),
                _ => Some(Self::Float(lhs.as_f64()? * rhs.as_f64()?)),
            },
            B::Div => match (lhs, rhs) {
                (_, Self::Int(0)) => None,
                (Self::Int(a), Self::Int(b)) if a % b == 0 => Some(Self::Int(a / b)),
                _ => {
                    let divisor = rhs.as_f64()?;
                    if divisor == 0.0 {
                        return None;
                    }
                    Some(Self::Float(lhs.as_f64()? / divisor))
                }
            },
            B::Mod => match (lhs.as_i64()?, rhs.as_i64()?) {
                (_, 0) => None,
                (a, b) => Some(Self::Int(a % b)),
            },
            B::FloatMod => {
                let divisor = rhs.as_f64()?;
                if divisor == 0.0 {
                    return None;
                }
                Some(Self::Float(lhs.as_f64()?.rem_euclid(divisor)))
            }
            B::Power => {
                let result = lhs.as_f64()?.powf(rhs.as_f64()?);
                match (lhs, rhs) {
                    (Self::Int(_), Self::Int(b)) if *b >= 0 && result.abs() < 1e15 => Some(Self::Int(result as i64)),
                    _ => Some(Self::Float(result)),
                }
            }
            B::BitAnd => Some(Self::Int(lhs.as_i64()? & rhs.as_i64()?)),
            B::BitOr => Some(Self::Int(lhs.as_i64()? | rhs.as_i64()?)),
            B::BitXor => Some(Self::Int(lhs.as_i64()? ^ rhs.as_i64()?)),
            B::Shl => {
                let shift = u32::try_from(rhs.as_i64()?).ok().filter(|s| *s < 64)?;
                lhs.as_i64()?.checked_shl(shift).map(Self::Int)
            }
            B::Shr => {
                let shift = u32::try_from(rhs.as_i64()?).ok().filter(|s| *s < 64)?;
                lhs.as_i64()?.checked_shr(shift).map(Self::Int)
            }
            B::Eq => Some(Self::from_bool(lhs.const_eq(rhs))),
            B::Ne => Some(Self::from_bool(!lhs.const_eq(rhs))),
            B::Lt => Some(Self::from_bool(lhs.as_f64()? < rhs.as_f64()?)),
            B::Gt => Some(Self::from_bool(lhs.as_f64()? > rhs.as_f64()?)),
            B::Le => Some(Self::from_bool(lhs.as_f64()? <= rhs.as_f64()?)),
            B::Ge => Some(Self::from_bool(lhs.as_f64()? >= rhs.as_f64()?)),
            B::Equiv => Some(Self::from_bool(lhs.const_equiv(rhs))),
            B::NotEquiv => Some(Self::from_bool(!lhs.const_equiv(rhs))),
            // DM's && and || return an operand, not a boolean.
            B::And => Some(if lhs.is_truthy() { rhs.clone() } else { lhs.clone() }),
            B::Or => Some(if lhs.is_truthy() { lhs.clone() } else { rhs.clone() }),
            B::In => None,
        }
    }

    fn const_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            _ => self == other,
        }
    }

    /// `~=` equivalence: case-insensitive for strings, numeric otherwise.
    fn const_equiv(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a.eq_ignore_ascii_case(b),
            _ => self.const_eq(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn int(i: i64) -> ConstValue {
        ConstValue::Int(i)
    }

    #[test]
    fn arithmetic_folds() {
        assert_eq!(ConstValue::binary(BinaryOp::Add, &int(1), &int(2)), Some(int(3)));
        assert_eq!(ConstValue::binary(BinaryOp::Mul, &int(4), &int(4)), Some(int(16)));
        assert_eq!(
            ConstValue::binary(BinaryOp::Div, &int(7), &int(2)),
            Some(ConstValue::Float(3.5))
        );
        assert_eq!(ConstValue::binary(BinaryOp::Div, &int(8), &int(2)), Some(int(4)));
    }

    #[test]
    fn division_by_zero_does_not_fold() {
        assert_eq!(ConstValue::binary(BinaryOp::Div, &int(1), &int(0)), None);
        assert_eq!(ConstValue::binary(BinaryOp::Mod, &int(1), &int(0)), None);
    }

    #[test]
    fn string_concat_and_equivalence() {
        let a = ConstValue::Str("foo".to_owned());
        let b = ConstValue::Str("BAR".to_owned());
        assert_eq!(
            ConstValue::binary(BinaryOp::Add, &a, &b),
            Some(ConstValue::Str("fooBAR".to_owned()))
        );
        let upper = ConstValue::Str("FOO".to_owned());
        assert_eq!(ConstValue::binary(BinaryOp::Equiv, &a, &upper), Some(int(1)));
        assert_eq!(ConstValue::binary(BinaryOp::Eq, &a, &upper), Some(int(0)));
    }

    #[test]
    fn logical_ops_return_operands() {
        assert_eq!(ConstValue::binary(BinaryOp::And, &int(1), &int(5)), Some(int(5)));
        assert_eq!(ConstValue::binary(BinaryOp::And, &int(0), &int(5)), Some(int(0)));
        assert_eq!(ConstValue::binary(BinaryOp::Or, &int(3), &int(5)), Some(int(3)));
    }

    #[test]
    fn try_const_walks_nested_expressions() {
        let loc = Location::INTERNAL;
        let expr = Expr::new(
            loc,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                lhs: Box::new(Expr::new(
                    loc,
                    ExprKind::Binary {
                        op: BinaryOp::Add,
                        lhs: Box::new(Expr::new(loc, ExprKind::Int(3))),
                        rhs: Box::new(Expr::new(loc, ExprKind::Int(1))),
                    },
                )),
                rhs: Box::new(Expr::new(loc, ExprKind::Int(4))),
            },
        );
        assert_eq!(expr.try_const(), Some(int(16)));
    }
}
