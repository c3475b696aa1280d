//! Typed fragments a shader is assembled from before it is rendered to text.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarType {
    F32,
    I32,
    U32,
    Bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderType {
    Scalar(ScalarType),
    Vector(u8, ScalarType),
}

impl ShaderType {
    pub const F32: ShaderType = ShaderType::Scalar(ScalarType::F32);
    pub const I32: ShaderType = ShaderType::Scalar(ScalarType::I32);
    pub const BOOL: ShaderType = ShaderType::Scalar(ScalarType::Bool);

    /// Integer coordinate type of a rank-`rank` tensor; ranks 0 and 1 use a scalar.
    pub fn coords(rank: usize) -> Self {
        match rank {
            0 | 1 => ShaderType::I32,
            n => ShaderType::Vector(n as u8, ScalarType::I32),
        }
    }

    pub fn vec(width: usize, scalar: ScalarType) -> Self {
        if width <= 1 {
            ShaderType::Scalar(scalar)
        } else {
            ShaderType::Vector(width as u8, scalar)
        }
    }

    pub fn width(self) -> usize {
        match self {
            ShaderType::Scalar(_) => 1,
            ShaderType::Vector(n, _) => n as usize,
        }
    }

    pub fn scalar(self) -> ScalarType {
        match self {
            ShaderType::Scalar(s) | ShaderType::Vector(_, s) => s,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Ge,
    Gt,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    LocalInvocationId,
    GlobalInvocationId,
    WorkgroupId,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Ident(String),
    Int(i64),
    Float(f32),
    Bool(bool),
    /// Field or swizzle access, `base.name`.
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Vec<Expr>),
    /// Type constructor; with one argument of another type this is a conversion.
    Construct(ShaderType, Vec<Expr>),
    Builtin(Builtin),
}

pub fn ident(name: impl Into<String>) -> Expr {
    Expr::Ident(name.into())
}

pub fn int(value: i64) -> Expr {
    Expr::Int(value)
}

pub fn float(value: f32) -> Expr {
    Expr::Float(value)
}

pub fn member(base: Expr, name: impl Into<String>) -> Expr {
    Expr::Member(Box::new(base), name.into())
}

pub fn index(base: Expr, at: Expr) -> Expr {
    Expr::Index(Box::new(base), Box::new(at))
}

pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary(op, Box::new(lhs), Box::new(rhs))
}

pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr::Call(name.into(), args)
}

pub fn construct(ty: ShaderType, args: Vec<Expr>) -> Expr {
    Expr::Construct(ty, args)
}

pub fn uniform(field: &str) -> Expr {
    member(ident("uniforms"), field)
}

/// Left fold of `terms` with `op`; `empty` when there are no terms.
pub fn fold(op: BinaryOp, terms: Vec<Expr>, empty: Expr) -> Expr {
    terms
        .into_iter()
        .reduce(|acc, term| binary(op, acc, term))
        .unwrap_or(empty)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        ty: ShaderType,
        value: Expr,
    },
    Var {
        name: String,
        ty: ShaderType,
        value: Expr,
    },
    Assign {
        target: Expr,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
    },
    Return(Option<Expr>),
    Expr(Expr),
}

impl Stmt {
    pub fn let_(name: impl Into<String>, ty: ShaderType, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            ty,
            value,
        }
    }

    pub fn var(name: impl Into<String>, ty: ShaderType, value: Expr) -> Self {
        Stmt::Var {
            name: name.into(),
            ty,
            value,
        }
    }

    pub fn assign(target: Expr, value: Expr) -> Self {
        Stmt::Assign { target, value }
    }

    pub fn ret(value: Expr) -> Self {
        Stmt::Return(Some(value))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: ShaderType,
}

impl Param {
    pub fn new(name: impl Into<String>, ty: ShaderType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Option<ShaderType>,
    pub body: Vec<Stmt>,
}

impl Function {
    pub fn new(
        name: impl Into<String>,
        params: Vec<Param>,
        ret: Option<ShaderType>,
        body: Vec<Stmt>,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            body,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
}

/// A runtime-sized storage array bound at `binding`.
#[derive(Clone, Debug, PartialEq)]
pub struct StorageBinding {
    pub binding: u32,
    pub name: String,
    pub element: ShaderType,
    pub access: Access,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UniformMember {
    pub name: String,
    pub ty: ShaderType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntryPoint {
    pub workgroup_size: [u32; 3],
    pub body: Vec<Stmt>,
}

/// A complete compute shader in target-independent form.
///
/// `helpers` are emitted in order ahead of `user_code`, so every helper only calls
/// helpers that precede it.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderModule {
    pub uniforms: Vec<UniformMember>,
    pub uniform_binding: u32,
    pub storage: Vec<StorageBinding>,
    pub helpers: Vec<Function>,
    pub user_code: String,
    pub entry: EntryPoint,
}
