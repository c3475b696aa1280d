use super::ast::*;
use crate::error::KernelResult;
use crate::layout::{broadcast_dims, symbolic_strides, COMPONENTS, MAX_RANK};
use crate::program::{OperandInfo, Program};
use crate::types::{DataType, EntryKind, StorageType, Vectorization};
use crate::uniforms::UniformKind;

pub const OUTPUT_NAME: &str = "result";

pub(crate) struct ModuleBuilder<'a> {
    program: &'a Program,
    inputs: &'a [OperandInfo],
    output: &'a OperandInfo,
    vec4: bool,
}

impl<'a> ModuleBuilder<'a> {
    pub fn new(program: &'a Program, inputs: &'a [OperandInfo], output: &'a OperandInfo) -> Self {
        Self {
            program,
            inputs,
            output,
            vec4: program.vectorization() == Vectorization::Vec4,
        }
    }

    pub fn build(&self) -> KernelResult<ShaderModule> {
        self.program.validate(self.inputs, self.output)?;
        let body = self.program.body()?.to_string();

        let mut helpers = vec![isnan_fn(), isnan_vec4_fn(), idiv_fn()];
        helpers.extend((1..=MAX_RANK).map(in_bounds_fn));
        helpers.extend((1..=MAX_RANK).map(index_from_coords_fn));
        helpers.push(self.output_index_from_coords_fn());
        helpers.push(self.coords_from_index_fn());
        helpers.push(self.global_index_fn());
        helpers.push(self.output_coords_fn()?);
        for input in self.inputs {
            helpers.extend(self.sampler_fns(input));
        }
        helpers.extend(self.writer_fns());

        Ok(ShaderModule {
            uniforms: self.uniform_members(),
            uniform_binding: self.inputs.len() as u32 + 1,
            storage: self.storage_bindings(),
            helpers,
            user_code: body,
            entry: EntryPoint {
                workgroup_size: self.program.workgroup_size(),
                body: self.entry_body(),
            },
        })
    }

    fn out_rank(&self) -> usize {
        self.output.rank()
    }

    fn out_coords(&self) -> ShaderType {
        ShaderType::coords(self.out_rank())
    }

    fn value_type(&self, scalar: ScalarType) -> ShaderType {
        if self.vec4 {
            ShaderType::Vector(4, scalar)
        } else {
            ShaderType::Scalar(scalar)
        }
    }

    fn storage_type(&self, dtype: DataType) -> ShaderType {
        let scalar = match dtype.storage() {
            Some(StorageType::F32) => ScalarType::F32,
            _ => ScalarType::I32,
        };
        self.value_type(scalar)
    }

    fn uniform_members(&self) -> Vec<UniformMember> {
        let mut members = vec![UniformMember {
            name: "NAN".into(),
            ty: ShaderType::F32,
        }];
        for input in self.inputs {
            members.push(UniformMember {
                name: shape_uniform(&input.name),
                ty: ShaderType::coords(input.rank()),
            });
        }
        members.push(UniformMember {
            name: "outShape".into(),
            ty: self.out_coords(),
        });
        members.push(UniformMember {
            name: "outShapeStrides".into(),
            ty: ShaderType::coords(self.out_rank().saturating_sub(1)),
        });
        if self.program.includes_size() {
            members.push(UniformMember {
                name: "size".into(),
                ty: ShaderType::I32,
            });
        }
        members.push(UniformMember {
            name: "dispatchSize".into(),
            ty: ShaderType::Vector(3, ScalarType::I32),
        });
        for decl in self.program.uniform_decls() {
            let scalar = match decl.kind {
                UniformKind::Float32 => ScalarType::F32,
                UniformKind::Int32 => ScalarType::I32,
                UniformKind::Uint32 => ScalarType::U32,
            };
            members.push(UniformMember {
                name: decl.name.clone(),
                ty: ShaderType::vec(decl.width, scalar),
            });
        }
        members
    }

    fn storage_bindings(&self) -> Vec<StorageBinding> {
        let mut bindings = vec![StorageBinding {
            binding: 0,
            name: OUTPUT_NAME.into(),
            element: self.storage_type(self.output.dtype),
            access: Access::ReadWrite,
        }];
        for (i, input) in self.inputs.iter().enumerate() {
            bindings.push(StorageBinding {
                binding: i as u32 + 1,
                name: input.name.clone(),
                element: self.storage_type(input.dtype),
                access: Access::Read,
            });
        }
        bindings
    }

    /// `uniforms.outShapeStrides` component `i`.
    fn out_stride(&self, i: usize) -> Expr {
        let strides = uniform("outShapeStrides");
        if self.out_rank() <= 2 {
            strides
        } else {
            member(strides, COMPONENTS[i])
        }
    }

    fn output_index_from_coords_fn(&self) -> Function {
        let rank = self.out_rank();
        let coords = ident("coords");
        let value = if rank <= 1 {
            coords
        } else {
            let mut terms: Vec<Expr> = (0..rank - 1)
                .map(|i| binary(BinaryOp::Mul, member(coords.clone(), COMPONENTS[i]), self.out_stride(i)))
                .collect();
            terms.push(member(coords, COMPONENTS[rank - 1]));
            fold(BinaryOp::Add, terms, int(0))
        };
        Function::new(
            "getOutputIndexFromCoords",
            vec![Param::new("coords", self.out_coords())],
            Some(ShaderType::I32),
            vec![Stmt::ret(value)],
        )
    }

    fn coords_from_index_fn(&self) -> Function {
        let rank = self.out_rank();
        let mut body = Vec::new();
        if rank <= 1 {
            body.push(Stmt::ret(ident("index")));
        } else {
            body.push(Stmt::var("remainder", ShaderType::I32, ident("index")));
            let mut parts = Vec::with_capacity(rank);
            for i in 0..rank - 1 {
                let d = format!("d{i}");
                body.push(Stmt::let_(
                    d.clone(),
                    ShaderType::I32,
                    binary(BinaryOp::Div, ident("remainder"), self.out_stride(i)),
                ));
                body.push(Stmt::assign(
                    ident("remainder"),
                    binary(
                        BinaryOp::Sub,
                        ident("remainder"),
                        binary(BinaryOp::Mul, ident(d.clone()), self.out_stride(i)),
                    ),
                ));
                parts.push(ident(d));
            }
            parts.push(ident("remainder"));
            body.push(Stmt::ret(construct(self.out_coords(), parts)));
        }
        Function::new(
            "getCoordsFromIndex",
            vec![Param::new("index", ShaderType::I32)],
            Some(self.out_coords()),
            body,
        )
    }

    fn global_index_fn(&self) -> Function {
        let [wx, wy, wz] = self.program.workgroup_size().map(i64::from);
        let id = |b: Builtin, c: &'static str| construct(ShaderType::I32, vec![member(Expr::Builtin(b), c)]);
        let local_index = fold(
            BinaryOp::Add,
            vec![
                binary(BinaryOp::Mul, id(Builtin::LocalInvocationId, "z"), int(wx * wy)),
                binary(BinaryOp::Mul, id(Builtin::LocalInvocationId, "y"), int(wx)),
                id(Builtin::LocalInvocationId, "x"),
            ],
            int(0),
        );
        let dispatch = |c: &'static str| member(uniform("dispatchSize"), c);
        let workgroup_index = fold(
            BinaryOp::Add,
            vec![
                binary(
                    BinaryOp::Mul,
                    id(Builtin::WorkgroupId, "z"),
                    binary(BinaryOp::Mul, dispatch("x"), dispatch("y")),
                ),
                binary(BinaryOp::Mul, id(Builtin::WorkgroupId, "y"), dispatch("x")),
                id(Builtin::WorkgroupId, "x"),
            ],
            int(0),
        );
        Function::new(
            "getGlobalIndex",
            Vec::new(),
            Some(ShaderType::I32),
            vec![
                Stmt::let_("localIndex", ShaderType::I32, local_index),
                Stmt::let_("workgroupIndex", ShaderType::I32, workgroup_index),
                Stmt::ret(binary(
                    BinaryOp::Add,
                    binary(BinaryOp::Mul, ident("workgroupIndex"), int(wx * wy * wz)),
                    ident("localIndex"),
                )),
            ],
        )
    }

    /// Output coordinates of the current invocation.
    ///
    /// Flat layouts decompose the global index. Otherwise each dispatch dimension
    /// enumerates the output axes assigned to it, split with symbolic strides.
    fn output_coords_fn(&self) -> KernelResult<Function> {
        let rank = self.out_rank();
        let coords_ty = self.out_coords();
        let mut body = Vec::new();
        if self.program.is_flat() {
            let mut index = call("getGlobalIndex", Vec::new());
            if self.vec4 {
                index = binary(BinaryOp::Mul, index, int(4));
            }
            body.push(Stmt::ret(call("getCoordsFromIndex", vec![index])));
        } else {
            let layout = self.program.layout();
            let only_x = layout.y.is_empty() && layout.z.is_empty();
            for (dim, axes) in layout.dims().iter().enumerate() {
                if axes.is_empty() {
                    continue;
                }
                let component = COMPONENTS[dim];
                let source = if dim == 0 && only_x {
                    call("getGlobalIndex", Vec::new())
                } else {
                    construct(ShaderType::I32, vec![member(Expr::Builtin(Builtin::GlobalInvocationId), component)])
                };
                if axes.len() == 1 {
                    body.push(Stmt::let_(format!("d{}", axes[0]), ShaderType::I32, source));
                    continue;
                }
                let running = format!("index{component}");
                body.push(Stmt::var(running.clone(), ShaderType::I32, source));
                let strides = symbolic_strides(axes)?;
                for (axis, stride) in axes.iter().zip(&strides).take(axes.len() - 1) {
                    let stride_expr = fold(
                        BinaryOp::Mul,
                        stride
                            .axes
                            .iter()
                            .map(|&a| member(uniform("outShape"), COMPONENTS[a]))
                            .collect(),
                        int(1),
                    );
                    let d = format!("d{axis}");
                    body.push(Stmt::let_(
                        d.clone(),
                        ShaderType::I32,
                        binary(BinaryOp::Div, ident(running.clone()), stride_expr.clone()),
                    ));
                    body.push(Stmt::assign(
                        ident(running.clone()),
                        binary(
                            BinaryOp::Sub,
                            ident(running.clone()),
                            binary(BinaryOp::Mul, ident(d), stride_expr),
                        ),
                    ));
                }
                if let Some(last) = axes.last() {
                    body.push(Stmt::let_(format!("d{last}"), ShaderType::I32, ident(running)));
                }
            }
            let parts: Vec<Expr> = (0..rank.max(1)).map(|i| ident(format!("d{i}"))).collect();
            let value = if rank <= 1 {
                parts.into_iter().next().unwrap_or(int(0))
            } else {
                construct(coords_ty, parts)
            };
            body.push(Stmt::ret(value));
        }
        Ok(Function::new("getOutputCoords", Vec::new(), Some(coords_ty), body))
    }

    fn read(&self, operand: &OperandInfo, at: Expr) -> Expr {
        let at = if self.vec4 {
            binary(BinaryOp::Div, at, int(4))
        } else {
            at
        };
        construct(
            self.value_type(ScalarType::F32),
            vec![index(ident(operand.name.clone()), at)],
        )
    }

    fn sampler_fns(&self, operand: &OperandInfo) -> Vec<Function> {
        let name = &operand.name;
        let cap = capitalize(name);
        let rank = operand.rank();
        let value_ty = self.value_type(ScalarType::F32);
        let mut fns = Vec::with_capacity(4);

        // get<X>(d0, ..): coordinates in the operand's own shape.
        let params: Vec<Param> = (0..rank).map(|i| Param::new(format!("d{i}"), ShaderType::I32)).collect();
        let flat = match rank {
            0 => int(0),
            1 => ident("d0"),
            r => call(
                format!("getIndexFromCoords{r}D"),
                vec![
                    construct(ShaderType::coords(r), (0..r).map(|i| ident(format!("d{i}"))).collect()),
                    uniform(&shape_uniform(name)),
                ],
            ),
        };
        let direct_read = if rank == 0 {
            construct(value_ty, vec![index(ident(name.clone()), int(0))])
        } else {
            self.read(operand, flat)
        };
        fns.push(Function::new(format!("get{cap}"), params, Some(value_ty), vec![Stmt::ret(direct_read)]));

        fns.push(Function::new(
            format!("get{cap}ByIndex"),
            vec![Param::new("index", ShaderType::I32)],
            Some(value_ty),
            vec![Stmt::ret(construct(value_ty, vec![index(ident(name.clone()), ident("index"))]))],
        ));

        let out_rank = self.out_rank();
        if rank > out_rank {
            return fns;
        }
        let fast_path = operand.shape == self.output.shape && self.program.is_flat();
        let at_out_coords = if fast_path {
            vec![Stmt::ret(self.read(
                operand,
                call("getOutputIndexFromCoords", vec![ident("coordsIn")]),
            ))]
        } else if rank == 0 {
            vec![Stmt::ret(call(format!("get{cap}"), Vec::new()))]
        } else {
            let broadcast = broadcast_dims(&operand.shape, &self.output.shape);
            let mut body = Vec::new();
            let coords = if broadcast.is_empty() {
                ident("coordsIn")
            } else {
                body.push(Stmt::var("coords", self.out_coords(), ident("coordsIn")));
                for axis in broadcast {
                    let target = if out_rank <= 1 {
                        ident("coords")
                    } else {
                        member(ident("coords"), COMPONENTS[axis])
                    };
                    body.push(Stmt::assign(target, int(0)));
                }
                ident("coords")
            };
            let args: Vec<Expr> = if out_rank <= 1 {
                vec![coords]
            } else {
                (out_rank - rank..out_rank)
                    .map(|i| member(coords.clone(), COMPONENTS[i]))
                    .collect()
            };
            body.push(Stmt::ret(call(format!("get{cap}"), args)));
            body
        };
        fns.push(Function::new(
            format!("get{cap}AtOutCoords"),
            vec![Param::new("coordsIn", self.out_coords())],
            Some(value_ty),
            at_out_coords,
        ));

        let by_output_index = if fast_path {
            Stmt::ret(construct(value_ty, vec![index(ident(name.clone()), ident("globalIndex"))]))
        } else {
            let mut flat_index = ident("globalIndex");
            if self.vec4 {
                flat_index = binary(BinaryOp::Mul, flat_index, int(4));
            }
            Stmt::ret(call(
                format!("get{cap}AtOutCoords"),
                vec![call("getCoordsFromIndex", vec![flat_index])],
            ))
        };
        fns.push(Function::new(
            format!("get{cap}ByOutputIndex"),
            vec![Param::new("globalIndex", ShaderType::I32)],
            Some(value_ty),
            vec![by_output_index],
        ));
        fns
    }

    fn writer_fns(&self) -> Vec<Function> {
        let storage = self.storage_type(self.output.dtype);
        let mut fns = Vec::with_capacity(4);
        for (suffix, scalar) in [("", ScalarType::F32), ("I32", ScalarType::I32)] {
            fns.push(Function::new(
                format!("setOutputAtIndex{suffix}"),
                vec![
                    Param::new("flatIndex", ShaderType::I32),
                    Param::new("value", self.value_type(scalar)),
                ],
                None,
                vec![Stmt::assign(
                    index(ident(OUTPUT_NAME), ident("flatIndex")),
                    construct(storage, vec![ident("value")]),
                )],
            ));
        }
        let rank = self.out_rank().max(1);
        for (suffix, scalar) in [("", ScalarType::F32), ("I32", ScalarType::I32)] {
            let mut params: Vec<Param> = (0..rank).map(|i| Param::new(format!("d{i}"), ShaderType::I32)).collect();
            params.push(Param::new("value", self.value_type(scalar)));
            let coords = if rank == 1 {
                ident("d0")
            } else {
                construct(self.out_coords(), (0..rank).map(|i| ident(format!("d{i}"))).collect())
            };
            let mut flat = ident("flatIndex");
            if self.vec4 {
                flat = binary(BinaryOp::Div, flat, int(4));
            }
            fns.push(Function::new(
                format!("setOutputAtCoords{suffix}"),
                params,
                None,
                vec![
                    Stmt::let_(
                        "flatIndex",
                        ShaderType::I32,
                        call("getOutputIndexFromCoords", vec![coords]),
                    ),
                    Stmt::Expr(call(format!("setOutputAtIndex{suffix}"), vec![flat, ident("value")])),
                ],
            ));
        }
        fns
    }

    fn entry_body(&self) -> Vec<Stmt> {
        match self.program.entry() {
            EntryKind::Elementwise => {
                let args = self
                    .inputs
                    .iter()
                    .map(|input| {
                        call(format!("get{}ByOutputIndex", capitalize(&input.name)), vec![ident("index")])
                    })
                    .collect();
                vec![
                    Stmt::let_("index", ShaderType::I32, call("getGlobalIndex", Vec::new())),
                    Stmt::If {
                        cond: binary(BinaryOp::Lt, ident("index"), uniform("size")),
                        then: vec![Stmt::Expr(call(
                            "setOutputAtIndex",
                            vec![ident("index"), call("operation", args)],
                        ))],
                    },
                ]
            }
            EntryKind::Main if self.program.is_flat() => {
                vec![Stmt::Expr(call("userMain", vec![call("getGlobalIndex", Vec::new())]))]
            }
            EntryKind::Main => vec![Stmt::Expr(call("userMain", Vec::new()))],
        }
    }
}

fn isnan_fn() -> Function {
    let val = || ident("val");
    let is_false = |op| Stmt::If {
        cond: binary(op, val(), float(0.0)),
        then: vec![Stmt::ret(Expr::Bool(false))],
    };
    Function::new(
        "isnanCustom",
        vec![Param::new("val", ShaderType::F32)],
        Some(ShaderType::BOOL),
        vec![
            is_false(BinaryOp::Gt),
            is_false(BinaryOp::Lt),
            is_false(BinaryOp::Eq),
            Stmt::ret(Expr::Bool(true)),
        ],
    )
}

fn isnan_vec4_fn() -> Function {
    let parts = COMPONENTS
        .iter()
        .map(|c| call("isnanCustom", vec![member(ident("val"), *c)]))
        .collect();
    Function::new(
        "isnanCustomVec4",
        vec![Param::new("val", ShaderType::Vector(4, ScalarType::F32))],
        Some(ShaderType::Vector(4, ScalarType::Bool)),
        vec![Stmt::ret(construct(ShaderType::Vector(4, ScalarType::Bool), parts))],
    )
}

/// Integer division with floor semantics for operands of opposite sign.
fn idiv_fn() -> Function {
    Function::new(
        "idiv",
        vec![
            Param::new("a", ShaderType::I32),
            Param::new("b", ShaderType::I32),
            Param::new("signValue", ShaderType::F32),
        ],
        Some(ShaderType::I32),
        vec![
            Stmt::var("res", ShaderType::I32, binary(BinaryOp::Div, ident("a"), ident("b"))),
            Stmt::let_("modulo", ShaderType::I32, binary(BinaryOp::Rem, ident("a"), ident("b"))),
            Stmt::If {
                cond: binary(
                    BinaryOp::And,
                    binary(BinaryOp::Lt, ident("signValue"), float(0.0)),
                    binary(BinaryOp::Ne, ident("modulo"), int(0)),
                ),
                then: vec![Stmt::assign(ident("res"), binary(BinaryOp::Sub, ident("res"), int(1)))],
            },
            Stmt::ret(ident("res")),
        ],
    )
}

fn in_bounds_fn(rank: usize) -> Function {
    let ty = ShaderType::coords(rank);
    let checks = if rank == 1 {
        vec![
            binary(BinaryOp::Ge, ident("coord"), int(0)),
            binary(BinaryOp::Lt, ident("coord"), ident("shape")),
        ]
    } else {
        COMPONENTS[..rank]
            .iter()
            .flat_map(|c| {
                [
                    binary(BinaryOp::Ge, member(ident("coord"), *c), int(0)),
                    binary(BinaryOp::Lt, member(ident("coord"), *c), member(ident("shape"), *c)),
                ]
            })
            .collect()
    };
    Function::new(
        format!("coordsInBounds{rank}D"),
        vec![Param::new("coord", ty), Param::new("shape", ty)],
        Some(ShaderType::BOOL),
        vec![Stmt::ret(fold(BinaryOp::And, checks, Expr::Bool(true)))],
    )
}

fn index_from_coords_fn(rank: usize) -> Function {
    let ty = ShaderType::coords(rank);
    let value = if rank == 1 {
        ident("coords")
    } else {
        let terms = (0..rank)
            .map(|i| {
                let extent = fold(
                    BinaryOp::Mul,
                    COMPONENTS[i + 1..rank]
                        .iter()
                        .map(|c| member(ident("shape"), *c))
                        .collect(),
                    int(1),
                );
                let coord = member(ident("coords"), COMPONENTS[i]);
                if i + 1 == rank {
                    coord
                } else {
                    binary(BinaryOp::Mul, coord, extent)
                }
            })
            .collect();
        fold(BinaryOp::Add, terms, int(0))
    };
    Function::new(
        format!("getIndexFromCoords{rank}D"),
        vec![Param::new("coords", ty), Param::new("shape", ty)],
        Some(ShaderType::I32),
        vec![Stmt::ret(value)],
    )
}

/// Uniform shape member name of an operand: `A` -> `aShape`.
pub fn shape_uniform(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{}Shape", first.to_ascii_lowercase(), chars.as_str()),
        None => "Shape".to_string(),
    }
}

pub fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => String::new(),
    }
}
