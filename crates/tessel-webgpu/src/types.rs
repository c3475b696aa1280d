use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor as seen by callers.
///
/// Only `Float32` and `Int32` have device storage of their own. `Bool` is stored as
/// `i32`, and `Complex64` tensors are a pair of `Float32` records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    Float32,
    Int32,
    Bool,
    Complex64,
}

impl DataType {
    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Complex64 => 8,
            _ => 4,
        }
    }

    pub fn storage(self) -> Option<StorageType> {
        match self {
            DataType::Float32 => Some(StorageType::F32),
            DataType::Int32 | DataType::Bool => Some(StorageType::I32),
            DataType::Complex64 => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Float32 => "float32",
            DataType::Int32 => "int32",
            DataType::Bool => "bool",
            DataType::Complex64 => "complex64",
        };
        f.write_str(name)
    }
}

/// Scalar type a buffer element is stored as on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageType {
    F32,
    I32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShadingTarget {
    Glsl,
    #[default]
    Wgsl,
}

impl ShadingTarget {
    /// Name of the compute entry point emitted for this target.
    pub fn entry_point(self) -> &'static str {
        match self {
            ShadingTarget::Glsl => "main",
            ShadingTarget::Wgsl => "_start",
        }
    }
}

impl fmt::Display for ShadingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadingTarget::Glsl => f.write_str("glsl"),
            ShadingTarget::Wgsl => f.write_str("wgsl"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Vectorization {
    #[default]
    Scalar,
    Vec4,
}

impl Vectorization {
    pub fn width(self) -> usize {
        match self {
            Vectorization::Scalar => 1,
            Vectorization::Vec4 => 4,
        }
    }
}

/// How the generated entry point hands control to the program body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// The body defines `operation(..)`; the entry samples every operand at the
    /// global index and writes the result.
    Elementwise,
    /// The body defines `userMain(index)` for flat layouts or `userMain()` otherwise.
    #[default]
    Main,
}
