//! Shape and dispatch math shared by the shader generator and the orchestrator.
//!
//! The host-side index helpers at the bottom mirror the arithmetic that the generated
//! shader functions perform, so the two can be checked against each other.

use crate::error::{KernelError, KernelResult};
use std::fmt;

/// Vector component names, in axis order.
pub const COMPONENTS: [&str; 4] = ["x", "y", "z", "w"];

/// Highest tensor rank the generated helpers can address.
pub const MAX_RANK: usize = 4;

/// Assignment of output axes to the three dispatch dimensions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DispatchLayout {
    pub x: Vec<usize>,
    pub y: Vec<usize>,
    pub z: Vec<usize>,
}

impl DispatchLayout {
    /// Every axis of a rank-`rank` output on the x dimension, in order.
    pub fn flat(rank: usize) -> Self {
        Self {
            x: (0..rank).collect(),
            y: Vec::new(),
            z: Vec::new(),
        }
    }

    pub fn new(x: Vec<usize>, y: Vec<usize>, z: Vec<usize>) -> Self {
        Self { x, y, z }
    }

    pub fn is_flat(&self, rank: usize) -> bool {
        self.y.is_empty() && self.z.is_empty() && self.x.iter().copied().eq(0..rank)
    }

    pub fn dims(&self) -> [&[usize]; 3] {
        [&self.x, &self.y, &self.z]
    }

    /// Every axis of the output must appear exactly once across x, y and z.
    pub fn validate(&self, rank: usize) -> KernelResult<()> {
        if rank > MAX_RANK {
            return Err(KernelError::UnsupportedRank {
                rank,
                context: "dispatch layout",
            });
        }
        let mut seen = [false; MAX_RANK];
        for &axis in self.x.iter().chain(&self.y).chain(&self.z) {
            if axis >= rank || seen[axis] {
                return Err(KernelError::UnsupportedLayout(format!(
                    "{self} is not a partition of the axes of a rank-{rank} output"
                )));
            }
            seen[axis] = true;
        }
        if seen.iter().take(rank).any(|s| !s) {
            return Err(KernelError::UnsupportedLayout(format!(
                "{self} leaves axes of a rank-{rank} output unassigned"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DispatchLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{:?}y{:?}z{:?}", self.x, self.y, self.z)
    }
}

pub fn size_from_shape(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides excluding the innermost (always 1) stride.
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let rank = shape.len();
    if rank < 2 {
        return Vec::new();
    }
    let mut strides = vec![0usize; rank - 1];
    strides[rank - 2] = shape[rank - 1];
    for i in (0..rank - 2).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Workgroup counts needed to cover `output_shape` under `layout`.
///
/// Each dimension covers the product of the output extents assigned to it; dimensions
/// with no assigned axes count as 1.
pub fn compute_dispatch(
    layout: &DispatchLayout,
    output_shape: &[usize],
    workgroup_size: [u32; 3],
    elements_per_thread: [u32; 3],
) -> [u32; 3] {
    let mut dispatch = [1u32; 3];
    for (dim, axes) in layout.dims().iter().enumerate() {
        let extent: u64 = axes
            .iter()
            .map(|&axis| output_shape.get(axis).copied().unwrap_or(1) as u64)
            .product();
        let per_group = u64::from(workgroup_size[dim].max(1)) * u64::from(elements_per_thread[dim].max(1));
        let groups = extent.div_ceil(per_group);
        dispatch[dim] = u32::try_from(groups).unwrap_or(u32::MAX);
    }
    dispatch
}

/// Bring an oversized dispatch back under `limit` per dimension.
///
/// Only layouts that put everything on x can be folded: the count is first spread over
/// a square `[s, s, 1]` and, if that is still too large, a cube `[c, c, c]`. Programs
/// recover their flat position through `getGlobalIndex()` and bounds-check against
/// the logical size, so the surplus threads are harmless.
pub fn reshape_dispatch(
    layout: &DispatchLayout,
    dispatch: [u32; 3],
    limit: u32,
) -> KernelResult<[u32; 3]> {
    if dispatch.iter().all(|&d| d <= limit) {
        return Ok(dispatch);
    }
    let too_large = KernelError::DispatchTooLarge { dispatch, limit };
    if !layout.y.is_empty() || !layout.z.is_empty() {
        return Err(too_large);
    }
    let total: u64 = dispatch.iter().map(|&d| u64::from(d)).product();
    let side = ceil_root(total, 2);
    if side <= u64::from(limit) {
        return Ok([side as u32, side as u32, 1]);
    }
    let side = ceil_root(total, 3);
    if side <= u64::from(limit) {
        return Ok([side as u32, side as u32, side as u32]);
    }
    Err(too_large)
}

fn ceil_root(n: u64, k: u32) -> u64 {
    if n <= 1 {
        return n;
    }
    let mut root = (n as f64).powf(1.0 / f64::from(k)).ceil() as u64;
    while root > 1 && (root - 1).checked_pow(k).map_or(false, |p| p >= n) {
        root -= 1;
    }
    while root.checked_pow(k).map_or(false, |p| p < n) {
        root += 1;
    }
    root
}

/// Output-relative axes along which an input of `in_shape` is broadcast to `out_shape`.
///
/// Shapes are right-aligned; an axis broadcasts when the input extent is 1 and the
/// output extent is larger.
pub fn broadcast_dims(in_shape: &[usize], out_shape: &[usize]) -> Vec<usize> {
    let in_rank = in_shape.len();
    let out_rank = out_shape.len();
    let mut dims = Vec::new();
    for i in 0..in_rank.min(out_rank) {
        let in_axis = in_rank - 1 - i;
        let out_axis = out_rank - 1 - i;
        if in_shape[in_axis] == 1 && out_shape[out_axis] > 1 {
            dims.push(out_axis);
        }
    }
    dims.reverse();
    dims
}

/// Product of output extents named by `axes`, as referenced from generated code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SymbolicStride {
    pub axes: Vec<usize>,
}

impl SymbolicStride {
    pub fn render(&self, variable: &str) -> String {
        if self.axes.is_empty() {
            return "1".to_string();
        }
        let terms: Vec<String> = self
            .axes
            .iter()
            .map(|&axis| format!("{variable}.{}", COMPONENTS[axis]))
            .collect();
        terms.join(" * ")
    }
}

/// Strides over the output axes listed in `axis_indices`, innermost last.
///
/// The stride of entry `i` is the product of the extents of the entries after it.
pub fn symbolic_strides(axis_indices: &[usize]) -> KernelResult<Vec<SymbolicStride>> {
    if let Some(&axis) = axis_indices.iter().find(|&&axis| axis >= MAX_RANK) {
        return Err(KernelError::UnsupportedRank {
            rank: axis + 1,
            context: "symbolic strides",
        });
    }
    Ok((0..axis_indices.len())
        .map(|i| SymbolicStride {
            axes: axis_indices[i + 1..].to_vec(),
        })
        .collect())
}

/// Host model of `getCoordsFromIndex`.
pub fn coords_from_index(index: usize, shape: &[usize]) -> Vec<usize> {
    match shape.len() {
        0 => return Vec::new(),
        1 => return vec![index],
        _ => {}
    }
    let strides = compute_strides(shape);
    let mut remainder = index;
    let mut coords = Vec::with_capacity(shape.len());
    for stride in strides {
        coords.push(remainder / stride);
        remainder -= (remainder / stride) * stride;
    }
    coords.push(remainder);
    coords
}

/// Host model of `getIndexFromCoordsND`.
pub fn index_from_coords(coords: &[usize], shape: &[usize]) -> usize {
    let strides = compute_strides(shape);
    let mut index = coords.last().copied().unwrap_or(0);
    for (coord, stride) in coords.iter().zip(strides) {
        index += coord * stride;
    }
    index
}

/// Host model of the broadcast-aware `get<X>AtOutCoords` sampler: the flat index into
/// an input of `in_shape` read for output coordinate `out_coords`.
pub fn broadcast_source_index(in_shape: &[usize], out_shape: &[usize], out_coords: &[usize]) -> usize {
    if in_shape.is_empty() {
        return 0;
    }
    let mut coords = out_coords.to_vec();
    for axis in broadcast_dims(in_shape, out_shape) {
        coords[axis] = 0;
    }
    let trailing = &coords[coords.len() - in_shape.len()..];
    index_from_coords(trailing, in_shape)
}
