//! Concrete and symbolic tensor shapes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Maximum number of axes a tensor may carry.
pub const MAX_RANK: usize = 8;

/// Stores the concrete dimensions of a runtime tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Constructs a new shape from the provided dimensions.
    ///
    /// Panics if the rank exceeds [`MAX_RANK`]. An empty dimension list is a scalar.
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        let dims = dims.into();
        assert!(
            dims.len() <= MAX_RANK,
            "shape rank {} exceeds the maximum of {MAX_RANK}",
            dims.len()
        );
        Shape { dims }
    }

    /// Rank-0 shape holding exactly one element.
    pub fn scalar() -> Self {
        Shape { dims: Vec::new() }
    }

    /// Borrow the raw dimension slice for downstream calculations.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Returns the rank (number of axes) of the shape.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Extent of an axis, accepting negative indices counted from the end.
    pub fn dim(&self, axis: isize) -> Option<usize> {
        let axis = normalize_axis(axis, self.rank())?;
        self.dims.get(axis).copied()
    }

    /// Row-major strides in elements.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1usize; self.dims.len()];
        for axis in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.dims[axis + 1];
        }
        strides
    }

    /// Overwrites the dimensions in place, reusing the existing allocation.
    pub fn assign(&mut self, dims: &[usize]) {
        assert!(dims.len() <= MAX_RANK, "shape rank exceeds {MAX_RANK}");
        self.dims.clear();
        self.dims.extend_from_slice(dims);
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ")")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

/// Resolves a possibly negative axis against a rank.
pub fn normalize_axis(axis: isize, rank: usize) -> Option<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return None;
    }
    Some(resolved as usize)
}

/// Represents a single axis extent in a declared input shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimension {
    Static(usize),
    Dynamic(String),
}

/// Declared shape of a graph input; dynamic axes are named symbols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolicShape {
    dims: Vec<Dimension>,
}

impl SymbolicShape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Fully static symbolic shape.
    pub fn fixed(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().copied().map(Dimension::Static).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    /// Returns static dimensions when all dims are static.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            match dim {
                Dimension::Static(value) => dims.push(*value),
                Dimension::Dynamic(_) => return None,
            }
        }
        Some(dims)
    }

    /// Checks a concrete shape against the declaration; dynamic axes match anything.
    pub fn accepts(&self, shape: &Shape) -> bool {
        if self.rank() != shape.rank() {
            return false;
        }
        self.dims
            .iter()
            .zip(shape.dims())
            .all(|(declared, actual)| match declared {
                Dimension::Static(value) => value == actual,
                Dimension::Dynamic(_) => true,
            })
    }
}
