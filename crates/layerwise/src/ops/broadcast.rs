//! Numpy-style broadcasting helpers shared by shape inference, kernels and
//! constant rewrites.

/// Broadcast result of two dimension lists, `None` when incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for axis in 0..rank {
        let da = dim_from_end(a, rank - 1 - axis);
        let db = dim_from_end(b, rank - 1 - axis);
        out[axis] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

fn dim_from_end(dims: &[usize], from_end: usize) -> usize {
    if from_end < dims.len() {
        dims[dims.len() - 1 - from_end]
    } else {
        1
    }
}

/// Maps linear output positions onto positions of a broadcast input.
#[derive(Debug, Clone)]
pub struct BroadcastMap {
    out_dims: Vec<usize>,
    /// Input stride per output axis; zero along broadcast axes.
    strides: Vec<usize>,
    identity: bool,
}

impl BroadcastMap {
    /// `input` must be broadcast-compatible with `out`.
    pub fn new(input: &[usize], out: &[usize]) -> Self {
        let rank = out.len();
        let offset = rank - input.len().min(rank);
        let mut strides = vec![0; rank];
        let mut running = 1usize;
        for axis in (0..rank).rev() {
            if axis < offset {
                continue;
            }
            let dim = input[axis - offset];
            if dim != 1 {
                strides[axis] = running;
            }
            running *= dim;
        }
        let identity = input == out;
        Self {
            out_dims: out.to_vec(),
            strides,
            identity,
        }
    }

    /// Input offset feeding output position `linear`.
    pub fn offset(&self, linear: usize) -> usize {
        if self.identity {
            return linear;
        }
        let mut rem = linear;
        let mut offset = 0;
        for axis in (0..self.out_dims.len()).rev() {
            let dim = self.out_dims[axis];
            if dim == 0 {
                return 0;
            }
            offset += (rem % dim) * self.strides[axis];
            rem /= dim;
        }
        offset
    }
}

/// Applies `f` elementwise over two broadcast operands.
pub fn broadcast_binary<T: Copy>(
    a: &[T],
    a_dims: &[usize],
    b: &[T],
    b_dims: &[usize],
    f: impl Fn(T, T) -> T,
) -> Option<(Vec<T>, Vec<usize>)> {
    let out_dims = broadcast_shapes(a_dims, b_dims)?;
    let len: usize = out_dims.iter().product();
    let a_map = BroadcastMap::new(a_dims, &out_dims);
    let b_map = BroadcastMap::new(b_dims, &out_dims);
    let values = (0..len)
        .map(|idx| f(a[a_map.offset(idx)], b[b_map.offset(idx)]))
        .collect();
    Some((values, out_dims))
}
