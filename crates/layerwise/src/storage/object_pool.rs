//! Recycles tensor headers independently of their buffers.

use std::collections::{HashMap, VecDeque};

use crate::tensor::{DType, Shape, TensorHeader};

/// FIFO queues of spare [`TensorHeader`]s, one per element type.
///
/// Headers are reshape-able, so the shape of a returned header does not
/// matter when it is handed out again.
#[derive(Debug, Default)]
pub struct TensorObjectPool {
    queues: HashMap<DType, VecDeque<TensorHeader>>,
}

impl TensorObjectPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a header of `dtype` retargeted to `shape`.
    pub fn adopt(&mut self, shape: &Shape, dtype: DType) -> TensorHeader {
        match self.queues.get_mut(&dtype).and_then(VecDeque::pop_front) {
            Some(mut header) => {
                header.reshape(shape);
                header
            }
            None => TensorHeader::new(shape.clone(), dtype),
        }
    }

    pub fn release(&mut self, header: TensorHeader) {
        self.queues
            .entry(header.dtype())
            .or_default()
            .push_back(header);
    }

    pub fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispose(&mut self) {
        self.queues.clear();
    }
}
