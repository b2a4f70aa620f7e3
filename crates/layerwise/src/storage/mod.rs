//! Tensor lifetimes and pooled allocation.
//!
//! The [`StorageManager`] owns every tensor that is live during a run. It is
//! backed by a best-fit [`BufferPool`] per memory space and a
//! [`TensorObjectPool`] for headers.

mod buffer_pool;
mod manager;
mod object_pool;

pub use buffer_pool::BufferPool;
pub use manager::{StorageManager, StorageStats};
pub use object_pool::TensorObjectPool;
