//! The desired token buffer, the mirror of the native cache, and the
//! synchronizer that reconciles the two.

mod buffer;
mod cache;
mod sync;

pub use buffer::PointerArray;
pub use cache::{CellTransform, KvCacheState};
pub use sync::{evaluate, sync, ShiftOp, SyncReport};
