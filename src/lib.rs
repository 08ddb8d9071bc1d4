pub mod engine;
pub mod error;
pub mod mtr;
pub mod pool;
pub mod primitives;
pub mod tablespace;
pub mod types;

pub use crate::engine::{EngineConfig, StorageEngine};
pub use crate::error::{BrasaError, Result};
pub use crate::mtr::MiniTxn;
pub use crate::pool::{BufferPool, BufferPools, GetMode, LatchMode, PoolOptions};
pub use crate::types::{Lsn, PageId, PageNo, SpaceId};
