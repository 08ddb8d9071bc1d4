use std::io;
use thiserror::Error;

use crate::types::{PageId, SpaceId};

pub type Result<T> = std::result::Result<T, BrasaError>;

#[derive(Debug, Error)]
pub enum BrasaError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("tablespace {0} has been deleted")]
    TablespaceDeleted(SpaceId),
    #[error("page {0} is corrupted")]
    PageCorrupted(PageId),
    #[error("page {0} could not be decrypted")]
    DecryptionFailed(PageId),
    #[error("buffer pool exhausted: no free frame within scan depth")]
    PoolExhausted,
    #[error("wait array has no free cell; raise max_threads or sync_array_size")]
    NoFreeCell,
    #[error("semaphore wait exceeded the fatal threshold")]
    FatalSemaphoreWait,
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error("invalid configuration: {0}")]
    Config(String),
}
