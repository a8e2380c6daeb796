use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(#[from] io::Error),
    #[error("WAL writer shut down")]
    WriterShutDown,
    #[error("{table} {id} already exists")]
    Duplicate { table: &'static str, id: u64 },
    #[error("invalid {table} row: {reason}")]
    InvalidRow {
        table: &'static str,
        reason: &'static str,
    },
    #[cfg(test)]
    #[error("injected commit failure")]
    Injected,
}
