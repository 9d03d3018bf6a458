// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown column family {0}")]
    CfName(String),
    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("Codec {0}")]
    Codec(#[from] bincode::Error),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = result::Result<T, Error>;
