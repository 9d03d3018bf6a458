// Copyright 2026 Kestrel Project Authors. Licensed under Apache-2.0.

//! Small shared utilities: the background worker harness and
//! human-readable configuration value wrappers.

pub mod config;
pub mod worker;

/// Boxes an error message into a `Box<dyn Error>` suitable for `Other`
/// error variants.
#[macro_export]
macro_rules! box_err {
    ($e:expr) => ({
        let e: Box<dyn std::error::Error + Sync + Send> = format!("[{}:{}]: {}", file!(), line!(), $e).into();
        e.into()
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::box_err!(format!($f, $($arg),+))
    });
}
