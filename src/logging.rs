//! Thin `log`-crate wrapper helpers, giving pool/parse/sync log sites a
//! consistent target name instead of each module's own `module_path!()`.

/// Target string used by every `log::` call site in this crate.
pub const TARGET: &str = "mpipe";

macro_rules! trace {
    ($($arg:tt)+) => { log::trace!(target: crate::logging::TARGET, $($arg)+) };
}

macro_rules! debug {
    ($($arg:tt)+) => { log::debug!(target: crate::logging::TARGET, $($arg)+) };
}

macro_rules! warn {
    ($($arg:tt)+) => { log::warn!(target: crate::logging::TARGET, $($arg)+) };
}

pub(crate) use debug;
pub(crate) use trace;
pub(crate) use warn;
