use crate::arch::PoolKind;
use thiserror::Error;

/// Errors surfaced at the host boundary.
///
/// Everything here is detectable before or during launch setup. Misuse inside
/// a running core program (unbalanced events, stale reads) is a programming
/// error and panics the core instead; the launcher reports those panics as
/// [`LaunchError::CoreFault`].
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("scratch pool {pool:?} over capacity: need {needed} bytes, have {capacity}")]
    ScratchOverflow {
        pool: PoolKind,
        needed: u32,
        capacity: u32,
    },

    #[error("invalid tile configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("core {core} faulted: {message}")]
    CoreFault { core: String, message: String },
}
