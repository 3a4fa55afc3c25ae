//! Kernel drivers: the programs a launch runs on the matrix and vector
//! cores. Each driver pairs a scheduler with one or more block engines and
//! owns the cross-core protocol of its pipeline.

mod attention;
mod optimized;
mod padding;
mod splitk;
mod w8a16;

pub use attention::{AttentionParams, KvCache, MlaAttention};
pub use optimized::{MatmulParams, OptimizedMatmul};
pub use padding::{PaddingMatmul, PaddingParams};
pub use splitk::{ReduceAdd, SplitkMatmul, SplitkParams};
pub use w8a16::{W8a16Matmul, W8a16Params};
