//! Block-level compute pipelines: the engines a kernel driver steers across
//! the output grid.

mod gemm;
mod preload;
mod pv;
mod qk;
mod ring;
mod w8a16;

pub use gemm::{BlockArgs, BlockGemm};
pub use preload::BlockGemmPreload;
pub use pv::BlockPv;
pub use qk::{AttnConfig, BlockQk, KvTile};
pub use ring::StageRing;
pub use w8a16::{DequantB, DequantConfig};
