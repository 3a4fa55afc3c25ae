pub mod arch;
pub mod conv;
pub mod coord;
pub mod device;
pub mod epilogue;
pub mod error;
pub mod gemm;
pub mod gemv;
pub mod layout;

pub use arch::ArchSpec;
pub use device::{launch, DeviceKernel, GmTensor, LaunchGeometry};
pub use error::LaunchError;
pub use gemm::kernel::{MatmulParams, OptimizedMatmul};
pub use gemm::TileConfig;

#[cfg(test)]
pub(crate) mod test_utils;
