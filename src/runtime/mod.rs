pub mod config;
pub mod context;
pub mod dispatch;
pub mod kernels;
pub mod memory;
pub mod split;
pub mod uniform;

pub use config::{ExitHandler, RuntimeConfig};
pub use context::Context;
pub use kernels::{Granularity, KernelKind, KernelLibrary};
