//! BLAS routines offloaded to the VideoCore VI V3D accelerator.
//!
//! Each routine hands the largest evenly divisible prefix of its input to a
//! precompiled QPU kernel and computes the tail on the CPU while the job runs.
//! Operands the accelerator touches must live in memory from [`support::malloc`].

pub mod blas;
pub mod drm;
pub mod error;
pub mod runtime;
pub mod support;
pub mod utils;

pub use blas::{Layout, Transpose};
pub use error::{BlasError, BlasResult, ErrorKind};
pub use runtime::{Context, KernelKind, KernelLibrary, RuntimeConfig};
