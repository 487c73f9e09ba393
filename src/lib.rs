// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # FPGA Device Access Layer
//!
//! This crate provides the handle layer of a userspace FPGA access library:
//! opening and closing sessions on FPGA devices and accelerator ports, and
//! tracking the resources each session owns.
//!
//! ## What a handle owns
//!
//! - The device file descriptor (exclusive or shared)
//! - An optional auxiliary driver channel
//! - A table of mapped MMIO regions
//! - A table of pinned workspaces
//! - A NUMA affinity snapshot (with the `numa` feature)
//!
//! Everything is released together when the handle is closed or dropped.
//!
//! ## Platform Support
//!
//! | Platform | Device access | NUMA affinity |
//! |----------|---------------|---------------|
//! | Linux    | Supported     | Supported on multi-node systems |
//! | Other    | Not available | Not available |
//!
//! On non-Linux targets every open fails with [`FpgaError::NoDriver`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use fpga_access::{FpgaError, Handle, ObjectType, OpenFlags, Token};
//!
//! fn main() -> Result<(), FpgaError> {
//!     let token = Token::new(
//!         ObjectType::Accelerator,
//!         0,
//!         "/dev/intel-fpga-port.0",
//!         "/sys/class/fpga/intel-fpga-dev.0/intel-fpga-port.0",
//!     );
//!
//!     // Exclusive access; a second open of the same port returns Busy
//!     let handle = Handle::open(&token, OpenFlags::empty())?;
//!     println!("opened {} as handle {}", handle.token(), handle.id());
//!
//!     let report = handle.close()?;
//!     assert!(report.is_clean());
//!     Ok(())
//! }
//! ```
//!
//! ## Requirements
//!
//! - Linux with the FPGA port driver loaded (`/dev/intel-fpga-port.*`)
//! - Read/write permission on the device file

pub mod error;
pub mod handle;
pub mod numa;
pub mod registry;
pub mod sys;
pub mod token;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use error::{open_error_code, FpgaError, FpgaResult, ResultCode};
pub use handle::{Handle, HandleGuard, HandleId, OpenFlags, ReleaseReport};
pub use numa::{AffinityMasks, NodeMask, NumaSnapshot};
pub use registry::{MmioId, MmioRegion, Registry, Resource, ResourceId, Workspace, WorkspaceId};
pub use sys::{default_platform, AccessMode, DeviceFd, NumaControl, Platform};
pub use token::{ObjectType, Token, TOKEN_MAGIC};
