// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types and result codes for FPGA access operations.
//!
//! Every failure in this crate maps onto one [`ResultCode`]. The numeric
//! values match the C API of the original access library so codes can be
//! handed across an FFI boundary unchanged.

use std::io;
use std::path::Path;
use thiserror::Error;

/// Closed set of outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ResultCode {
    /// Operation completed successfully.
    Ok = 0,
    /// Invalid parameter (bad flags, foreign token, closed handle).
    InvalidParam = 1,
    /// Resource is held exclusively by someone else.
    Busy = 2,
    /// Internal failure with no direct OS cause.
    Exception = 3,
    /// Expected resource or state is absent.
    NotFound = 4,
    /// Allocation failed.
    NoMemory = 5,
    /// Device could not be opened for a reason other than access or busy.
    NoDriver = 7,
    /// Permission denied.
    NoAccess = 9,
}

impl ResultCode {
    /// Returns the code as its raw C value.
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns a human-readable name for the code.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidParam => "INVALID_PARAM",
            Self::Busy => "BUSY",
            Self::Exception => "EXCEPTION",
            Self::NotFound => "NOT_FOUND",
            Self::NoMemory => "NO_MEMORY",
            Self::NoDriver => "NO_DRIVER",
            Self::NoAccess => "NO_ACCESS",
        }
    }

    /// Fold a result into its outcome code.
    pub fn of<T>(result: &FpgaResult<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => e.code(),
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

/// Errors that can occur during FPGA access operations.
#[derive(Debug, Error)]
pub enum FpgaError {
    /// Invalid argument provided.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// Device or resource already held exclusively.
    #[error("resource busy: {0}")]
    Busy(String),

    /// Internal failure (e.g. a poisoned handle lock).
    #[error("internal failure: {0}")]
    Exception(String),

    /// Resource or state not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Allocation failed.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// Device could not be opened.
    #[error("no driver available: {0}")]
    NoDriver(String),

    /// Permission denied accessing the device.
    #[error("permission denied: {0}")]
    NoAccess(String),
}

impl FpgaError {
    /// The outcome code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InvalidParam(_) => ResultCode::InvalidParam,
            Self::Busy(_) => ResultCode::Busy,
            Self::Exception(_) => ResultCode::Exception,
            Self::NotFound(_) => ResultCode::NotFound,
            Self::NoMemory(_) => ResultCode::NoMemory,
            Self::NoDriver(_) => ResultCode::NoDriver,
            Self::NoAccess(_) => ResultCode::NoAccess,
        }
    }

    /// Map a failed device-file open onto the taxonomy.
    ///
    /// Permission failures become [`FpgaError::NoAccess`], an exclusively
    /// held device becomes [`FpgaError::Busy`] and everything else means no
    /// usable driver sits behind the path.
    pub fn from_open_error(err: &io::Error, path: &Path) -> Self {
        let context = format!("open({}) failed: {}", path.display(), err);
        match open_error_code(err) {
            ResultCode::NoAccess => Self::NoAccess(context),
            ResultCode::Busy => Self::Busy(context),
            _ => Self::NoDriver(context),
        }
    }
}

/// Outcome code for a device-file open failure.
pub fn open_error_code(err: &io::Error) -> ResultCode {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return ResultCode::NoAccess;
    }
    match err.raw_os_error() {
        Some(EACCES) | Some(EPERM) => ResultCode::NoAccess,
        Some(EBUSY) => ResultCode::Busy,
        _ => ResultCode::NoDriver,
    }
}

// POSIX values, identical on every Unix target this crate supports.
pub(crate) const EPERM: i32 = 1;
pub(crate) const EACCES: i32 = 13;
pub(crate) const EBUSY: i32 = 16;

/// Result type alias for FPGA access operations.
pub type FpgaResult<T> = Result<T, FpgaError>;
