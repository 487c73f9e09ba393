// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Device tokens.
//!
//! A token describes one discoverable FPGA resource: the character device
//! that grants access to it and the sysfs directory holding its metadata.
//! Tokens are produced by enumeration and are read-only here; a handle only
//! borrows the token it was opened from.

use crate::error::{FpgaError, FpgaResult};
use std::path::{Path, PathBuf};

/// Validity tag stamped on every genuine token.
pub const TOKEN_MAGIC: u64 = 0x4650_4741_544b_4e40;

/// Kind of FPGA resource a token refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    /// The FPGA device itself (management function, e.g. `intel-fpga-fme.0`).
    Device,
    /// An accelerator slot on the device (e.g. `intel-fpga-port.0`).
    Accelerator,
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device => write!(f, "device"),
            Self::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Descriptor of a discoverable FPGA resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    object_type: ObjectType,
    instance: u32,
    devpath: PathBuf,
    sysfspath: PathBuf,
    magic: u64,
}

impl Token {
    /// Create a valid token.
    ///
    /// # Arguments
    ///
    /// * `object_type` - Device or accelerator
    /// * `instance` - Instance number among resources of the same type
    /// * `devpath` - Character device (e.g. `/dev/intel-fpga-port.0`)
    /// * `sysfspath` - Sysfs directory of the resource
    pub fn new(
        object_type: ObjectType,
        instance: u32,
        devpath: impl Into<PathBuf>,
        sysfspath: impl Into<PathBuf>,
    ) -> Self {
        Self::from_parts(TOKEN_MAGIC, object_type, instance, devpath, sysfspath)
    }

    /// Rebuild a token received from outside this process.
    ///
    /// The tag is kept as given and checked whenever the token is used, so a
    /// corrupted or foreign token is rejected with
    /// [`FpgaError::InvalidParam`] instead of being trusted.
    pub fn from_parts(
        magic: u64,
        object_type: ObjectType,
        instance: u32,
        devpath: impl Into<PathBuf>,
        sysfspath: impl Into<PathBuf>,
    ) -> Self {
        Self {
            object_type,
            instance,
            devpath: devpath.into(),
            sysfspath: sysfspath.into(),
            magic,
        }
    }

    /// Check the validity tag.
    pub fn validate(&self) -> FpgaResult<()> {
        if self.magic != TOKEN_MAGIC {
            return Err(FpgaError::InvalidParam(format!(
                "invalid token for {} (tag {:#018x})",
                self.devpath.display(),
                self.magic
            )));
        }
        Ok(())
    }

    /// Returns true if the token carries the valid tag.
    pub fn is_valid(&self) -> bool {
        self.magic == TOKEN_MAGIC
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    /// Character device to open.
    pub fn devpath(&self) -> &Path {
        &self.devpath
    }

    /// Sysfs directory with the resource's metadata.
    pub fn sysfspath(&self) -> &Path {
        &self.sysfspath
    }

    pub fn magic(&self) -> u64 {
        self.magic
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{} ({})",
            self.object_type,
            self.instance,
            self.devpath.display()
        )
    }
}
