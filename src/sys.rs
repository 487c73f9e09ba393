// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Operating system access.
//!
//! Everything a handle needs from the OS goes through the [`Platform`]
//! trait: opening and closing the device file, tearing down registered
//! mappings, and the optional NUMA capability. The default platform talks to
//! the real kernel; tests substitute an accounting double.
//!
//! # Platform Support
//!
//! ## Linux
//! FPGA resources appear as character devices such as
//! `/dev/intel-fpga-port.0`. Exclusive access is requested with `O_EXCL`;
//! the FPGA driver answers `EBUSY` while another descriptor holds the port.
//! NUMA affinity is read and restored through `get_mempolicy`,
//! `set_mempolicy` and `sched_{get,set}affinity`.
//!
//! ## Other platforms
//! Opening a device fails with `Unsupported`, which maps to
//! [`FpgaError::NoDriver`](crate::FpgaError::NoDriver).

use crate::numa::NodeMask;
use crate::registry::{MmioRegion, Workspace};
use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Device file descriptor held by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DeviceFd(i32);

impl DeviceFd {
    /// Wrap a raw descriptor.
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw descriptor for ioctl/mmap calls.
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

/// How the device file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Single owner; a second open fails with busy.
    Exclusive,
    /// Multiple handles may hold the device at once.
    Shared,
}

/// OS services used by the handle protocol.
pub trait Platform: Send + Sync {
    /// Open `path` read-write.
    fn open_device(&self, path: &Path, mode: AccessMode) -> io::Result<DeviceFd>;

    /// Close a descriptor returned by [`Platform::open_device`].
    ///
    /// The descriptor is gone afterwards even if an error is returned.
    fn close_device(&self, fd: DeviceFd) -> io::Result<()>;

    /// Tear down a registered MMIO mapping.
    fn unmap_mmio(&self, region: &MmioRegion) -> io::Result<()>;

    /// Tear down a registered workspace.
    fn release_workspace(&self, workspace: &Workspace) -> io::Result<()>;

    /// NUMA capability, absent when the system has no NUMA support.
    fn numa(&self) -> Option<&dyn NumaControl> {
        None
    }
}

/// NUMA affinity control for the calling thread.
pub trait NumaControl: Send + Sync {
    /// Nodes memory allocations are currently bound to.
    fn membind(&self) -> io::Result<NodeMask>;

    /// Nodes the calling thread may currently run on.
    fn run_node_mask(&self) -> io::Result<NodeMask>;

    fn set_membind(&self, mask: &NodeMask) -> io::Result<()>;

    fn set_run_node_mask(&self, mask: &NodeMask) -> io::Result<()>;

    /// Preferred node of the device whose sysfs directory is `sysfspath`.
    ///
    /// `Ok(None)` means the device has no node affinity.
    fn device_node(&self, sysfspath: &Path) -> io::Result<Option<u32>>;

    /// Hand back a mask obtained from [`NumaControl::membind`] or
    /// [`NumaControl::run_node_mask`].
    fn free_mask(&self, mask: NodeMask) {
        drop(mask);
    }
}

/// The process-wide platform for the running OS.
///
/// Capabilities such as NUMA support are probed once, on first use.
pub fn default_platform() -> Arc<dyn Platform> {
    static PLATFORM: OnceLock<Arc<dyn Platform>> = OnceLock::new();
    PLATFORM
        .get_or_init(|| {
            #[cfg(target_os = "linux")]
            let platform: Arc<dyn Platform> = Arc::new(linux_impl::LinuxPlatform::new());
            #[cfg(not(target_os = "linux"))]
            let platform: Arc<dyn Platform> = Arc::new(stub_impl::StubPlatform);
            platform
        })
        .clone()
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use crate::numa::parse_id_list;
    use libc::{c_int, c_ulong, c_void};
    use std::fs::{self, OpenOptions};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::IntoRawFd;
    use std::path::PathBuf;

    /// Sysfs directory listing NUMA nodes.
    const SYSFS_NODE_PATH: &str = "/sys/devices/system/node";

    // Memory policy modes from <linux/mempolicy.h>.
    const MPOL_DEFAULT: c_int = 0;
    const MPOL_BIND: c_int = 2;

    const ULONG_BITS: usize = c_ulong::BITS as usize;

    /// Platform backed by the Linux kernel.
    pub struct LinuxPlatform {
        numa: Option<LinuxNuma>,
    }

    impl LinuxPlatform {
        pub fn new() -> Self {
            let numa = if cfg!(feature = "numa") {
                LinuxNuma::detect()
            } else {
                None
            };
            log::debug!("NUMA support: {}", numa.is_some());
            Self { numa }
        }
    }

    impl Default for LinuxPlatform {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Platform for LinuxPlatform {
        fn open_device(&self, path: &Path, mode: AccessMode) -> io::Result<DeviceFd> {
            let mut options = OpenOptions::new();
            options.read(true).write(true);
            if mode == AccessMode::Exclusive {
                options.custom_flags(libc::O_EXCL);
            }
            let file = options.open(path)?;
            Ok(DeviceFd::from_raw(file.into_raw_fd()))
        }

        fn close_device(&self, fd: DeviceFd) -> io::Result<()> {
            // SAFETY: the descriptor came from open_device and is closed once.
            if unsafe { libc::close(fd.as_raw()) } == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn unmap_mmio(&self, region: &MmioRegion) -> io::Result<()> {
            munmap(region.addr, region.len)
        }

        fn release_workspace(&self, workspace: &Workspace) -> io::Result<()> {
            munmap(workspace.addr, workspace.len)
        }

        fn numa(&self) -> Option<&dyn NumaControl> {
            self.numa.as_ref().map(|n| n as &dyn NumaControl)
        }
    }

    fn munmap(addr: u64, len: usize) -> io::Result<()> {
        // SAFETY: registered regions are mappings owned by the handle being
        // torn down; see `HandleGuard::register_mmio`.
        if unsafe { libc::munmap(addr as *mut c_void, len) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// NUMA control through the memory-policy and affinity syscalls.
    struct LinuxNuma {
        /// Number of `c_ulong` words needed for a mask of all possible nodes.
        mask_words: usize,
        online: NodeMask,
        /// CPUs of each online node.
        node_cpus: Vec<(u32, Vec<u32>)>,
    }

    impl LinuxNuma {
        fn detect() -> Option<Self> {
            // Same probe libnuma uses: a policy query without buffers.
            // SAFETY: null pointers with zero length are accepted by the kernel.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_get_mempolicy,
                    std::ptr::null_mut::<c_int>(),
                    std::ptr::null_mut::<c_ulong>(),
                    0 as c_ulong,
                    std::ptr::null_mut::<c_void>(),
                    0 as c_ulong,
                )
            };
            if rc < 0 {
                return None;
            }

            let base = Path::new(SYSFS_NODE_PATH);
            let possible = read_id_list(&base.join("possible")).ok()?;
            let online = read_id_list(&base.join("online")).ok()?;
            let max_node = possible.iter().copied().max()?;

            let mut node_cpus = Vec::with_capacity(online.len());
            for &node in &online {
                let cpus = read_id_list(&node_dir(node).join("cpulist")).unwrap_or_default();
                node_cpus.push((node, cpus));
            }

            Some(Self {
                mask_words: max_node as usize / ULONG_BITS + 1,
                online: online.into_iter().collect(),
                node_cpus,
            })
        }

        fn to_ulongs(&self, mask: &NodeMask) -> Vec<c_ulong> {
            let mut words = vec![0 as c_ulong; self.mask_words];
            for node in mask.iter() {
                let i = node as usize / ULONG_BITS;
                if i < words.len() {
                    words[i] |= (1 as c_ulong) << (node as usize % ULONG_BITS);
                }
            }
            words
        }

        fn from_ulongs(words: &[c_ulong]) -> NodeMask {
            let mut mask = NodeMask::new();
            for (i, &w) in words.iter().enumerate() {
                for bit in 0..ULONG_BITS {
                    if w & ((1 as c_ulong) << bit) != 0 {
                        mask.set((i * ULONG_BITS + bit) as u32);
                    }
                }
            }
            mask
        }

        fn cpus_of(&self, mask: &NodeMask) -> impl Iterator<Item = u32> + '_ {
            let mask = mask.clone();
            self.node_cpus
                .iter()
                .filter(move |(node, _)| mask.contains(*node))
                .flat_map(|(_, cpus)| cpus.iter().copied())
        }
    }

    impl NumaControl for LinuxNuma {
        fn membind(&self) -> io::Result<NodeMask> {
            let mut mode: c_int = 0;
            let mut words = vec![0 as c_ulong; self.mask_words];
            // SAFETY: `words` holds `mask_words * ULONG_BITS` bits as announced.
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_get_mempolicy,
                    &mut mode as *mut c_int,
                    words.as_mut_ptr(),
                    (self.mask_words * ULONG_BITS) as c_ulong,
                    std::ptr::null_mut::<c_void>(),
                    0 as c_ulong,
                )
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }

            if mode == MPOL_BIND {
                Ok(Self::from_ulongs(&words))
            } else {
                // Not bound: allocations may come from any online node.
                Ok(self.online.clone())
            }
        }

        fn run_node_mask(&self) -> io::Result<NodeMask> {
            // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
            let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
            // SAFETY: `set` is a valid cpu_set_t of the given size.
            let rc = unsafe {
                libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set)
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }

            let limit = libc::CPU_SETSIZE as u32;
            let mut mask = NodeMask::new();
            for (node, cpus) in &self.node_cpus {
                let runs_here = cpus
                    .iter()
                    .filter(|&&cpu| cpu < limit)
                    // SAFETY: cpu is below CPU_SETSIZE.
                    .any(|&cpu| unsafe { libc::CPU_ISSET(cpu as usize, &set) });
                if runs_here {
                    mask.set(*node);
                }
            }
            Ok(mask)
        }

        fn set_membind(&self, mask: &NodeMask) -> io::Result<()> {
            let rc = if mask.is_empty() || *mask == self.online {
                // SAFETY: MPOL_DEFAULT takes no node mask.
                unsafe {
                    libc::syscall(
                        libc::SYS_set_mempolicy,
                        MPOL_DEFAULT,
                        std::ptr::null::<c_ulong>(),
                        0 as c_ulong,
                    )
                }
            } else {
                let words = self.to_ulongs(mask);
                // SAFETY: the kernel reads `maxnode - 1` bits, all inside `words`.
                unsafe {
                    libc::syscall(
                        libc::SYS_set_mempolicy,
                        MPOL_BIND,
                        words.as_ptr(),
                        (words.len() * ULONG_BITS + 1) as c_ulong,
                    )
                }
            };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn set_run_node_mask(&self, mask: &NodeMask) -> io::Result<()> {
            let target = if mask.is_empty() { &self.online } else { mask };

            // SAFETY: cpu_set_t is plain data; zeroed is a valid empty set.
            let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
            let limit = libc::CPU_SETSIZE as u32;
            for cpu in self.cpus_of(target).filter(|&cpu| cpu < limit) {
                // SAFETY: cpu is below CPU_SETSIZE.
                unsafe { libc::CPU_SET(cpu as usize, &mut set) };
            }

            // SAFETY: `set` is a valid cpu_set_t of the given size.
            let rc = unsafe {
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        fn device_node(&self, sysfspath: &Path) -> io::Result<Option<u32>> {
            let path = sysfspath.join("device").join("numa_node");
            let s = fs::read_to_string(&path)?;
            let node: i64 = s.trim().parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid node in {}: {:?}", path.display(), s.trim()),
                )
            })?;
            Ok(u32::try_from(node).ok())
        }
    }

    fn node_dir(node: u32) -> PathBuf {
        Path::new(SYSFS_NODE_PATH).join(format!("node{}", node))
    }

    fn read_id_list(path: &Path) -> io::Result<Vec<u32>> {
        let s = fs::read_to_string(path)?;
        parse_id_list(&s).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid id list in {}", path.display()),
            )
        })
    }
}

// ============================================================================
// Unsupported Platform Stub
// ============================================================================

#[cfg(not(target_os = "linux"))]
mod stub_impl {
    use super::*;

    /// Platform without FPGA device files.
    pub struct StubPlatform;

    impl Platform for StubPlatform {
        fn open_device(&self, path: &Path, _mode: AccessMode) -> io::Result<DeviceFd> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{}: FPGA device files require Linux", path.display()),
            ))
        }

        fn close_device(&self, _fd: DeviceFd) -> io::Result<()> {
            Ok(())
        }

        fn unmap_mmio(&self, _region: &MmioRegion) -> io::Result<()> {
            Ok(())
        }

        fn release_workspace(&self, _workspace: &Workspace) -> io::Result<()> {
            Ok(())
        }
    }
}
