// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Resource-accounting platform double for unit tests.
//!
//! Devices are plain paths registered up front. The mock follows the FPGA
//! driver's open rules (an exclusive open needs an idle port, a shared open
//! needs no exclusive holder) and counts every descriptor and NUMA mask it
//! hands out so tests can assert that nothing leaks.

use crate::error::{EACCES, EBUSY};
use crate::numa::NodeMask;
use crate::registry::{MmioRegion, Workspace};
use crate::sys::{AccessMode, DeviceFd, NumaControl, Platform};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const ENOENT: i32 = 2;
const EIO: i32 = 5;

/// One-shot failure injected into the next matching call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// `open_device` fails with the given errno.
    Open(i32),
    /// `close_device` reports an error (the descriptor is still released).
    Close,
    Unmap,
    ReleaseWorkspace,
    Membind,
    RunNodeMask,
    DeviceNode,
    SetMembind,
    SetRunNodeMask,
}

#[derive(Debug, Default)]
struct MockDevice {
    denied: bool,
    exclusive: bool,
    holders: usize,
}

#[derive(Debug, Default)]
struct MockState {
    devices: HashMap<PathBuf, MockDevice>,
    fds: HashMap<i32, PathBuf>,
    next_fd: i32,
    faults: Vec<Fault>,
    masks_out: i64,
    membind: NodeMask,
    runnode: NodeMask,
    device_nodes: HashMap<PathBuf, Option<u32>>,
    unmapped: Vec<MmioRegion>,
    released: Vec<Workspace>,
}

impl MockState {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let pos = self.faults.iter().position(matches)?;
        Some(self.faults.remove(pos))
    }

    fn fail_if(&mut self, fault: Fault) -> io::Result<()> {
        match self.take_fault(|f| *f == fault) {
            Some(_) => Err(io::Error::from_raw_os_error(EIO)),
            None => Ok(()),
        }
    }
}

pub(crate) struct MockPlatform {
    numa: bool,
    state: Mutex<MockState>,
}

impl MockPlatform {
    /// Platform without NUMA support.
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::build(false, 0))
    }

    /// Platform with `nodes` NUMA nodes; the caller may use all of them.
    pub(crate) fn with_numa(nodes: u32) -> Arc<Self> {
        Arc::new(Self::build(true, nodes))
    }

    fn build(numa: bool, nodes: u32) -> Self {
        let all = NodeMask::from_iter(0..nodes);
        Self {
            numa,
            state: Mutex::new(MockState {
                next_fd: 3,
                membind: all.clone(),
                runnode: all,
                ..MockState::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn add_device(&self, path: impl Into<PathBuf>) {
        self.state().devices.insert(path.into(), MockDevice::default());
    }

    pub(crate) fn deny_access(&self, path: impl AsRef<Path>) {
        if let Some(dev) = self.state().devices.get_mut(path.as_ref()) {
            dev.denied = true;
        }
    }

    pub(crate) fn set_device_node(&self, sysfspath: impl Into<PathBuf>, node: Option<u32>) {
        self.state().device_nodes.insert(sysfspath.into(), node);
    }

    pub(crate) fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    /// Descriptors currently open.
    pub(crate) fn open_fds(&self) -> usize {
        self.state().fds.len()
    }

    /// Masks handed out and not yet freed.
    pub(crate) fn outstanding_masks(&self) -> i64 {
        self.state().masks_out
    }

    pub(crate) fn holders(&self, path: impl AsRef<Path>) -> usize {
        self.state()
            .devices
            .get(path.as_ref())
            .map_or(0, |d| d.holders)
    }

    pub(crate) fn current_membind(&self) -> NodeMask {
        self.state().membind.clone()
    }

    pub(crate) fn current_runnode(&self) -> NodeMask {
        self.state().runnode.clone()
    }

    pub(crate) fn unmapped(&self) -> Vec<MmioRegion> {
        self.state().unmapped.clone()
    }

    pub(crate) fn released_workspaces(&self) -> Vec<Workspace> {
        self.state().released.clone()
    }
}

impl Platform for MockPlatform {
    fn open_device(&self, path: &Path, mode: AccessMode) -> io::Result<DeviceFd> {
        let mut state = self.state();
        if let Some(Fault::Open(errno)) = state.take_fault(|f| matches!(f, Fault::Open(_))) {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let dev = state
            .devices
            .get_mut(path)
            .ok_or_else(|| io::Error::from_raw_os_error(ENOENT))?;
        if dev.denied {
            return Err(io::Error::from_raw_os_error(EACCES));
        }
        let conflict = match mode {
            AccessMode::Exclusive => dev.holders > 0,
            AccessMode::Shared => dev.exclusive,
        };
        if conflict {
            return Err(io::Error::from_raw_os_error(EBUSY));
        }
        dev.holders += 1;
        dev.exclusive = mode == AccessMode::Exclusive;

        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(fd, path.to_path_buf());
        Ok(DeviceFd::from_raw(fd))
    }

    fn close_device(&self, fd: DeviceFd) -> io::Result<()> {
        let mut state = self.state();
        let path = state
            .fds
            .remove(&fd.as_raw())
            .ok_or_else(|| io::Error::from_raw_os_error(9))?;
        if let Some(dev) = state.devices.get_mut(&path) {
            dev.holders -= 1;
            if dev.holders == 0 {
                dev.exclusive = false;
            }
        }
        state.fail_if(Fault::Close)
    }

    fn unmap_mmio(&self, region: &MmioRegion) -> io::Result<()> {
        let mut state = self.state();
        state.fail_if(Fault::Unmap)?;
        state.unmapped.push(*region);
        Ok(())
    }

    fn release_workspace(&self, workspace: &Workspace) -> io::Result<()> {
        let mut state = self.state();
        state.fail_if(Fault::ReleaseWorkspace)?;
        state.released.push(*workspace);
        Ok(())
    }

    fn numa(&self) -> Option<&dyn NumaControl> {
        if self.numa {
            Some(self as &dyn NumaControl)
        } else {
            None
        }
    }
}

impl NumaControl for MockPlatform {
    fn membind(&self) -> io::Result<NodeMask> {
        let mut state = self.state();
        state.fail_if(Fault::Membind)?;
        state.masks_out += 1;
        Ok(state.membind.clone())
    }

    fn run_node_mask(&self) -> io::Result<NodeMask> {
        let mut state = self.state();
        state.fail_if(Fault::RunNodeMask)?;
        state.masks_out += 1;
        Ok(state.runnode.clone())
    }

    fn set_membind(&self, mask: &NodeMask) -> io::Result<()> {
        let mut state = self.state();
        state.fail_if(Fault::SetMembind)?;
        state.membind = mask.clone();
        Ok(())
    }

    fn set_run_node_mask(&self, mask: &NodeMask) -> io::Result<()> {
        let mut state = self.state();
        state.fail_if(Fault::SetRunNodeMask)?;
        state.runnode = mask.clone();
        Ok(())
    }

    fn device_node(&self, sysfspath: &Path) -> io::Result<Option<u32>> {
        let mut state = self.state();
        state.fail_if(Fault::DeviceNode)?;
        state
            .device_nodes
            .get(sysfspath)
            .copied()
            .ok_or_else(|| io::Error::from_raw_os_error(ENOENT))
    }

    fn free_mask(&self, _mask: NodeMask) {
        self.state().masks_out -= 1;
    }
}
