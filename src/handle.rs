// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Open handles.
//!
//! A [`Handle`] is one open session on an FPGA resource. Opening it acquires
//! the device file, creates the handle lock and, on NUMA systems, captures
//! the caller's affinity. Each step is held by a scope guard until the whole
//! handle is assembled, so a failure at any point releases exactly what that
//! call acquired and nothing else.
//!
//! Closing reverses every step: registered MMIO regions and workspaces are
//! torn down, the affinity is restored and the descriptors are closed.
//!
//! # Example
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
//!     let handle = Handle::open(&token, OpenFlags::empty())?;
//!     println!("handle {} on fd {}", handle.id(), handle.device_fd()?.as_raw());
//!     handle.close()?;
//!     Ok(())
//! }
//! ```

use crate::error::{FpgaError, FpgaResult};
use crate::numa::NumaSnapshot;
use crate::registry::{MmioId, MmioRegion, Registry, Workspace, WorkspaceId};
use crate::sys::{self, AccessMode, DeviceFd, Platform};
use crate::token::Token;
use bitflags::bitflags;
use scopeguard::ScopeGuard;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

bitflags! {
    /// Flags accepted by [`Handle::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Allow other handles to open the same resource concurrently.
        const SHARED = 1 << 0;
    }
}

/// Process-unique identifier of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of releasing a handle's resources.
///
/// Release never stops early: every resource is attempted and each failure
/// is recorded here.
#[derive(Debug, Default)]
pub struct ReleaseReport {
    /// MMIO regions torn down successfully.
    pub mmio_released: usize,
    /// Workspaces torn down successfully.
    pub workspaces_released: usize,
    /// Failures encountered along the way.
    pub failures: Vec<FpgaError>,
}

impl ReleaseReport {
    /// Returns true if every resource was released without error.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Resources of an open handle.
#[derive(Debug)]
struct OpenSession {
    device: DeviceFd,
    aux: Option<DeviceFd>,
    mmio: Registry<MmioRegion>,
    workspaces: Registry<Workspace>,
    numa: Option<NumaSnapshot>,
}

impl OpenSession {
    /// Tear down everything in reverse order of acquisition.
    fn release(mut self, platform: &dyn Platform) -> ReleaseReport {
        let mut report = ReleaseReport::default();

        for (id, region) in self.mmio.drain_newest_first() {
            match platform.unmap_mmio(&region) {
                Ok(()) => report.mmio_released += 1,
                Err(e) => report
                    .failures
                    .push(FpgaError::Exception(format!("unmap {}: {}", id, e))),
            }
        }

        for (id, workspace) in self.workspaces.drain_newest_first() {
            match platform.release_workspace(&workspace) {
                Ok(()) => report.workspaces_released += 1,
                Err(e) => report
                    .failures
                    .push(FpgaError::Exception(format!("release {}: {}", id, e))),
            }
        }

        if let Some(snapshot) = self.numa.take() {
            match platform.numa() {
                Some(numa) => report.failures.extend(snapshot.teardown(numa)),
                None => report.failures.push(FpgaError::Exception(
                    "NUMA snapshot without NUMA support".into(),
                )),
            }
        }

        if let Some(aux) = self.aux.take() {
            if let Err(e) = platform.close_device(aux) {
                report
                    .failures
                    .push(FpgaError::Exception(format!("close aux channel: {}", e)));
            }
        }

        if let Err(e) = platform.close_device(self.device) {
            report
                .failures
                .push(FpgaError::Exception(format!("close device: {}", e)));
        }

        report
    }
}

/// Lifecycle state guarded by the handle lock.
#[derive(Debug)]
enum Session {
    Open(OpenSession),
    Closed,
}

/// An open session on an FPGA resource.
///
/// The handle borrows the token it was opened from and cannot outlive it.
/// All mutable state sits behind one per-handle lock; handles never share
/// state, so operations on different handles never contend.
pub struct Handle<'t> {
    id: HandleId,
    token: &'t Token,
    mode: AccessMode,
    platform: Arc<dyn Platform>,
    session: Mutex<Session>,
}

impl<'t> Handle<'t> {
    /// Open the resource described by `token` on the default platform.
    ///
    /// # Errors
    ///
    /// - [`FpgaError::InvalidParam`] for unknown flag bits or an invalid token
    /// - [`FpgaError::NoAccess`] if the device file is not accessible
    /// - [`FpgaError::Busy`] if another handle holds the resource and either
    ///   side asked for exclusive access
    /// - [`FpgaError::NoDriver`] if the device file cannot be opened otherwise
    /// - [`FpgaError::NoMemory`] if the NUMA affinity cannot be captured
    pub fn open(token: &'t Token, flags: OpenFlags) -> FpgaResult<Self> {
        Self::open_with(sys::default_platform(), token, flags)
    }

    /// Open the resource described by `token` on an explicit platform.
    pub fn open_with(
        platform: Arc<dyn Platform>,
        token: &'t Token,
        flags: OpenFlags,
    ) -> FpgaResult<Self> {
        let unknown = flags.bits() & !OpenFlags::all().bits();
        if unknown != 0 {
            return Err(FpgaError::InvalidParam(format!(
                "unrecognized open flags {:#x}",
                unknown
            )));
        }
        token.validate()?;

        let mode = if flags.contains(OpenFlags::SHARED) {
            AccessMode::Shared
        } else {
            AccessMode::Exclusive
        };

        let devpath = token.devpath();
        let fd = platform.open_device(devpath, mode).map_err(|e| {
            let err = FpgaError::from_open_error(&e, devpath);
            log::debug!("{}", err);
            err
        })?;
        let device = scopeguard::guard(fd, |fd| {
            if let Err(e) = platform.close_device(fd) {
                log::warn!("close({}) during rollback: {}", devpath.display(), e);
            }
        });

        let numa = capture_affinity(&*platform, token)?;

        let id = HandleId::next();
        let session = OpenSession {
            device: ScopeGuard::into_inner(device),
            aux: None,
            mmio: Registry::new(id),
            workspaces: Registry::new(id),
            numa,
        };
        log::debug!("opened {} as handle {} ({:?})", token, id, mode);

        Ok(Self {
            id,
            token,
            mode,
            platform,
            session: Mutex::new(Session::Open(session)),
        })
    }

    /// Release every resource held by the handle.
    ///
    /// Partial failures are collected in the returned report; the handle is
    /// closed regardless.
    ///
    /// # Errors
    ///
    /// Returns [`FpgaError::InvalidParam`] if the handle is already closed.
    pub fn close(&self) -> FpgaResult<ReleaseReport> {
        let mut session = self.session.lock().unwrap_or_else(|poisoned| {
            log::warn!("handle {} lock poisoned, closing anyway", self.id);
            poisoned.into_inner()
        });

        // Mark closed before unwinding so no caller can observe a half-torn handle.
        let open = match std::mem::replace(&mut *session, Session::Closed) {
            Session::Open(open) => open,
            Session::Closed => {
                return Err(FpgaError::InvalidParam(format!(
                    "handle {} is already closed",
                    self.id
                )));
            }
        };

        let report = open.release(&*self.platform);
        drop(session);

        for failure in &report.failures {
            log::warn!("handle {}: {}", self.id, failure);
        }
        log::debug!(
            "closed handle {} ({} mmio, {} workspaces released)",
            self.id,
            report.mmio_released,
            report.workspaces_released
        );
        Ok(report)
    }

    /// Lock the handle for a sequence of operations.
    ///
    /// The lock is not re-entrant: code that already holds a
    /// [`HandleGuard`] must use it instead of calling back into the handle.
    ///
    /// # Errors
    ///
    /// - [`FpgaError::InvalidParam`] if the handle is closed
    /// - [`FpgaError::Exception`] if a previous holder panicked
    pub fn lock(&self) -> FpgaResult<HandleGuard<'_>> {
        let session = self
            .session
            .lock()
            .map_err(|_: PoisonError<_>| {
                FpgaError::Exception(format!("handle {} lock poisoned", self.id))
            })?;
        if let Session::Closed = *session {
            return Err(FpgaError::InvalidParam(format!(
                "handle {} is closed",
                self.id
            )));
        }
        Ok(HandleGuard {
            id: self.id,
            platform: &*self.platform,
            session,
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Token the handle was opened from.
    pub fn token(&self) -> &'t Token {
        self.token
    }

    pub fn access_mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        matches!(
            *self.session.lock().unwrap_or_else(PoisonError::into_inner),
            Session::Open(_)
        )
    }

    /// Descriptor of the device file.
    pub fn device_fd(&self) -> FpgaResult<DeviceFd> {
        self.lock()?.device_fd()
    }

    /// Register a mapped MMIO region.
    ///
    /// # Safety
    ///
    /// Same as [`HandleGuard::register_mmio`].
    pub unsafe fn register_mmio(&self, region: MmioRegion) -> FpgaResult<MmioId> {
        let mut guard = self.lock()?;
        // SAFETY: forwarded from the caller.
        unsafe { guard.register_mmio(region) }
    }

    pub fn mmio(&self, id: MmioId) -> FpgaResult<MmioRegion> {
        let guard = self.lock()?;
        let region = *guard.mmio(id)?;
        Ok(region)
    }

    pub fn deregister_mmio(&self, id: MmioId) -> FpgaResult<()> {
        self.lock()?.deregister_mmio(id)
    }

    pub fn mmio_count(&self) -> FpgaResult<usize> {
        Ok(self.lock()?.mmio_ids().len())
    }

    /// Register a pinned workspace.
    ///
    /// # Safety
    ///
    /// Same as [`HandleGuard::register_workspace`].
    pub unsafe fn register_workspace(&self, workspace: Workspace) -> FpgaResult<WorkspaceId> {
        let mut guard = self.lock()?;
        // SAFETY: forwarded from the caller.
        unsafe { guard.register_workspace(workspace) }
    }

    pub fn workspace(&self, id: WorkspaceId) -> FpgaResult<Workspace> {
        let guard = self.lock()?;
        let workspace = *guard.workspace(id)?;
        Ok(workspace)
    }

    pub fn deregister_workspace(&self, id: WorkspaceId) -> FpgaResult<()> {
        self.lock()?.deregister_workspace(id)
    }

    pub fn workspace_count(&self) -> FpgaResult<usize> {
        Ok(self.lock()?.workspace_ids().len())
    }

    /// Returns true if a NUMA affinity snapshot was captured at open.
    pub fn has_numa_snapshot(&self) -> FpgaResult<bool> {
        Ok(self.lock()?.numa_snapshot().is_some())
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        let session = self
            .session
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Session::Open(open) = std::mem::replace(session, Session::Closed) {
            log::debug!("handle {} dropped while open, releasing", self.id);
            let report = open.release(&*self.platform);
            for failure in &report.failures {
                log::warn!("handle {}: {}", self.id, failure);
            }
        }
    }
}

impl std::fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("token", &self.token.to_string())
            .field("mode", &self.mode)
            .field("state", &self.state_name())
            .finish()
    }
}

impl Handle<'_> {
    /// Lifecycle state for diagnostics; never blocks on the handle lock.
    fn state_name(&self) -> &'static str {
        let name = |session: &Session| match session {
            Session::Open(_) => "open",
            Session::Closed => "closed",
        };
        match self.session.try_lock() {
            Ok(session) => name(&*session),
            Err(TryLockError::Poisoned(poisoned)) => name(&*poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => "locked",
        }
    }
}

/// Capture the NUMA snapshot if the platform and build support it.
fn capture_affinity(platform: &dyn Platform, token: &Token) -> FpgaResult<Option<NumaSnapshot>> {
    if !cfg!(feature = "numa") {
        return Ok(None);
    }
    match platform.numa() {
        Some(numa) => NumaSnapshot::capture(numa, token.sysfspath()),
        None => Ok(None),
    }
}

/// Exclusive access to an open handle.
///
/// Holding the guard keeps every other thread out of the handle. Higher
/// layers that compose several operations take the guard once and pass it
/// down instead of locking again.
pub struct HandleGuard<'a> {
    id: HandleId,
    platform: &'a dyn Platform,
    session: MutexGuard<'a, Session>,
}

impl std::fmt::Debug for HandleGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleGuard").field("id", &self.id).finish()
    }
}

impl HandleGuard<'_> {
    fn open(&self) -> FpgaResult<&OpenSession> {
        match &*self.session {
            Session::Open(open) => Ok(open),
            Session::Closed => Err(FpgaError::InvalidParam(format!(
                "handle {} is closed",
                self.id
            ))),
        }
    }

    fn open_mut(&mut self) -> FpgaResult<&mut OpenSession> {
        match &mut *self.session {
            Session::Open(open) => Ok(open),
            Session::Closed => Err(FpgaError::InvalidParam(format!(
                "handle {} is closed",
                self.id
            ))),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn device_fd(&self) -> FpgaResult<DeviceFd> {
        Ok(self.open()?.device)
    }

    /// Register a mapped MMIO region with the handle.
    ///
    /// # Safety
    ///
    /// `region` must describe a live mapping created for this handle and not
    /// owned by anything else. It is unmapped when deregistered or when the
    /// handle closes.
    ///
    /// # Errors
    ///
    /// Returns [`FpgaError::NoMemory`] if the table cannot grow.
    pub unsafe fn register_mmio(&mut self, region: MmioRegion) -> FpgaResult<MmioId> {
        let id = self.open_mut()?.mmio.register(region)?;
        log::debug!("registered {} ({:#x} bytes at {:#x})", id, region.len, region.addr);
        Ok(id)
    }

    pub fn mmio(&self, id: MmioId) -> FpgaResult<&MmioRegion> {
        self.open()?.mmio.lookup(id)
    }

    /// Remove an MMIO region and unmap it.
    ///
    /// The entry is removed even if unmapping fails.
    pub fn deregister_mmio(&mut self, id: MmioId) -> FpgaResult<()> {
        let platform = self.platform;
        let region = self.open_mut()?.mmio.remove(id)?;
        platform
            .unmap_mmio(&region)
            .map_err(|e| FpgaError::Exception(format!("unmap {}: {}", id, e)))
    }

    pub fn mmio_ids(&self) -> Vec<MmioId> {
        self.open().map(|o| o.mmio.ids()).unwrap_or_default()
    }

    /// Register a pinned workspace with the handle.
    ///
    /// # Safety
    ///
    /// `workspace` must describe a live buffer allocated for this handle and
    /// not owned by anything else. It is released when deregistered or when
    /// the handle closes.
    pub unsafe fn register_workspace(&mut self, workspace: Workspace) -> FpgaResult<WorkspaceId> {
        let id = self.open_mut()?.workspaces.register(workspace)?;
        log::debug!("registered {} (iova {:#x})", id, workspace.iova);
        Ok(id)
    }

    pub fn workspace(&self, id: WorkspaceId) -> FpgaResult<&Workspace> {
        self.open()?.workspaces.lookup(id)
    }

    /// Remove a workspace and release it.
    ///
    /// The entry is removed even if the release fails.
    pub fn deregister_workspace(&mut self, id: WorkspaceId) -> FpgaResult<()> {
        let platform = self.platform;
        let workspace = self.open_mut()?.workspaces.remove(id)?;
        platform
            .release_workspace(&workspace)
            .map_err(|e| FpgaError::Exception(format!("release {}: {}", id, e)))
    }

    pub fn workspace_ids(&self) -> Vec<WorkspaceId> {
        self.open().map(|o| o.workspaces.ids()).unwrap_or_default()
    }

    /// Open the auxiliary driver channel at `path` (shared mode).
    ///
    /// # Errors
    ///
    /// - [`FpgaError::Busy`] if a channel is already attached
    /// - open failures as for [`Handle::open`]
    pub fn attach_aux_channel(&mut self, path: &Path) -> FpgaResult<DeviceFd> {
        let platform = self.platform;
        let id = self.id;
        let open = self.open_mut()?;
        if open.aux.is_some() {
            return Err(FpgaError::Busy(format!(
                "handle {} already has an aux channel",
                id
            )));
        }
        let fd = platform
            .open_device(path, AccessMode::Shared)
            .map_err(|e| FpgaError::from_open_error(&e, path))?;
        open.aux = Some(fd);
        Ok(fd)
    }

    /// Descriptor of the auxiliary channel, if attached.
    pub fn aux_fd(&self) -> Option<DeviceFd> {
        self.open().ok().and_then(|o| o.aux)
    }

    pub fn numa_snapshot(&self) -> Option<&NumaSnapshot> {
        self.open().ok().and_then(|o| o.numa.as_ref())
    }

    /// Bind memory and execution of the calling thread to the device's node.
    ///
    /// The previous affinity is saved and put back by
    /// [`HandleGuard::restore_binding`] or when the handle closes.
    ///
    /// # Errors
    ///
    /// - [`FpgaError::NotFound`] if no NUMA snapshot exists
    /// - [`FpgaError::Busy`] if already bound
    pub fn bind_to_device_node(&mut self) -> FpgaResult<()> {
        let platform = self.platform;
        let snapshot = self.snapshot_mut()?;
        let numa = platform
            .numa()
            .ok_or_else(|| FpgaError::NotFound("NUMA not available".into()))?;
        snapshot.bind_to_device(numa)
    }

    /// Undo [`HandleGuard::bind_to_device_node`].
    pub fn restore_binding(&mut self) -> FpgaResult<()> {
        let platform = self.platform;
        let snapshot = self.snapshot_mut()?;
        let numa = platform
            .numa()
            .ok_or_else(|| FpgaError::NotFound("NUMA not available".into()))?;
        snapshot.restore_saved(numa)
    }

    fn snapshot_mut(&mut self) -> FpgaResult<&mut NumaSnapshot> {
        let id = self.id;
        self.open_mut()?
            .numa
            .as_mut()
            .ok_or_else(|| FpgaError::NotFound(format!("handle {} has no NUMA snapshot", id)))
    }
}
