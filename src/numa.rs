// FPGA Device Access Layer
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! NUMA affinity snapshot.
//!
//! When a handle is opened on a NUMA system, the caller's memory binding and
//! run-node mask are captured together with the device's own node. The
//! snapshot lets later code bind buffers and threads close to the device and
//! guarantees the original affinity is put back when the handle closes.

use crate::error::{FpgaError, FpgaResult};
use crate::sys::NumaControl;
use scopeguard::ScopeGuard;
use std::path::Path;

/// Set of NUMA node numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMask {
    // Invariant: no trailing zero words, so derived equality is set equality.
    words: Vec<u64>,
}

impl NodeMask {
    /// Create an empty mask.
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    /// Mask containing exactly one node.
    pub fn single(node: u32) -> Self {
        let mut mask = Self::new();
        mask.set(node);
        mask
    }

    /// Build a mask from 64-bit words, bit `n` of word `w` being node `64 * w + n`.
    pub fn from_words(words: impl IntoIterator<Item = u64>) -> Self {
        let mut mask = Self {
            words: words.into_iter().collect(),
        };
        mask.trim();
        mask
    }

    pub fn set(&mut self, node: u32) {
        let word = (node / 64) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (node % 64);
    }

    pub fn clear(&mut self, node: u32) {
        let word = (node / 64) as usize;
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1u64 << (node % 64));
        }
        self.trim();
    }

    pub fn contains(&self, node: u32) -> bool {
        self.words
            .get((node / 64) as usize)
            .is_some_and(|&w| w & (1u64 << (node % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of nodes in the mask.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Node numbers in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64u32)
                .filter(move |bit| w & (1u64 << bit) != 0)
                .map(move |bit| i as u32 * 64 + bit)
        })
    }

    /// Raw 64-bit words, lowest nodes first.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

impl FromIterator<u32> for NodeMask {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut mask = Self::new();
        for node in iter {
            mask.set(node);
        }
        mask
    }
}

impl std::fmt::Display for NodeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes: Vec<String> = self.iter().map(|n| n.to_string()).collect();
        write!(f, "[{}]", nodes.join(","))
    }
}

/// Parse a kernel id list such as `0-3,8,10-11`.
///
/// Returns `None` on malformed input. An empty string is an empty list.
pub fn parse_id_list(s: &str) -> Option<Vec<u32>> {
    let s = s.trim();
    let mut ids = Vec::new();
    if s.is_empty() {
        return Some(ids);
    }
    for part in s.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().ok()?;
                let hi: u32 = hi.trim().parse().ok()?;
                if hi < lo {
                    return None;
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(part.trim().parse().ok()?),
        }
    }
    Some(ids)
}

/// Memory-bind and run-node masks of the calling thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityMasks {
    /// Nodes memory allocations are bound to.
    pub membind: NodeMask,
    /// Nodes the thread is allowed to run on.
    pub runnode: NodeMask,
}

impl AffinityMasks {
    /// Capture the current masks.
    ///
    /// Both masks come from `numa` and must be handed back with
    /// [`AffinityMasks::free`]; on error nothing is left outstanding.
    fn capture(numa: &dyn NumaControl) -> std::io::Result<Self> {
        let membind = scopeguard::guard(numa.membind()?, |m| numa.free_mask(m));
        let runnode = numa.run_node_mask()?;
        Ok(Self {
            membind: ScopeGuard::into_inner(membind),
            runnode,
        })
    }

    /// Make these masks the current affinity.
    fn apply(&self, numa: &dyn NumaControl) -> std::io::Result<()> {
        numa.set_membind(&self.membind)?;
        numa.set_run_node_mask(&self.runnode)
    }

    fn free(self, numa: &dyn NumaControl) {
        numa.free_mask(self.membind);
        numa.free_mask(self.runnode);
    }
}

/// Affinity state captured when a handle was opened.
#[derive(Debug)]
pub struct NumaSnapshot {
    at_open: AffinityMasks,
    saved: Option<AffinityMasks>,
    device_node: u32,
    device_mask: NodeMask,
}

impl NumaSnapshot {
    /// Capture the caller's affinity and the device's preferred node.
    ///
    /// Returns `Ok(None)` when the device reports no node affinity (sysfs
    /// `numa_node` of `-1`). Failing to capture a mask or to read the node
    /// is reported as [`FpgaError::NoMemory`]; every mask captured up to
    /// that point has already been freed.
    pub(crate) fn capture(numa: &dyn NumaControl, sysfspath: &Path) -> FpgaResult<Option<Self>> {
        let at_open = AffinityMasks::capture(numa)
            .map_err(|e| FpgaError::NoMemory(format!("capture NUMA affinity: {}", e)))?;
        let at_open = scopeguard::guard(at_open, |masks| masks.free(numa));

        let device_node = match numa.device_node(sysfspath) {
            Ok(Some(node)) => node,
            Ok(None) => {
                log::debug!("{} has no NUMA node affinity", sysfspath.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(FpgaError::NoMemory(format!(
                    "read NUMA node of {}: {}",
                    sysfspath.display(),
                    e
                )));
            }
        };

        Ok(Some(Self {
            at_open: ScopeGuard::into_inner(at_open),
            saved: None,
            device_node,
            device_mask: NodeMask::single(device_node),
        }))
    }

    /// Affinity of the caller when the handle was opened.
    pub fn at_open(&self) -> &AffinityMasks {
        &self.at_open
    }

    /// Affinity saved by the last [`NumaSnapshot::bind_to_device`], if any.
    pub fn saved(&self) -> Option<&AffinityMasks> {
        self.saved.as_ref()
    }

    /// The device's preferred node.
    pub fn device_node(&self) -> u32 {
        self.device_node
    }

    pub fn device_mask(&self) -> &NodeMask {
        &self.device_mask
    }

    pub fn is_bound(&self) -> bool {
        self.saved.is_some()
    }

    /// Save the current affinity and bind memory and execution to the device node.
    pub(crate) fn bind_to_device(&mut self, numa: &dyn NumaControl) -> FpgaResult<()> {
        if self.saved.is_some() {
            return Err(FpgaError::Busy(format!(
                "already bound to node {}",
                self.device_node
            )));
        }

        let current = AffinityMasks::capture(numa)
            .map_err(|e| FpgaError::NoMemory(format!("save NUMA affinity: {}", e)))?;
        let current = scopeguard::guard(current, |masks| masks.free(numa));

        let target = AffinityMasks {
            membind: self.device_mask.clone(),
            runnode: self.device_mask.clone(),
        };
        if let Err(e) = target.apply(numa) {
            // Undo a half-applied bind before giving up.
            if let Err(undo) = current.apply(numa) {
                log::warn!(
                    "bind to node {} failed and previous affinity not restored: {}",
                    self.device_node,
                    undo
                );
                return Err(FpgaError::Exception(format!(
                    "bind to node {}: {}; rollback failed, affinity left changed: {}",
                    self.device_node, e, undo
                )));
            }
            return Err(FpgaError::Exception(format!(
                "bind to node {}: {}",
                self.device_node, e
            )));
        }

        log::debug!("bound to NUMA node {}", self.device_node);
        self.saved = Some(ScopeGuard::into_inner(current));
        Ok(())
    }

    /// Restore the affinity saved by [`NumaSnapshot::bind_to_device`].
    pub(crate) fn restore_saved(&mut self, numa: &dyn NumaControl) -> FpgaResult<()> {
        let saved = self
            .saved
            .take()
            .ok_or_else(|| FpgaError::NotFound("no saved NUMA affinity".into()))?;
        let result = saved
            .apply(numa)
            .map_err(|e| FpgaError::Exception(format!("restore saved NUMA affinity: {}", e)));
        saved.free(numa);
        result
    }

    /// Restore the affinity captured at open and free every mask.
    ///
    /// Restoring is attempted even if it partly fails; each failure is
    /// returned so the caller can report it.
    pub(crate) fn teardown(self, numa: &dyn NumaControl) -> Vec<FpgaError> {
        let mut failures = Vec::new();

        if let Err(e) = numa.set_membind(&self.at_open.membind) {
            failures.push(FpgaError::Exception(format!(
                "restore memory binding {}: {}",
                self.at_open.membind, e
            )));
        }
        if let Err(e) = numa.set_run_node_mask(&self.at_open.runnode) {
            failures.push(FpgaError::Exception(format!(
                "restore run-node mask {}: {}",
                self.at_open.runnode, e
            )));
        }

        if let Some(saved) = self.saved {
            saved.free(numa);
        }
        self.at_open.free(numa);
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;
    use crate::testing::{Fault, MockPlatform};

    const SYSFS: &str = "/sys/class/fpga/intel-fpga-dev.0/intel-fpga-port.0";

    #[test]
    fn test_node_mask_basics() {
        let mut mask = NodeMask::new();
        assert!(mask.is_empty());
        mask.set(0);
        mask.set(65);
        assert!(mask.contains(0));
        assert!(mask.contains(65));
        assert!(!mask.contains(1));
        assert_eq!(mask.count(), 2);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 65]);

        mask.clear(65);
        assert_eq!(mask, NodeMask::single(0));
        assert_eq!(mask.words(), &[1]);
    }

    #[test]
    fn test_node_mask_equality_ignores_trailing_words() {
        assert_eq!(NodeMask::from_words([0b101, 0, 0]), NodeMask::from_iter([0, 2]));
        assert_eq!(NodeMask::from_words([0, 0]), NodeMask::new());
    }

    #[test]
    fn test_node_mask_display() {
        let mask = NodeMask::from_iter([0, 1, 3]);
        assert_eq!(mask.to_string(), "[0,1,3]");
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("0-3,8,10-11\n"), Some(vec![0, 1, 2, 3, 8, 10, 11]));
        assert_eq!(parse_id_list("1"), Some(vec![1]));
        assert_eq!(parse_id_list(""), Some(vec![]));
        assert_eq!(parse_id_list("3-1"), None);
        assert_eq!(parse_id_list("a"), None);
    }

    #[test]
    fn test_capture_and_teardown() {
        let platform = MockPlatform::with_numa(2);
        platform.set_device_node(SYSFS, Some(1));

        let snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS))
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.device_node(), 1);
        assert_eq!(snapshot.device_mask(), &NodeMask::single(1));
        assert_eq!(snapshot.at_open().membind.count(), 2);
        assert!(snapshot.saved().is_none());
        assert_eq!(platform.outstanding_masks(), 2);

        assert!(snapshot.teardown(&*platform).is_empty());
        assert_eq!(platform.outstanding_masks(), 0);
    }

    #[test]
    fn test_device_without_node_has_no_snapshot() {
        let platform = MockPlatform::with_numa(2);
        platform.set_device_node(SYSFS, None);

        let snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS)).unwrap();
        assert!(snapshot.is_none());
        assert_eq!(platform.outstanding_masks(), 0);
    }

    #[test]
    fn test_capture_failures_free_masks() {
        for fault in [Fault::Membind, Fault::RunNodeMask, Fault::DeviceNode] {
            let platform = MockPlatform::with_numa(2);
            platform.set_device_node(SYSFS, Some(0));
            platform.inject(fault);

            let err = NumaSnapshot::capture(&*platform, Path::new(SYSFS)).unwrap_err();
            assert_eq!(err.code(), ResultCode::NoMemory, "{:?}", fault);
            assert_eq!(platform.outstanding_masks(), 0, "{:?}", fault);
        }
    }

    #[test]
    fn test_bind_and_restore() {
        let platform = MockPlatform::with_numa(2);
        platform.set_device_node(SYSFS, Some(1));
        let mut snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS))
            .unwrap()
            .unwrap();
        let original = platform.current_membind();

        snapshot.bind_to_device(&*platform).unwrap();
        assert!(snapshot.is_bound());
        assert_eq!(platform.current_membind(), NodeMask::single(1));
        assert_eq!(platform.current_runnode(), NodeMask::single(1));
        assert_eq!(
            snapshot.bind_to_device(&*platform).unwrap_err().code(),
            ResultCode::Busy
        );

        snapshot.restore_saved(&*platform).unwrap();
        assert!(!snapshot.is_bound());
        assert_eq!(platform.current_membind(), original);
        assert_eq!(
            snapshot.restore_saved(&*platform).unwrap_err().code(),
            ResultCode::NotFound
        );

        snapshot.teardown(&*platform);
        assert_eq!(platform.outstanding_masks(), 0);
    }

    #[test]
    fn test_failed_bind_rolls_back() {
        let platform = MockPlatform::with_numa(2);
        platform.set_device_node(SYSFS, Some(1));
        let mut snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS))
            .unwrap()
            .unwrap();
        let original = platform.current_membind();

        // Memory binding applied, run-node mask refused
        platform.inject(Fault::SetRunNodeMask);
        let err = snapshot.bind_to_device(&*platform).unwrap_err();
        assert_eq!(err.code(), ResultCode::Exception);
        assert!(!err.to_string().contains("rollback failed"));
        assert!(!snapshot.is_bound());
        assert_eq!(platform.current_membind(), original);
        assert_eq!(platform.outstanding_masks(), 2);

        snapshot.teardown(&*platform);
        assert_eq!(platform.outstanding_masks(), 0);
    }

    #[test]
    fn test_failed_bind_reports_failed_rollback() {
        let platform = MockPlatform::with_numa(2);
        platform.set_device_node(SYSFS, Some(1));
        let mut snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS))
            .unwrap()
            .unwrap();

        // Refused both when binding and when undoing the bind
        platform.inject(Fault::SetRunNodeMask);
        platform.inject(Fault::SetRunNodeMask);
        let err = snapshot.bind_to_device(&*platform).unwrap_err();
        assert_eq!(err.code(), ResultCode::Exception);
        assert!(err.to_string().contains("rollback failed"), "{}", err);
        assert!(!snapshot.is_bound());
        assert_eq!(platform.outstanding_masks(), 2);

        assert!(snapshot.teardown(&*platform).is_empty());
        assert_eq!(platform.outstanding_masks(), 0);
    }

    #[test]
    fn test_teardown_restores_open_affinity_while_bound() {
        let platform = MockPlatform::with_numa(4);
        platform.set_device_node(SYSFS, Some(3));
        let mut snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS))
            .unwrap()
            .unwrap();
        let original = platform.current_runnode();

        snapshot.bind_to_device(&*platform).unwrap();
        assert!(snapshot.teardown(&*platform).is_empty());
        assert_eq!(platform.current_runnode(), original);
        assert_eq!(platform.outstanding_masks(), 0);
    }

    #[test]
    fn test_teardown_reports_restore_failure() {
        let platform = MockPlatform::with_numa(2);
        platform.set_device_node(SYSFS, Some(0));
        let snapshot = NumaSnapshot::capture(&*platform, Path::new(SYSFS))
            .unwrap()
            .unwrap();

        platform.inject(Fault::SetMembind);
        let failures = snapshot.teardown(&*platform);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].code(), ResultCode::Exception);
        assert_eq!(platform.outstanding_masks(), 0);
    }
}
