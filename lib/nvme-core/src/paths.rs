// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Namespace bookkeeping and notification of the storage paths built on
//! top of them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use slog::{info, warn, Logger};

use crate::bits::IdentifyNamespace;
use crate::NvmeError;

/// Only 512 byte logical blocks are exposed.
pub const SUPPORTED_LBA_SHIFT: u8 = 9;

/// The layer that turns namespaces into storage paths.
pub trait PathNotifier: Send + Sync {
    /// Look for namespaces which became usable and claim paths for them.
    fn scan_and_claim(&self);

    /// A single namespace went away.
    fn delete_path(&self, nsid: u32);

    /// The whole device is gone.
    fn paths_lost(&self);
}

/// Notifier for controllers nobody builds paths on.
pub struct NoopNotifier;

impl PathNotifier for NoopNotifier {
    fn scan_and_claim(&self) {}
    fn delete_path(&self, _nsid: u32) {}
    fn paths_lost(&self) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Namespace {
    pub nsid: u32,
    /// Size in logical blocks.
    pub blocks: u64,
    pub block_size: u32,
    /// The namespace uses a format the driver can expose.
    pub supported: bool,
    pub online: bool,
}

/// Check that a namespace uses a format the driver can expose: 512 byte
/// blocks with no metadata and no end-to-end protection.
pub fn validate_namespace(id: &IdentifyNamespace) -> Result<u32, NvmeError> {
    let fmt = id.active_format();
    if fmt.lbads != SUPPORTED_LBA_SHIFT || { fmt.ms } != 0 || id.dps & 0b111 != 0
    {
        return Err(NvmeError::InvalidNsOrFormat);
    }
    Ok(1 << fmt.lbads)
}

pub struct PathTable {
    namespaces: Mutex<BTreeMap<u32, Namespace>>,
    notifier: Arc<dyn PathNotifier>,
    log: Logger,
}

impl PathTable {
    pub fn new(notifier: Arc<dyn PathNotifier>, log: &Logger) -> Self {
        Self {
            namespaces: Mutex::new(BTreeMap::new()),
            notifier,
            log: log.clone(),
        }
    }

    /// Record identify data for `nsid`. Unsupported namespaces are kept
    /// offline.
    pub fn update(&self, nsid: u32, id: &IdentifyNamespace) {
        let (supported, block_size) = match validate_namespace(id) {
            Ok(bs) => (true, bs),
            Err(_) => {
                warn!(self.log, "namespace format not supported, forcing offline";
                    "nsid" => nsid);
                (false, 0)
            }
        };
        let supported = supported && id.nsze != 0;
        let mut namespaces = self.namespaces.lock().unwrap();
        let online = namespaces.get(&nsid).map(|ns| ns.online).unwrap_or(false);
        namespaces.insert(
            nsid,
            Namespace {
                nsid,
                blocks: id.nsze,
                block_size,
                supported,
                online: online && supported,
            },
        );
    }

    /// Bring every supported namespace online and have paths claimed.
    pub fn ctrlr_online(&self) {
        let count = {
            let mut namespaces = self.namespaces.lock().unwrap();
            namespaces
                .values_mut()
                .filter(|ns| ns.supported)
                .map(|ns| ns.online = true)
                .count()
        };
        info!(self.log, "namespaces online"; "count" => count);
        self.notifier.scan_and_claim();
    }

    /// Mark every namespace offline.
    ///
    /// Paths are deliberately left in place: unclaiming blocks, and may not
    /// be done from the contexts which take controllers offline.
    pub fn ctrlr_offline(&self) {
        let mut namespaces = self.namespaces.lock().unwrap();
        for ns in namespaces.values_mut() {
            ns.online = false;
        }
    }

    /// Take a single namespace offline, dropping its path.
    pub fn namespace_offline(&self, nsid: u32) -> Result<(), NvmeError> {
        let was_online = {
            let mut namespaces = self.namespaces.lock().unwrap();
            let ns = namespaces.get_mut(&nsid).ok_or(NvmeError::BadParam)?;
            std::mem::replace(&mut ns.online, false)
        };
        if was_online {
            self.notifier.delete_path(nsid);
        }
        Ok(())
    }

    /// The device went away: nothing is reachable any more.
    pub fn lost(&self) {
        self.ctrlr_offline();
        self.notifier.paths_lost();
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        self.namespaces.lock().unwrap().values().copied().collect()
    }

    pub fn online_count(&self) -> usize {
        self.namespaces.lock().unwrap().values().filter(|ns| ns.online).count()
    }
}
