//! Mounted volumes and the mount table.
//!
//! A [`Mount`] binds a filesystem driver stack to a device id and (except
//! for the root mount) to the directory node it covers. The heavy
//! mount/unmount state machines live in [`crate::vfs`]; this module owns
//! the data structures and the named-driver registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::entry_cache::EntryCache;
use crate::errno::{Errno, Result};
use crate::fs::{FileSystem, Volume};
use crate::ids::DeviceId;
use crate::node::Vnode;

bitflags! {
    /// Flags accepted by `mount`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MountFlags: u32 {
        /// Mount the volume read-only.
        const READ_ONLY = 1 << 0;
        /// The device argument does not name a real device.
        const VIRTUAL_DEVICE = 1 << 1;
    }
}

bitflags! {
    /// Flags accepted by `unmount`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnmountFlags: u32 {
        /// Disconnect busy descriptors instead of failing with `EBUSY`.
        const FORCE = 1 << 0;
    }
}

/// One mounted filesystem instance.
pub struct Mount {
    id: DeviceId,
    fs_name: String,
    device_name: Option<String>,
    flags: MountFlags,
    /// Driver layer stack, bottom layer first. Set once during `mount`,
    /// after the mount is already discoverable (drivers publish their root
    /// while mounting).
    layers: OnceLock<Vec<Arc<dyn Volume>>>,
    pub(crate) root: Mutex<Option<Arc<Vnode>>>,
    pub(crate) covers: Mutex<Option<Arc<Vnode>>>,
    pub(crate) unmounting: AtomicBool,
    pub(crate) owns_file_device: bool,
    pub(crate) entry_cache: EntryCache,
    /// All live nodes of this mount, for unmount/sync iteration.
    pub(crate) nodes: Mutex<Vec<Weak<Vnode>>>,
}

impl Mount {
    pub(crate) fn new(
        id: DeviceId,
        fs_name: &str,
        device_name: Option<&str>,
        flags: MountFlags,
        owns_file_device: bool,
        entry_cache: EntryCache,
    ) -> Mount {
        Mount {
            id,
            fs_name: fs_name.to_owned(),
            device_name: device_name.map(str::to_owned),
            flags,
            layers: OnceLock::new(),
            root: Mutex::new(None),
            covers: Mutex::new(None),
            unmounting: AtomicBool::new(false),
            owns_file_device,
            entry_cache,
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// The mount's device id.
    pub fn device(&self) -> DeviceId {
        self.id
    }

    /// The (possibly colon-separated) filesystem name given at mount time.
    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    /// The device argument given at mount time.
    pub fn device_name(&self) -> Option<&str> {
        self.device_name.as_deref()
    }

    /// Mount-time flags.
    pub fn flags(&self) -> MountFlags {
        self.flags
    }

    pub(crate) fn set_layers(&self, layers: Vec<Arc<dyn Volume>>) {
        if self.layers.set(layers).is_err() {
            panic!("mount {} layers set twice", self.id);
        }
    }

    /// The operative (topmost) volume layer.
    pub fn volume(&self) -> &Arc<dyn Volume> {
        self.layers
            .get()
            .and_then(|layers| layers.last())
            .expect("mount has no volume")
    }

    /// All volume layers, bottom first. Empty until the driver stack has
    /// finished mounting.
    pub fn layers(&self) -> &[Arc<dyn Volume>] {
        self.layers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn is_unmounting(&self) -> bool {
        self.unmounting.load(Ordering::Acquire)
    }

    /// A reference to the mount's root node, while mounted.
    pub fn root_node(&self) -> Option<Arc<Vnode>> {
        self.root.lock().clone()
    }

    pub(crate) fn add_node(&self, node: &Arc<Vnode>) {
        self.nodes.lock().push(Arc::downgrade(node));
    }

    pub(crate) fn remove_node(&self, node: &Arc<Vnode>) {
        let mut nodes = self.nodes.lock();
        nodes.retain(|candidate| {
            candidate
                .upgrade()
                .is_some_and(|live| !Arc::ptr_eq(&live, node))
        });
    }

    /// Snapshot of the mount's live nodes.
    pub(crate) fn live_nodes(&self) -> Vec<Arc<Vnode>> {
        self.nodes.lock().iter().filter_map(Weak::upgrade).collect()
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("fs_name", &self.fs_name)
            .field("unmounting", &self.is_unmounting())
            .finish_non_exhaustive()
    }
}

/// Registry of mounted volumes, keyed by device id.
#[derive(Default)]
pub(crate) struct MountTable {
    mounts: RwLock<HashMap<DeviceId, Arc<Mount>>>,
}

impl MountTable {
    pub(crate) fn get(&self, id: DeviceId) -> Option<Arc<Mount>> {
        self.mounts.read().get(&id).cloned()
    }

    pub(crate) fn insert(&self, mount: Arc<Mount>) {
        self.mounts.write().insert(mount.device(), mount);
    }

    pub(crate) fn remove(&self, id: DeviceId) -> Option<Arc<Mount>> {
        self.mounts.write().remove(&id)
    }

    pub(crate) fn all(&self) -> Vec<Arc<Mount>> {
        self.mounts.read().values().cloned().collect()
    }
}

/// Registry of named filesystem drivers.
#[derive(Default)]
pub(crate) struct FileSystemRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn FileSystem>>>,
}

impl FileSystemRegistry {
    pub(crate) fn register(&self, driver: Arc<dyn FileSystem>) -> Result<()> {
        let mut drivers = self.drivers.write();
        if drivers.contains_key(driver.name()) {
            return Err(Errno::EEXIST);
        }
        drivers.insert(driver.name().to_owned(), driver);
        Ok(())
    }

    pub(crate) fn unregister(&self, name: &str) -> Result<()> {
        match self.drivers.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(Errno::ENOENT),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Result<Arc<dyn FileSystem>> {
        self.drivers.read().get(name).cloned().ok_or(Errno::ENOENT)
    }
}

/// Splits a colon-separated stack specification into its layer names,
/// bottom layer first. Rejects empty components.
pub(crate) fn layer_names(fs_name: &str) -> Result<Vec<&str>> {
    if fs_name.is_empty() {
        return Err(Errno::EINVAL);
    }
    let names: Vec<&str> = fs_name.split(':').collect();
    if names.iter().any(|name| name.is_empty()) {
        return Err(Errno::EINVAL);
    }
    Ok(names)
}
