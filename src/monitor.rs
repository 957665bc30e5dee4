//! The node-event notification service.
//!
//! Listeners subscribe either to one `(volume, node)` pair or to a whole
//! volume, each with a mask of event flavors. A notifying thread collects
//! the interested sub-lists (volume, the node itself, the source directory
//! and the destination directory for moves), then delivers the event to
//! every listener whose mask matches, followed by a completion callback.
//! Query updates bypass the tables entirely and go straight to the given
//! listener.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use log::warn;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::context::IoContext;
use crate::errno::{Errno, Result};
use crate::ids::{ContextId, DeviceId, NodeId};
use crate::stat::StatFields;

bitflags! {
    /// Event flavors a listener can subscribe to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WatchFlags: u32 {
        /// A directory entry was created.
        const ENTRY_CREATED = 1 << 0;
        /// A directory entry was removed.
        const ENTRY_REMOVED = 1 << 1;
        /// A directory entry changed its name or parent.
        const ENTRY_MOVED = 1 << 2;
        /// Node metadata changed.
        const STAT_CHANGED = 1 << 3;
        /// An attribute was created, removed or rewritten.
        const ATTR_CHANGED = 1 << 4;
        /// A volume was mounted or unmounted.
        const MOUNT = 1 << 5;
    }
}

impl WatchFlags {
    /// Everything.
    pub const ALL: WatchFlags = WatchFlags::all();
}

/// What happened to an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrCause {
    /// The attribute was created.
    Created,
    /// The attribute was removed.
    Removed,
    /// The attribute's content changed.
    Changed,
}

/// One node event, as delivered to listeners.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// An entry appeared in a directory.
    EntryCreated {
        /// Volume of the directory.
        device: DeviceId,
        /// The containing directory.
        directory: NodeId,
        /// The new entry's name.
        name: String,
        /// The new entry's node.
        node: NodeId,
    },
    /// An entry disappeared from a directory.
    EntryRemoved {
        /// Volume of the directory.
        device: DeviceId,
        /// The containing directory.
        directory: NodeId,
        /// The removed entry's name.
        name: String,
        /// The removed entry's node.
        node: NodeId,
    },
    /// An entry changed name and/or directory.
    EntryMoved {
        /// Volume of both directories.
        device: DeviceId,
        /// Directory the entry left.
        from_directory: NodeId,
        /// Previous name.
        from_name: String,
        /// Directory the entry entered.
        to_directory: NodeId,
        /// New name.
        to_name: String,
        /// The moved node.
        node: NodeId,
    },
    /// Node metadata changed.
    StatChanged {
        /// The node's volume.
        device: DeviceId,
        /// The node.
        node: NodeId,
        /// Which stat fields changed.
        fields: StatFields,
    },
    /// An attribute changed.
    AttrChanged {
        /// The node's volume.
        device: DeviceId,
        /// The node.
        node: NodeId,
        /// The attribute's name.
        attribute: String,
        /// What happened to it.
        cause: AttrCause,
    },
    /// A volume was mounted.
    Mounted {
        /// The new volume.
        device: DeviceId,
        /// Volume of the covered directory, if any.
        covered_device: Option<DeviceId>,
        /// The covered directory, if any.
        covered_directory: Option<NodeId>,
    },
    /// A volume was unmounted.
    Unmounted {
        /// The volume that went away.
        device: DeviceId,
    },
}

impl NodeEvent {
    /// The flavor bit this event matches against listener masks.
    pub fn flavor(&self) -> WatchFlags {
        match self {
            NodeEvent::EntryCreated { .. } => WatchFlags::ENTRY_CREATED,
            NodeEvent::EntryRemoved { .. } => WatchFlags::ENTRY_REMOVED,
            NodeEvent::EntryMoved { .. } => WatchFlags::ENTRY_MOVED,
            NodeEvent::StatChanged { .. } => WatchFlags::STAT_CHANGED,
            NodeEvent::AttrChanged { .. } => WatchFlags::ATTR_CHANGED,
            NodeEvent::Mounted { .. } | NodeEvent::Unmounted { .. } => WatchFlags::MOUNT,
        }
    }
}

/// Receives node events. Implementations must tolerate delivery from any
/// thread.
pub trait EventListener: Send + Sync {
    /// One event matching the listener's mask occurred.
    fn event_occurred(&self, event: &NodeEvent);

    /// Called after an event has been delivered to every interested
    /// listener.
    fn all_listeners_notified(&self) {}
}

/// Identity of a user-land listener: a `(port, token)` pair. Re-registering
/// with the same identity updates the existing subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortToken {
    /// The message port.
    pub port: i32,
    /// The per-port token.
    pub token: i32,
}

struct MonitorListener {
    listener: Arc<dyn EventListener>,
    flags: WatchFlags,
    context: ContextId,
    identity: Option<PortToken>,
}

#[derive(Default)]
struct Monitor {
    listeners: Vec<MonitorListener>,
}

#[derive(Default)]
struct MonitorState {
    node_monitors: HashMap<(DeviceId, NodeId), Monitor>,
    volume_monitors: HashMap<DeviceId, Monitor>,
    context_counts: HashMap<ContextId, usize>,
}

/// The monitor tables and dispatch engine.
#[derive(Default)]
pub struct NodeMonitorService {
    state: Mutex<MonitorState>,
}

/// Scratch list of listeners collected for one dispatch; four sub-lists at
/// most, so this rarely spills to the heap.
type Interested = SmallVec<[Arc<dyn EventListener>; 8]>;

impl NodeMonitorService {
    /// Subscribes `listener` to events on `(device, node)`, or on the whole
    /// volume when `node` is `None`. Re-subscribing the same user identity
    /// augments the existing flag mask.
    pub fn add_listener(
        &self,
        context: &IoContext,
        device: DeviceId,
        node: Option<NodeId>,
        flags: WatchFlags,
        identity: Option<PortToken>,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        if flags.is_empty() {
            return Err(Errno::EINVAL);
        }

        let mut state = self.state.lock();

        let monitor = match node {
            Some(node) => state.node_monitors.entry((device, node)).or_default(),
            None => state.volume_monitors.entry(device).or_default(),
        };

        if let Some(existing) = monitor.listeners.iter_mut().find(|candidate| {
            match (identity, candidate.identity) {
                (Some(identity), Some(existing)) => identity == existing,
                _ => Arc::ptr_eq(&candidate.listener, &listener),
            }
        }) {
            existing.flags |= flags;
            return Ok(());
        }

        let count = state
            .context_counts
            .get(&context.id())
            .copied()
            .unwrap_or(0);
        if count >= context.max_monitors {
            warn!(
                "context {:?} hit its node monitor limit ({})",
                context.id(),
                context.max_monitors
            );
            return Err(Errno::ENOMEM);
        }

        let entry = MonitorListener {
            listener,
            flags,
            context: context.id(),
            identity,
        };
        match node {
            Some(node) => state
                .node_monitors
                .entry((device, node))
                .or_default()
                .listeners
                .push(entry),
            None => state
                .volume_monitors
                .entry(device)
                .or_default()
                .listeners
                .push(entry),
        }
        *state.context_counts.entry(context.id()).or_insert(0) += 1;
        Ok(())
    }

    /// Removes the subscription of `listener` (or of the user identity) on
    /// `(device, node)`.
    pub fn remove_listener(
        &self,
        device: DeviceId,
        node: Option<NodeId>,
        identity: Option<PortToken>,
        listener: Option<&Arc<dyn EventListener>>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let key_matches = |candidate: &MonitorListener| match (identity, candidate.identity) {
            (Some(identity), Some(existing)) => identity == existing,
            _ => listener.is_some_and(|wanted| Arc::ptr_eq(&candidate.listener, wanted)),
        };

        let (removed, context) = {
            let monitor = match node {
                Some(node) => state.node_monitors.get_mut(&(device, node)),
                None => state.volume_monitors.get_mut(&device),
            };
            let Some(monitor) = monitor else {
                return Err(Errno::ENOENT);
            };
            let Some(position) = monitor.listeners.iter().position(key_matches) else {
                return Err(Errno::ENOENT);
            };
            let entry = monitor.listeners.remove(position);
            (monitor.listeners.is_empty(), entry.context)
        };

        if removed {
            match node {
                Some(node) => {
                    state.node_monitors.remove(&(device, node));
                }
                None => {
                    state.volume_monitors.remove(&device);
                }
            }
        }
        if let Some(count) = state.context_counts.get_mut(&context) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    /// Drops every subscription of the user identity, wherever registered.
    pub fn remove_user_listeners(&self, identity: PortToken) {
        let mut state = self.state.lock();
        let mut freed: Vec<ContextId> = Vec::new();

        state.node_monitors.retain(|_, monitor| {
            monitor.listeners.retain(|entry| {
                let matches = entry.identity == Some(identity);
                if matches {
                    freed.push(entry.context);
                }
                !matches
            });
            !monitor.listeners.is_empty()
        });
        state.volume_monitors.retain(|_, monitor| {
            monitor.listeners.retain(|entry| {
                let matches = entry.identity == Some(identity);
                if matches {
                    freed.push(entry.context);
                }
                !matches
            });
            !monitor.listeners.is_empty()
        });

        for context in freed {
            if let Some(count) = state.context_counts.get_mut(&context) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Drops every subscription made through `context`, as part of its
    /// teardown.
    pub fn remove_context_listeners(&self, context: ContextId) {
        let mut state = self.state.lock();
        state.node_monitors.retain(|_, monitor| {
            monitor.listeners.retain(|entry| entry.context != context);
            !monitor.listeners.is_empty()
        });
        state.volume_monitors.retain(|_, monitor| {
            monitor.listeners.retain(|entry| entry.context != context);
            !monitor.listeners.is_empty()
        });
        state.context_counts.remove(&context);
    }

    /// Collects the interested listeners for `event` out of the volume
    /// list plus up to three node-keyed lists.
    fn collect(
        &self,
        device: DeviceId,
        nodes: &[NodeId],
        flavor: WatchFlags,
    ) -> Interested {
        let state = self.state.lock();
        let mut interested: Interested = SmallVec::new();

        let mut push_matching = |monitor: &Monitor| {
            for entry in &monitor.listeners {
                if entry.flags.intersects(flavor)
                    && !interested
                        .iter()
                        .any(|known| Arc::ptr_eq(known, &entry.listener))
                {
                    interested.push(entry.listener.clone());
                }
            }
        };

        if let Some(monitor) = state.volume_monitors.get(&device) {
            push_matching(monitor);
        }
        for node in nodes {
            if let Some(monitor) = state.node_monitors.get(&(device, *node)) {
                push_matching(monitor);
            }
        }
        interested
    }

    fn dispatch(&self, device: DeviceId, nodes: &[NodeId], event: NodeEvent) {
        let interested = self.collect(device, nodes, event.flavor());
        for listener in &interested {
            listener.event_occurred(&event);
        }
        for listener in &interested {
            listener.all_listeners_notified();
        }
    }

    /// An entry named `name` appeared in `directory`.
    pub fn notify_entry_created(
        &self,
        device: DeviceId,
        directory: NodeId,
        name: &str,
        node: NodeId,
    ) {
        self.dispatch(
            device,
            &[directory, node],
            NodeEvent::EntryCreated {
                device,
                directory,
                name: name.to_owned(),
                node,
            },
        );
    }

    /// The entry named `name` disappeared from `directory`.
    pub fn notify_entry_removed(
        &self,
        device: DeviceId,
        directory: NodeId,
        name: &str,
        node: NodeId,
    ) {
        self.dispatch(
            device,
            &[directory, node],
            NodeEvent::EntryRemoved {
                device,
                directory,
                name: name.to_owned(),
                node,
            },
        );
    }

    /// An entry moved between directories and/or names.
    #[allow(clippy::too_many_arguments)]
    pub fn notify_entry_moved(
        &self,
        device: DeviceId,
        from_directory: NodeId,
        from_name: &str,
        to_directory: NodeId,
        to_name: &str,
        node: NodeId,
    ) {
        self.dispatch(
            device,
            &[from_directory, to_directory, node],
            NodeEvent::EntryMoved {
                device,
                from_directory,
                from_name: from_name.to_owned(),
                to_directory,
                to_name: to_name.to_owned(),
                node,
            },
        );
    }

    /// Node metadata changed; `fields` carries the affected stat fields.
    pub fn notify_stat_changed(&self, device: DeviceId, node: NodeId, fields: StatFields) {
        self.dispatch(
            device,
            &[node],
            NodeEvent::StatChanged {
                device,
                node,
                fields,
            },
        );
    }

    /// An attribute of `node` changed.
    pub fn notify_attr_changed(
        &self,
        device: DeviceId,
        node: NodeId,
        attribute: &str,
        cause: AttrCause,
    ) {
        self.dispatch(
            device,
            &[node],
            NodeEvent::AttrChanged {
                device,
                node,
                attribute: attribute.to_owned(),
                cause,
            },
        );
    }

    /// A volume was mounted. Mount events go to every volume listener that
    /// selected the `MOUNT` flavor.
    pub fn notify_mount(
        &self,
        device: DeviceId,
        covered_device: Option<DeviceId>,
        covered_directory: Option<NodeId>,
    ) {
        self.dispatch_to_all_volumes(NodeEvent::Mounted {
            device,
            covered_device,
            covered_directory,
        });
    }

    /// A volume was unmounted.
    pub fn notify_unmount(&self, device: DeviceId) {
        self.dispatch_to_all_volumes(NodeEvent::Unmounted { device });
    }

    fn dispatch_to_all_volumes(&self, event: NodeEvent) {
        let interested: Interested = {
            let state = self.state.lock();
            let mut interested: Interested = SmallVec::new();
            for monitor in state.volume_monitors.values() {
                for entry in &monitor.listeners {
                    if entry.flags.intersects(WatchFlags::MOUNT)
                        && !interested
                            .iter()
                            .any(|known| Arc::ptr_eq(known, &entry.listener))
                    {
                        interested.push(entry.listener.clone());
                    }
                }
            }
            interested
        };

        for listener in &interested {
            listener.event_occurred(&event);
        }
        for listener in &interested {
            listener.all_listeners_notified();
        }
    }
}

/// Direct query-update path: delivers an entry-created update straight to
/// `listener`, with no monitor-table lookup.
pub fn notify_query_entry_created(
    listener: &dyn EventListener,
    device: DeviceId,
    directory: NodeId,
    name: &str,
    node: NodeId,
) {
    listener.event_occurred(&NodeEvent::EntryCreated {
        device,
        directory,
        name: name.to_owned(),
        node,
    });
}

/// Direct query-update path for an entry leaving a query's result set.
pub fn notify_query_entry_removed(
    listener: &dyn EventListener,
    device: DeviceId,
    directory: NodeId,
    name: &str,
    node: NodeId,
) {
    listener.event_occurred(&NodeEvent::EntryRemoved {
        device,
        directory,
        name: name.to_owned(),
        node,
    });
}


impl std::fmt::Debug for NodeMonitorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NodeMonitorService")
            .field("node_monitors", &state.node_monitors.len())
            .field("volume_monitors", &state.volume_monitors.len())
            .finish()
    }
}
