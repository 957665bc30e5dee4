//! A memory-backed scratch filesystem driver for exercising the core.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use vfscore::{
    BoxedCookie, Cookie, DeviceId, DirCookie, DirEntry, Errno, FileSystem, FileType, IoContext,
    LoadedNode, MountContext, MountFlags, MountedVolume, NodeId, NodeOps, NodeStat, PublishFlags,
    Result, StatFields, Vfs, Vnode, Volume,
};

/// Seed content for a freshly mounted scratch volume.
#[derive(Clone)]
pub enum Seed {
    /// A regular file with the given contents.
    File(&'static [u8]),
    /// An empty directory.
    Dir,
    /// A symbolic link to the given target.
    Symlink(&'static str),
}

struct Record {
    mode: u32,
    parent: i64,
    data: Vec<u8>,
    entries: BTreeMap<String, i64>,
    target: String,
    attrs: BTreeMap<String, Vec<u8>>,
    nlink: u32,
}

impl Record {
    fn new(mode: u32, parent: i64) -> Record {
        Record {
            mode,
            parent,
            data: Vec::new(),
            entries: BTreeMap::new(),
            target: String::new(),
            attrs: BTreeMap::new(),
            nlink: 1,
        }
    }

    fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }
}

struct State {
    records: HashMap<i64, Record>,
    next_id: i64,
}

/// One mounted scratch volume.
pub struct ScratchVolume {
    device: DeviceId,
    core: Weak<Vfs>,
    me: Weak<ScratchVolume>,
    state: Mutex<State>,
}

const ROOT_ID: i64 = 1;

impl ScratchVolume {
    fn alloc(&self, state: &mut State, mode: u32, parent: i64) -> i64 {
        let id = state.next_id;
        state.next_id += 1;
        state.records.insert(id, Record::new(mode, parent));
        id
    }

    fn ops(&self, id: i64) -> Arc<dyn NodeOps> {
        Arc::new(ScratchOps {
            volume: self.me.upgrade().expect("volume gone"),
            id,
        })
    }

    /// Raw file contents, for assertions.
    pub fn contents(&self, id: NodeId) -> Option<Vec<u8>> {
        self.state.lock().records.get(&id.0).map(|r| r.data.clone())
    }
}

impl Volume for ScratchVolume {
    fn get_node(&self, id: NodeId, _reenter: bool) -> Result<LoadedNode> {
        let state = self.state.lock();
        let record = state.records.get(&id.0).ok_or(Errno::ENOENT)?;
        let mode = record.mode;
        drop(state);

        Ok(LoadedNode {
            ops: self.ops(id.0),
            mode,
            flags: PublishFlags::empty(),
        })
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

struct ScratchOps {
    volume: Arc<ScratchVolume>,
    id: i64,
}

impl ScratchOps {
    fn with_record<T>(&self, f: impl FnOnce(&Record) -> T) -> Result<T> {
        let state = self.volume.state.lock();
        state.records.get(&self.id).map(f).ok_or(Errno::ENOENT)
    }

    fn with_record_mut<T>(&self, f: impl FnOnce(&mut Record) -> T) -> Result<T> {
        let mut state = self.volume.state.lock();
        state.records.get_mut(&self.id).map(f).ok_or(Errno::ENOENT)
    }

    fn mark_removed_if_unlinked(&self, id: i64) {
        let unlinked = {
            let state = self.volume.state.lock();
            state
                .records
                .get(&id)
                .is_some_and(|record| record.nlink == 0)
        };
        if unlinked {
            if let Some(vfs) = self.volume.core.upgrade() {
                let _ = vfs.remove_node(self.volume.device, NodeId(id));
            }
        }
    }
}

struct ListCookie {
    entries: Vec<DirEntry>,
    position: usize,
}

impl DirCookie for ListCookie {
    fn read_entry(&mut self) -> Result<Option<DirEntry>> {
        let entry = self.entries.get(self.position).cloned();
        if entry.is_some() {
            self.position += 1;
        }
        Ok(entry)
    }

    fn rewind(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

struct AttrCookie {
    name: String,
}

impl NodeOps for ScratchOps {
    fn put(&self, _node: &Vnode) {
        // Records of unlinked nodes die with the last core reference.
        let mut state = self.volume.state.lock();
        let unlinked = state
            .records
            .get(&self.id)
            .is_some_and(|record| record.nlink == 0);
        if unlinked {
            state.records.remove(&self.id);
        }
    }

    fn remove(&self, _node: &Vnode) {
        self.volume.state.lock().records.remove(&self.id);
    }

    fn lookup(&self, _dir: &Vnode, name: &str) -> Result<NodeId> {
        let state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if !record.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        match name {
            "." => Ok(NodeId(self.id)),
            ".." => Ok(NodeId(record.parent)),
            _ => record.entries.get(name).map(|id| NodeId(*id)).ok_or(Errno::ENOENT),
        }
    }

    fn open_dir(&self, _node: &Vnode) -> Result<Box<dyn DirCookie>> {
        let state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if !record.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let mut entries = vec![
            DirEntry {
                device: self.volume.device,
                node: NodeId(self.id),
                name: ".".to_owned(),
            },
            DirEntry {
                device: self.volume.device,
                node: NodeId(record.parent),
                name: "..".to_owned(),
            },
        ];
        entries.extend(record.entries.iter().map(|(name, id)| DirEntry {
            device: self.volume.device,
            node: NodeId(*id),
            name: name.clone(),
        }));
        Ok(Box::new(ListCookie {
            entries,
            position: 0,
        }))
    }

    fn create_dir(&self, _dir: &Vnode, name: &str, perms: u32) -> Result<()> {
        let mut state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if record.entries.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let id = self.volume.alloc(
            &mut state,
            libc::S_IFDIR | (perms & 0o7777),
            self.id,
        );
        state
            .records
            .get_mut(&self.id)
            .unwrap()
            .entries
            .insert(name.to_owned(), id);
        Ok(())
    }

    fn remove_dir(&self, _dir: &Vnode, name: &str) -> Result<()> {
        let mut state = self.volume.state.lock();
        let id = {
            let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
            *record.entries.get(name).ok_or(Errno::ENOENT)?
        };
        {
            let target = state.records.get(&id).ok_or(Errno::ENOENT)?;
            if !target.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            if !target.entries.is_empty() {
                return Err(Errno::ENOTEMPTY);
            }
        }
        state.records.get_mut(&self.id).unwrap().entries.remove(name);
        if let Some(target) = state.records.get_mut(&id) {
            target.nlink = 0;
        }
        drop(state);
        self.mark_removed_if_unlinked(id);
        Ok(())
    }

    fn create(
        &self,
        _dir: &Vnode,
        name: &str,
        _open_mode: vfscore::OpenFlags,
        perms: u32,
    ) -> Result<(NodeId, BoxedCookie)> {
        let mut state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if !record.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        if let Some(existing) = record.entries.get(name) {
            return Ok((NodeId(*existing), Box::new(())));
        }
        let id = self.volume.alloc(
            &mut state,
            libc::S_IFREG | (perms & 0o7777),
            self.id,
        );
        state
            .records
            .get_mut(&self.id)
            .unwrap()
            .entries
            .insert(name.to_owned(), id);
        Ok((NodeId(id), Box::new(())))
    }

    fn create_special(&self, _dir: &Vnode, name: &str, mode: u32, _perms: u32) -> Result<NodeId> {
        let mut state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if record.entries.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let id = self.volume.alloc(&mut state, mode, self.id);
        state
            .records
            .get_mut(&self.id)
            .unwrap()
            .entries
            .insert(name.to_owned(), id);
        Ok(NodeId(id))
    }

    fn open(&self, _node: &Vnode, open_mode: vfscore::OpenFlags) -> Result<BoxedCookie> {
        if open_mode.0 & libc::O_TRUNC != 0 && open_mode.writable() {
            self.with_record_mut(|record| record.data.clear())?;
        }
        Ok(Box::new(()))
    }

    fn read(&self, _node: &Vnode, _cookie: &Cookie, pos: i64, buf: &mut [u8]) -> Result<usize> {
        self.with_record(|record| {
            let pos = pos.max(0) as usize;
            if pos >= record.data.len() {
                return 0;
            }
            let available = &record.data[pos..];
            let length = available.len().min(buf.len());
            buf[..length].copy_from_slice(&available[..length]);
            length
        })
    }

    fn write(&self, _node: &Vnode, _cookie: &Cookie, pos: i64, buf: &[u8]) -> Result<usize> {
        self.with_record_mut(|record| {
            let pos = pos.max(0) as usize;
            if record.data.len() < pos + buf.len() {
                record.data.resize(pos + buf.len(), 0);
            }
            record.data[pos..pos + buf.len()].copy_from_slice(buf);
            buf.len()
        })
    }

    fn read_stat(&self, node: &Vnode) -> Result<NodeStat> {
        self.with_record(|record| {
            let mut stat = NodeStat::for_mode(node.device(), node.id(), record.mode);
            stat.size = record.data.len() as i64;
            stat.nlink = record.nlink;
            stat
        })
    }

    fn write_stat(&self, _node: &Vnode, stat: &NodeStat, fields: StatFields) -> Result<()> {
        self.with_record_mut(|record| {
            if fields.contains(StatFields::MODE) {
                record.mode = (record.mode & libc::S_IFMT) | (stat.mode & !libc::S_IFMT);
            }
            if fields.contains(StatFields::SIZE) {
                record.data.resize(stat.size.max(0) as usize, 0);
            }
        })
    }

    fn create_symlink(&self, _dir: &Vnode, name: &str, target: &str, perms: u32) -> Result<()> {
        let mut state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if record.entries.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        let id = self.volume.alloc(
            &mut state,
            libc::S_IFLNK | (perms & 0o7777),
            self.id,
        );
        state.records.get_mut(&id).unwrap().target = target.to_owned();
        state
            .records
            .get_mut(&self.id)
            .unwrap()
            .entries
            .insert(name.to_owned(), id);
        Ok(())
    }

    fn read_symlink(&self, _node: &Vnode) -> Result<String> {
        self.with_record(|record| record.target.clone())
    }

    fn link(&self, _dir: &Vnode, name: &str, target: &Vnode) -> Result<()> {
        let mut state = self.volume.state.lock();
        let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
        if record.entries.contains_key(name) {
            return Err(Errno::EEXIST);
        }
        state
            .records
            .get_mut(&self.id)
            .unwrap()
            .entries
            .insert(name.to_owned(), target.id().0);
        if let Some(linked) = state.records.get_mut(&target.id().0) {
            linked.nlink += 1;
        }
        Ok(())
    }

    fn unlink(&self, _dir: &Vnode, name: &str) -> Result<()> {
        let mut state = self.volume.state.lock();
        let id = {
            let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
            *record.entries.get(name).ok_or(Errno::ENOENT)?
        };
        if state.records.get(&id).is_some_and(Record::is_dir) {
            return Err(Errno::EISDIR);
        }
        state.records.get_mut(&self.id).unwrap().entries.remove(name);
        if let Some(target) = state.records.get_mut(&id) {
            target.nlink = target.nlink.saturating_sub(1);
        }
        drop(state);
        self.mark_removed_if_unlinked(id);
        Ok(())
    }

    fn rename(
        &self,
        _from_dir: &Vnode,
        from_name: &str,
        to_dir: &Vnode,
        to_name: &str,
    ) -> Result<()> {
        let mut state = self.volume.state.lock();
        let id = {
            let record = state.records.get(&self.id).ok_or(Errno::ENOENT)?;
            *record.entries.get(from_name).ok_or(Errno::ENOENT)?
        };
        state
            .records
            .get_mut(&self.id)
            .unwrap()
            .entries
            .remove(from_name);
        state
            .records
            .get_mut(&to_dir.id().0)
            .ok_or(Errno::ENOENT)?
            .entries
            .insert(to_name.to_owned(), id);
        if let Some(moved) = state.records.get_mut(&id) {
            moved.parent = to_dir.id().0;
        }
        Ok(())
    }

    fn open_attr_dir(&self, _node: &Vnode) -> Result<Box<dyn DirCookie>> {
        let entries = self.with_record(|record| {
            record
                .attrs
                .keys()
                .map(|name| DirEntry {
                    device: self.volume.device,
                    node: NodeId(self.id),
                    name: name.clone(),
                })
                .collect::<Vec<_>>()
        })?;
        Ok(Box::new(ListCookie {
            entries,
            position: 0,
        }))
    }

    fn open_attr(
        &self,
        _node: &Vnode,
        name: &str,
        _open_mode: vfscore::OpenFlags,
    ) -> Result<BoxedCookie> {
        self.with_record(|record| record.attrs.contains_key(name))?
            .then(|| -> BoxedCookie {
                Box::new(AttrCookie {
                    name: name.to_owned(),
                })
            })
            .ok_or(Errno::ENOENT)
    }

    fn create_attr(
        &self,
        _node: &Vnode,
        name: &str,
        _attr_type: u32,
        _open_mode: vfscore::OpenFlags,
    ) -> Result<BoxedCookie> {
        self.with_record_mut(|record| {
            record.attrs.entry(name.to_owned()).or_default();
        })?;
        Ok(Box::new(AttrCookie {
            name: name.to_owned(),
        }))
    }

    fn read_attr(&self, _node: &Vnode, cookie: &Cookie, pos: i64, buf: &mut [u8]) -> Result<usize> {
        let cookie = cookie.downcast_ref::<AttrCookie>().ok_or(Errno::EBADF)?;
        self.with_record(|record| {
            let Some(data) = record.attrs.get(&cookie.name) else {
                return 0;
            };
            let pos = pos.max(0) as usize;
            if pos >= data.len() {
                return 0;
            }
            let available = &data[pos..];
            let length = available.len().min(buf.len());
            buf[..length].copy_from_slice(&available[..length]);
            length
        })
    }

    fn write_attr(&self, _node: &Vnode, cookie: &Cookie, pos: i64, buf: &[u8]) -> Result<usize> {
        let cookie = cookie.downcast_ref::<AttrCookie>().ok_or(Errno::EBADF)?;
        self.with_record_mut(|record| {
            let data = record.attrs.entry(cookie.name.clone()).or_default();
            let pos = pos.max(0) as usize;
            if data.len() < pos + buf.len() {
                data.resize(pos + buf.len(), 0);
            }
            data[pos..pos + buf.len()].copy_from_slice(buf);
            buf.len()
        })
    }

    fn remove_attr(&self, _node: &Vnode, name: &str) -> Result<()> {
        self.with_record_mut(|record| record.attrs.remove(name).map(|_| ()))?
            .ok_or(Errno::ENOENT)
    }

    fn rename_attr(&self, _node: &Vnode, from_name: &str, to_name: &str) -> Result<()> {
        self.with_record_mut(|record| {
            let data = record.attrs.remove(from_name).ok_or(Errno::ENOENT)?;
            record.attrs.insert(to_name.to_owned(), data);
            Ok(())
        })?
    }
}

/// The registered scratch filesystem driver.
pub struct ScratchFs {
    name: String,
    seed: Vec<(&'static str, Seed)>,
}

impl ScratchFs {
    pub fn new(name: &str) -> Arc<ScratchFs> {
        Arc::new(ScratchFs {
            name: name.to_owned(),
            seed: Vec::new(),
        })
    }

    /// A driver whose volumes come up pre-populated.
    pub fn with_seed(name: &str, seed: Vec<(&'static str, Seed)>) -> Arc<ScratchFs> {
        Arc::new(ScratchFs {
            name: name.to_owned(),
            seed,
        })
    }
}

impl FileSystem for ScratchFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn mount(
        &self,
        ctx: &MountContext<'_>,
        _device: Option<&str>,
        _args: Option<&str>,
    ) -> Result<MountedVolume> {
        let volume = Arc::new_cyclic(|me| ScratchVolume {
            device: ctx.device(),
            core: ctx.core(),
            me: me.clone(),
            state: Mutex::new(State {
                records: HashMap::new(),
                next_id: ROOT_ID,
            }),
        });

        {
            let mut state = volume.state.lock();
            let root = volume.alloc(&mut state, libc::S_IFDIR | 0o755, ROOT_ID);
            assert_eq!(root, ROOT_ID);

            for (path, seed) in &self.seed {
                let mut dir = ROOT_ID;
                let components: Vec<&str> = path.trim_matches('/').split('/').collect();
                let (leaf, parents) = components.split_last().unwrap();
                for component in parents {
                    let existing = state.records[&dir].entries.get(*component).copied();
                    dir = match existing {
                        Some(id) => id,
                        None => {
                            let id = volume.alloc(&mut state, libc::S_IFDIR | 0o755, dir);
                            state
                                .records
                                .get_mut(&dir)
                                .unwrap()
                                .entries
                                .insert((*component).to_owned(), id);
                            id
                        }
                    };
                }

                let id = match seed {
                    Seed::File(contents) => {
                        let id = volume.alloc(&mut state, libc::S_IFREG | 0o644, dir);
                        state.records.get_mut(&id).unwrap().data = contents.to_vec();
                        id
                    }
                    Seed::Dir => volume.alloc(&mut state, libc::S_IFDIR | 0o755, dir),
                    Seed::Symlink(target) => {
                        let id = volume.alloc(&mut state, libc::S_IFLNK | 0o777, dir);
                        state.records.get_mut(&id).unwrap().target = (*target).to_owned();
                        id
                    }
                };
                state
                    .records
                    .get_mut(&dir)
                    .unwrap()
                    .entries
                    .insert((*leaf).to_owned(), id);
            }
        }

        ctx.publish(
            NodeId(ROOT_ID),
            volume.ops(ROOT_ID),
            FileType::Directory.mode_bits() | 0o755,
            PublishFlags::empty(),
        )?;

        Ok(MountedVolume {
            volume,
            root: NodeId(ROOT_ID),
        })
    }
}

/// A core with a scratch root mounted and one context.
pub fn fresh_vfs() -> (Arc<Vfs>, Arc<IoContext>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::new();
    vfs.register_file_system(ScratchFs::new("scratchfs"))
        .unwrap();
    let context = vfs.new_io_context(None);
    vfs.mount(&context, "/", None, "scratchfs", MountFlags::empty(), None)
        .unwrap();
    (vfs, context)
}
