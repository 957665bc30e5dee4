//! The pipe/FIFO data engine.
//!
//! Every FIFO node is wrapped with an operation vector carrying an
//! [`Inode`]: a lazily allocated ring buffer, reader/writer counts, queues
//! of pending read and write requests and two select pools. Reads are
//! serialized through the request queue so concurrent readers consume in
//! arrival order; writes at or below [`ATOMIC_WRITE_SIZE`] bytes never
//! interleave with other writers' data.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::errno::{Errno, Result};
use crate::fs::{BoxedCookie, Cookie, NodeOps};
use crate::node::Vnode;
use crate::open_flags::OpenFlags;
use crate::select::{SelectEvents, SelectHandle, SelectPool};
use crate::stat::{NodeStat, StatFields};

/// Ring buffer capacity per FIFO.
pub const BUFFER_CAPACITY: usize = 64 * 1024;

/// Writes of at most this many bytes are not interleaved with other
/// writers' data.
pub const ATOMIC_WRITE_SIZE: usize = 512;

/// The FIFO ring buffer. Two cursors plus a free-space counter; allocated
/// only while the FIFO is active.
struct RingBuffer {
    buffer: Option<Box<[u8]>>,
    write_head: usize,
    read_head: usize,
    free: usize,
}

impl RingBuffer {
    const fn new() -> RingBuffer {
        RingBuffer {
            buffer: None,
            write_head: 0,
            read_head: 0,
            free: 0,
        }
    }

    fn create(&mut self) {
        if self.buffer.is_none() {
            self.buffer = Some(vec![0u8; BUFFER_CAPACITY].into_boxed_slice());
            self.write_head = 0;
            self.read_head = 0;
            self.free = BUFFER_CAPACITY;
        }
    }

    fn delete(&mut self) {
        self.buffer = None;
        self.free = 0;
    }

    fn exists(&self) -> bool {
        self.buffer.is_some()
    }

    fn readable(&self) -> usize {
        if self.buffer.is_none() {
            return 0;
        }
        BUFFER_CAPACITY - self.free
    }

    fn writable(&self) -> usize {
        self.free
    }

    /// Appends from `data`, but only when at least `minimum` bytes fit.
    /// Returns the bytes consumed and whether the buffer had been empty.
    fn write(&mut self, data: &[u8], minimum: usize) -> (usize, bool) {
        let Some(buffer) = self.buffer.as_mut() else {
            return (0, false);
        };
        if self.free == 0 || self.free < minimum {
            return (0, false);
        }
        let length = data.len().min(self.free);
        let was_empty = self.free == BUFFER_CAPACITY;

        let position = self.write_head;
        if position + length <= BUFFER_CAPACITY {
            buffer[position..position + length].copy_from_slice(&data[..length]);
        } else {
            let upper = BUFFER_CAPACITY - position;
            buffer[position..].copy_from_slice(&data[..upper]);
            buffer[..length - upper].copy_from_slice(&data[upper..length]);
        }

        self.write_head = (self.write_head + length) % BUFFER_CAPACITY;
        self.free -= length;
        (length, was_empty)
    }

    /// Consumes into `buf`. Returns the bytes produced and whether the
    /// buffer had been full.
    fn read(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let Some(buffer) = self.buffer.as_ref() else {
            return (0, false);
        };
        let readable = BUFFER_CAPACITY - self.free;
        let length = buf.len().min(readable);
        if length == 0 {
            return (0, false);
        }
        let was_full = self.free == 0;

        let position = self.read_head;
        if position + length <= BUFFER_CAPACITY {
            buf[..length].copy_from_slice(&buffer[position..position + length]);
        } else {
            let upper = BUFFER_CAPACITY - position;
            buf[..upper].copy_from_slice(&buffer[position..]);
            buf[upper..length].copy_from_slice(&buffer[..length - upper]);
        }

        self.read_head = (self.read_head + length) % BUFFER_CAPACITY;
        self.free += length;
        (length, was_full)
    }
}

/// Reader/writer counts and select pools, guarded by the change lock.
#[derive(Default)]
struct Ends {
    reader_count: i32,
    writer_count: i32,
    active: bool,
    read_pool: SelectPool,
    write_pool: SelectPool,
}

/// One blocked (or about to block) reader.
struct ReadRequest {
    cookie: usize,
    state: Mutex<ReadRequestState>,
    condition: Condvar,
}

struct ReadRequestState {
    notified: bool,
    error: Option<Errno>,
}

impl ReadRequest {
    fn new(cookie: usize) -> Arc<ReadRequest> {
        Arc::new(ReadRequest {
            cookie,
            state: Mutex::new(ReadRequestState {
                notified: true,
                error: None,
            }),
            condition: Condvar::new(),
        })
    }

    fn set_notified(&self, notified: bool) {
        self.state.lock().notified = notified;
    }

    fn notify(&self, error: Option<Errno>) {
        let mut state = self.state.lock();
        if !state.notified {
            state.notified = true;
            if state.error.is_none() {
                state.error = error;
            }
            self.condition.notify_all();
        }
    }

    /// Blocks until notified. The caller must not hold the change lock.
    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while !state.notified {
            self.condition.wait(&mut state);
        }
        match state.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// One waiting writer: its id and the contiguous space it insists on.
struct WriteRequest {
    minimum: usize,
}

/// The per-FIFO state machine.
pub(crate) struct Inode {
    /// Open/close and select registration take this exclusively; data
    /// transfer runs under the shared side.
    change_lock: RwLock<Ends>,
    ring: Mutex<RingBuffer>,
    read_requests: Mutex<VecDeque<Arc<ReadRequest>>>,
    write_requests: Mutex<Vec<WriteRequest>>,
    /// Writers and blocked openers wait for this generation to advance.
    activity: Mutex<u64>,
    activity_condition: Condvar,
}

impl Inode {
    fn new() -> Inode {
        Inode {
            change_lock: RwLock::new(Ends::default()),
            ring: Mutex::new(RingBuffer::new()),
            read_requests: Mutex::new(VecDeque::new()),
            write_requests: Mutex::new(Vec::new()),
            activity: Mutex::new(0),
            activity_condition: Condvar::new(),
        }
    }

    fn bytes_readable(&self) -> usize {
        self.ring.lock().readable()
    }

    fn bytes_writable(&self) -> usize {
        self.ring.lock().writable()
    }

    /// Wakes everything waiting on the activity condition.
    fn notify_activity(&self) {
        let mut generation = self.activity.lock();
        *generation += 1;
        self.activity_condition.notify_all();
    }

    /// Waits until the activity generation moves past `seen`.
    fn wait_for_activity(&self, seen: u64) {
        let mut generation = self.activity.lock();
        while *generation == seen {
            self.activity_condition.wait(&mut generation);
        }
    }

    fn activity_generation(&self) -> u64 {
        *self.activity.lock()
    }

    /// Opens one end. Blocks until the counterpart end shows up, unless
    /// `O_NONBLOCK` requests otherwise.
    fn open(&self, open_mode: OpenFlags) -> Result<()> {
        let mut ends = self.change_lock.write();

        if open_mode.writable() {
            ends.writer_count += 1;
        }
        if open_mode.readable() {
            ends.reader_count += 1;
        }

        let wait_for_reader = open_mode.writable() && !open_mode.readable();
        let wait_for_writer = open_mode.readable() && !open_mode.writable();

        if wait_for_reader && ends.reader_count == 0 {
            if open_mode.non_blocking() {
                ends.writer_count -= 1;
                return Err(Errno::ENXIO);
            }
            while ends.reader_count == 0 {
                let seen = self.activity_generation();
                drop(ends);
                self.wait_for_activity(seen);
                ends = self.change_lock.write();
            }
        } else if wait_for_writer && ends.writer_count == 0 && !open_mode.non_blocking() {
            while ends.writer_count == 0 {
                let seen = self.activity_generation();
                drop(ends);
                self.wait_for_activity(seen);
                ends = self.change_lock.write();
            }
        }

        if ends.reader_count > 0 && ends.writer_count > 0 {
            self.ring.lock().create();
            ends.active = true;

            // Waiting writers and openers may start now.
            ends.write_pool.notify(SelectEvents::WRITE);
            drop(ends);
            self.notify_activity();
        }
        Ok(())
    }

    /// Closes one end.
    fn close(&self, cookie: usize, open_mode: OpenFlags) {
        let mut ends = self.change_lock.write();

        // Kick every reader currently blocked through this cookie.
        for request in self.read_requests.lock().iter() {
            if request.cookie == cookie {
                request.notify(Some(Errno::EBADF));
            }
        }

        if open_mode.writable() {
            ends.writer_count -= 1;
            if ends.writer_count == 0 && self.bytes_readable() == 0 {
                // Last writer gone and nothing buffered: wake all readers
                // so they observe end-of-file.
                for request in self.read_requests.lock().iter() {
                    request.notify(None);
                }
                ends.read_pool.notify(SelectEvents::DISCONNECTED);
            }
        }

        if open_mode.readable() {
            ends.reader_count -= 1;
            if ends.reader_count == 0 {
                ends.write_pool.notify(SelectEvents::ERROR);
            }
        }

        let drained = ends.reader_count == 0 && ends.writer_count == 0;
        if drained {
            ends.active = false;
            self.ring.lock().delete();
        }
        drop(ends);

        // Blocked writers re-evaluate reader presence.
        self.notify_activity();
    }

    /// Writes `data`, honoring the atomic-write guarantee.
    fn write(&self, data: &[u8], non_blocking: bool) -> Result<usize> {
        // A zero-byte write never blocks and reports no error.
        if data.is_empty() {
            return Ok(0);
        }

        let mut ends = self.change_lock.read();

        let minimum = if data.len() <= ATOMIC_WRITE_SIZE {
            data.len()
        } else {
            1
        };

        let mut written = 0;
        let mut remaining = data;

        while !remaining.is_empty() {
            // Wait for enough space, as long as readers remain.
            while !ends.active || (self.bytes_writable() < minimum && ends.reader_count > 0) {
                if non_blocking {
                    if written > 0 {
                        return Ok(written);
                    }
                    return Err(Errno::EWOULDBLOCK);
                }

                // Register first so a concurrent reader freeing space sees
                // us and bumps the activity generation.
                self.write_requests.lock().push(WriteRequest { minimum });
                let seen = self.activity_generation();
                // The situation might have changed, recheck before waiting.
                if ends.active && (self.bytes_writable() >= minimum || ends.reader_count == 0) {
                    self.remove_write_request(minimum);
                    break;
                }
                drop(ends);
                self.wait_for_activity(seen);
                self.remove_write_request(minimum);
                ends = self.change_lock.read();
            }

            // Write only as long as there are readers left.
            if ends.active && ends.reader_count == 0 {
                if written == 0 {
                    return Err(Errno::EPIPE);
                }
                return Ok(written);
            }

            let (chunk, was_empty) = self.ring.lock().write(remaining, minimum);
            if chunk == 0 {
                continue;
            }
            remaining = &remaining[chunk..];
            written += chunk;

            self.notify_bytes_written(&ends, was_empty);
        }

        Ok(written)
    }

    /// Serialized read: the request must already sit in the queue.
    fn read_from_buffer(
        &self,
        buf: &mut [u8],
        non_blocking: bool,
        request: &Arc<ReadRequest>,
    ) -> Result<usize> {
        let mut ends = self.change_lock.read();

        // Wait until our request is first in the queue.
        loop {
            let is_head = self
                .read_requests
                .lock()
                .front()
                .is_some_and(|head| Arc::ptr_eq(head, request));
            if is_head {
                break;
            }
            if non_blocking {
                return Err(Errno::EWOULDBLOCK);
            }
            request.set_notified(false);
            let still_head = self
                .read_requests
                .lock()
                .front()
                .is_some_and(|head| Arc::ptr_eq(head, request));
            if still_head {
                request.set_notified(true);
                break;
            }
            drop(ends);
            request.wait()?;
            ends = self.change_lock.read();
        }

        loop {
            // Wait until data arrives.
            while self.bytes_readable() == 0 {
                if non_blocking {
                    return Err(Errno::EWOULDBLOCK);
                }
                if ends.active && ends.writer_count == 0 {
                    // All writers left with an empty buffer: end of file.
                    return Ok(0);
                }

                request.set_notified(false);
                if self.bytes_readable() != 0 {
                    request.set_notified(true);
                    break;
                }
                drop(ends);
                request.wait()?;
                ends = self.change_lock.read();
            }

            let (read, was_full) = self.ring.lock().read(buf);
            if read == 0 {
                continue;
            }

            self.notify_bytes_read(&ends, was_full, read);
            return Ok(read);
        }
    }

    /// Space opened up: wake writers whose minimal write became satisfiable
    /// and, when the buffer stopped being full, the write select pool.
    fn notify_bytes_read(&self, ends: &Ends, was_full: bool, bytes: usize) {
        let writable = self.bytes_writable();
        if bytes == 0 {
            return;
        }
        if was_full {
            ends.write_pool.notify(SelectEvents::WRITE);
        }

        let requests = self.write_requests.lock();
        let wake = requests.iter().any(|request| {
            request.minimum > 0
                && request.minimum <= writable
                && request.minimum > writable - bytes.min(writable)
        });
        drop(requests);
        if wake {
            self.notify_activity();
        }
    }

    /// The head reader is done; pass the turn on when data remains.
    fn notify_read_done(&self) {
        if self.bytes_readable() > 0 {
            if let Some(head) = self.read_requests.lock().front() {
                head.notify(None);
            }
        }
    }

    /// Data arrived: wake the head reader and, when the buffer had been
    /// empty, the read select pool.
    fn notify_bytes_written(&self, ends: &Ends, was_empty: bool) {
        if was_empty && self.bytes_readable() > 0 {
            ends.read_pool.notify(SelectEvents::READ);
            if let Some(head) = self.read_requests.lock().front() {
                head.notify(None);
            }
        }
    }

    fn remove_write_request(&self, minimum: usize) {
        let mut requests = self.write_requests.lock();
        if let Some(position) = requests
            .iter()
            .position(|request| request.minimum == minimum)
        {
            requests.remove(position);
        }
    }

    fn add_read_request(&self, request: &Arc<ReadRequest>) {
        self.read_requests.lock().push_back(request.clone());
    }

    fn remove_read_request(&self, request: &Arc<ReadRequest>) {
        let mut requests = self.read_requests.lock();
        if let Some(position) = requests
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, request))
        {
            requests.remove(position);
        }
    }

    /// Registers select interest, signalling right away when the condition
    /// already holds.
    fn select(
        &self,
        open_mode: OpenFlags,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let mut ends = self.change_lock.write();

        let read_side =
            (event == SelectEvents::READ && open_mode.readable()) || !open_mode.writable();

        if read_side {
            ends.read_pool.add(handle, event);
            if (event == SelectEvents::READ && self.bytes_readable() > 0)
                || (event == SelectEvents::DISCONNECTED && ends.writer_count == 0)
            {
                handle.notify(event);
            }
        } else {
            ends.write_pool.add(handle, event);
            if (event == SelectEvents::WRITE && self.bytes_writable() > 0)
                || (event == SelectEvents::ERROR && ends.reader_count == 0)
            {
                handle.notify(event);
            }
        }
        Ok(())
    }

    fn deselect(
        &self,
        open_mode: OpenFlags,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let mut ends = self.change_lock.write();
        let read_side = (event == SelectEvents::READ && open_mode.readable())
            || !open_mode.writable();
        if read_side {
            ends.read_pool.remove(handle, event);
        } else {
            ends.write_pool.remove(handle, event);
        }
        Ok(())
    }

    fn reader_count(&self) -> i32 {
        self.change_lock.read().reader_count
    }

    fn writer_count(&self) -> i32 {
        self.change_lock.read().writer_count
    }

    #[cfg(test)]
    fn is_active(&self) -> bool {
        self.change_lock.read().active
    }

    #[cfg(test)]
    fn buffer_exists(&self) -> bool {
        self.ring.lock().exists()
    }
}

/// Per-open FIFO state. The open mode is mutable so `F_SETFL` can toggle
/// non-blocking behavior on a live cookie.
struct FifoCookie {
    id: u64,
    open_mode: Mutex<OpenFlags>,
}

impl FifoCookie {
    fn open_mode(&self) -> OpenFlags {
        *self.open_mode.lock()
    }
}

static NEXT_COOKIE_ID: AtomicU64 = AtomicU64::new(1);

/// Operation vector wrapped around a FIFO node, carrying the pipe engine
/// and delegating everything node-identity related to the driver's own
/// vector.
pub(crate) struct FifoNodeOps {
    inode: Inode,
    super_ops: Arc<dyn NodeOps>,
}

/// Wraps a driver's operation vector with the pipe engine.
pub(crate) fn wrap_fifo_ops(super_ops: Arc<dyn NodeOps>) -> Arc<dyn NodeOps> {
    Arc::new(FifoNodeOps {
        inode: Inode::new(),
        super_ops,
    })
}

fn fifo_cookie(cookie: &Cookie) -> Result<&FifoCookie> {
    cookie.downcast_ref::<FifoCookie>().ok_or(Errno::EBADF)
}

impl NodeOps for FifoNodeOps {
    fn put(&self, node: &Vnode) {
        self.super_ops.put(node);
    }

    fn remove(&self, node: &Vnode) {
        self.super_ops.remove(node);
    }

    fn get_super_ops(&self) -> Option<Arc<dyn NodeOps>> {
        Some(self.super_ops.clone())
    }

    fn open(&self, _node: &Vnode, open_mode: OpenFlags) -> Result<BoxedCookie> {
        self.inode.open(open_mode)?;
        Ok(Box::new(FifoCookie {
            id: NEXT_COOKIE_ID.fetch_add(1, Ordering::Relaxed),
            open_mode: Mutex::new(open_mode),
        }))
    }

    fn close(&self, _node: &Vnode, cookie: &Cookie) -> Result<()> {
        let cookie = fifo_cookie(cookie)?;
        self.inode.close(cookie.id as usize, cookie.open_mode());
        Ok(())
    }

    fn read(&self, _node: &Vnode, cookie: &Cookie, _pos: i64, buf: &mut [u8]) -> Result<usize> {
        let cookie = fifo_cookie(cookie)?;
        let open_mode = cookie.open_mode();
        if !open_mode.readable() {
            return Err(Errno::EBADF);
        }

        let request = ReadRequest::new(cookie.id as usize);
        self.inode.add_read_request(&request);
        let result = self
            .inode
            .read_from_buffer(buf, open_mode.non_blocking(), &request);
        self.inode.remove_read_request(&request);
        self.inode.notify_read_done();
        result
    }

    fn write(&self, _node: &Vnode, cookie: &Cookie, _pos: i64, buf: &[u8]) -> Result<usize> {
        let cookie = fifo_cookie(cookie)?;
        let open_mode = cookie.open_mode();
        if !open_mode.writable() {
            return Err(Errno::EBADF);
        }
        self.inode.write(buf, open_mode.non_blocking())
    }

    fn set_flags(&self, _node: &Vnode, cookie: &Cookie, flags: OpenFlags) -> Result<()> {
        let cookie = fifo_cookie(cookie)?;
        *cookie.open_mode.lock() = flags;
        Ok(())
    }

    fn read_stat(&self, node: &Vnode) -> Result<NodeStat> {
        let mut stat = self.super_ops.read_stat(node)?;
        stat.size = self.inode.bytes_readable() as i64;
        Ok(stat)
    }

    fn write_stat(&self, node: &Vnode, stat: &NodeStat, fields: StatFields) -> Result<()> {
        if fields.contains(StatFields::SIZE) {
            // The buffered byte count is not a settable property.
            return Err(Errno::EINVAL);
        }
        self.super_ops.write_stat(node, stat, fields)
    }

    fn access(&self, node: &Vnode, mode: i32) -> Result<()> {
        self.super_ops.access(node, mode)
    }

    fn fsync(&self, _node: &Vnode, _data_only: bool) -> Result<()> {
        Ok(())
    }

    fn select(
        &self,
        _node: &Vnode,
        cookie: &Cookie,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let cookie = fifo_cookie(cookie)?;
        self.inode.select(cookie.open_mode(), event, handle)
    }

    fn deselect(
        &self,
        _node: &Vnode,
        cookie: &Cookie,
        event: SelectEvents,
        handle: &Arc<SelectHandle>,
    ) -> Result<()> {
        let cookie = fifo_cookie(cookie)?;
        self.inode.deselect(cookie.open_mode(), event, handle)
    }
}
