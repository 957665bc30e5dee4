//! Pipe and FIFO semantics through the public surface.

mod common;

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use common::fresh_vfs;
use vfscore::{
    Errno, FIFO_ATOMIC_WRITE_SIZE, FcntlArg, SelectEvents, SelectHandle,
};

#[test]
fn pipe_transfers_bytes_in_order() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    assert_eq!(vfs.write(&ctx, write_fd, b"hello pipe").unwrap(), 10);
    let mut buf = [0u8; 10];
    assert_eq!(vfs.read(&ctx, read_fd, &mut buf).unwrap(), 10);
    assert_eq!(&buf, b"hello pipe");

    vfs.close(&ctx, write_fd).unwrap();
    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn read_after_last_writer_returns_zero() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    vfs.write(&ctx, write_fd, b"tail").unwrap();
    vfs.close(&ctx, write_fd).unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(vfs.read(&ctx, read_fd, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"tail");
    // Buffer drained and no writers left: end of file.
    assert_eq!(vfs.read(&ctx, read_fd, &mut buf).unwrap(), 0);

    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn write_without_readers_is_a_broken_pipe() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();
    vfs.close(&ctx, read_fd).unwrap();

    assert_eq!(vfs.write(&ctx, write_fd, b"x").unwrap_err(), Errno::EPIPE);
    vfs.close(&ctx, write_fd).unwrap();
}

#[test]
fn blocked_reader_is_woken_by_a_writer() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    let reader = {
        let vfs = vfs.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            let n = vfs.read(&ctx, read_fd, &mut buf).unwrap();
            buf[..n].to_vec()
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!reader.is_finished());
    vfs.write(&ctx, write_fd, b"wake").unwrap();
    assert_eq!(reader.join().unwrap(), b"wake");

    vfs.close(&ctx, write_fd).unwrap();
    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn nonblocking_read_would_block() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    let flags = vfs
        .fcntl(&ctx, read_fd, libc::F_GETFL, FcntlArg::None)
        .unwrap();
    vfs.fcntl(
        &ctx,
        read_fd,
        libc::F_SETFL,
        FcntlArg::Value(flags | libc::O_NONBLOCK),
    )
    .unwrap();

    assert_eq!(
        vfs.read(&ctx, read_fd, &mut [0u8; 4]).unwrap_err(),
        Errno::EWOULDBLOCK
    );

    vfs.close(&ctx, write_fd).unwrap();
    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn small_writes_never_interleave() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    // Two writers, each repeatedly writing one atomic-size block of a
    // distinct byte. No read may ever observe a mixed block.
    const BLOCKS_PER_WRITER: usize = 64;
    let block = FIFO_ATOMIC_WRITE_SIZE;

    let mut writers = Vec::new();
    for fill in [b'A', b'X'] {
        let vfs = vfs.clone();
        let ctx = ctx.clone();
        writers.push(thread::spawn(move || {
            let data = vec![fill; block];
            for _ in 0..BLOCKS_PER_WRITER {
                assert_eq!(vfs.write(&ctx, write_fd, &data).unwrap(), block);
            }
        }));
    }

    let mut seen = HashSet::new();
    let mut collected = Vec::new();
    while collected.len() < 2 * BLOCKS_PER_WRITER * block {
        let mut buf = vec![0u8; block * 4];
        let n = vfs.read(&ctx, read_fd, &mut buf).unwrap();
        assert!(n > 0);
        collected.extend_from_slice(&buf[..n]);
    }

    for chunk in collected.chunks(block) {
        let first = chunk[0];
        assert!(chunk.iter().all(|byte| *byte == first), "interleaved block");
        seen.insert(first);
    }
    assert_eq!(seen, HashSet::from([b'A', b'X']));

    for writer in writers {
        writer.join().unwrap();
    }
    vfs.close(&ctx, write_fd).unwrap();
    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn short_concurrent_writes_keep_their_shape() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    let mut writers = Vec::new();
    for payload in [b"ABC", b"XYZ"] {
        let vfs = vfs.clone();
        let ctx = ctx.clone();
        writers.push(thread::spawn(move || {
            vfs.write(&ctx, write_fd, payload).unwrap();
        }));
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let mut buf = [0u8; 6];
    let mut read = 0;
    while read < 6 {
        read += vfs.read(&ctx, read_fd, &mut buf[read..]).unwrap();
    }
    assert!(
        &buf == b"ABCXYZ" || &buf == b"XYZABC",
        "unexpected interleaving: {:?}",
        std::str::from_utf8(&buf)
    );

    vfs.close(&ctx, write_fd).unwrap();
    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn select_reports_readability_and_disconnect() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();

    let handle = SelectHandle::new();
    vfs.select_fd(&ctx, read_fd, SelectEvents::READ, &handle)
        .unwrap();
    assert!(handle.wait_timeout(Duration::from_millis(20)).is_empty());

    vfs.write(&ctx, write_fd, b"ready").unwrap();
    assert!(handle.wait().contains(SelectEvents::READ));
    vfs.deselect_fd(&ctx, read_fd, SelectEvents::READ, &handle)
        .unwrap();

    let disconnect = SelectHandle::new();
    vfs.select_fd(&ctx, read_fd, SelectEvents::DISCONNECTED, &disconnect)
        .unwrap();
    let mut buf = [0u8; 5];
    vfs.read(&ctx, read_fd, &mut buf).unwrap();
    vfs.close(&ctx, write_fd).unwrap();
    assert!(disconnect.wait().contains(SelectEvents::DISCONNECTED));

    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn named_fifo_connects_reader_and_writer() {
    let (vfs, ctx) = fresh_vfs();
    vfs.mkfifo(&ctx, None, "/queue", 0o644).unwrap();

    // A writer without readers is refused in non-blocking mode.
    assert_eq!(
        vfs.open(&ctx, "/queue", libc::O_WRONLY | libc::O_NONBLOCK, 0)
            .unwrap_err(),
        Errno::ENXIO
    );

    let opener = {
        let vfs = vfs.clone();
        let ctx = ctx.clone();
        thread::spawn(move || {
            // Blocks until the reader shows up, then transfers.
            let write_fd = vfs.open(&ctx, "/queue", libc::O_WRONLY, 0).unwrap();
            vfs.write(&ctx, write_fd, b"through the fifo").unwrap();
            vfs.close(&ctx, write_fd).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(30));
    let read_fd = vfs
        .open(&ctx, "/queue", libc::O_RDONLY | libc::O_NONBLOCK, 0)
        .unwrap();
    opener.join().unwrap();

    let mut buf = [0u8; 16];
    let mut read = 0;
    while read < 16 {
        match vfs.read(&ctx, read_fd, &mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(Errno::EWOULDBLOCK) => thread::sleep(Duration::from_millis(5)),
            Err(error) => panic!("read failed: {error}"),
        }
    }
    assert_eq!(&buf[..read], b"through the fifo");

    vfs.close(&ctx, read_fd).unwrap();
}

#[test]
fn fifo_stat_size_is_rejected() {
    let (vfs, ctx) = fresh_vfs();
    vfs.mkfifo(&ctx, None, "/fifo", 0o644).unwrap();

    let mut stat = vfs.read_stat_at(&ctx, None, "/fifo", true).unwrap();
    stat.size = 42;
    assert_eq!(
        vfs.write_stat_at(&ctx, None, "/fifo", true, &stat, vfscore::StatFields::SIZE)
            .unwrap_err(),
        Errno::EINVAL
    );
}

#[test]
fn pipe_descriptors_are_not_seekable() {
    let (vfs, ctx) = fresh_vfs();
    let (read_fd, write_fd) = vfs.pipe(&ctx).unwrap();
    assert_eq!(
        vfs.seek(&ctx, read_fd, 0, vfscore::Whence::Set).unwrap_err(),
        Errno::ESPIPE
    );
    vfs.close(&ctx, write_fd).unwrap();
    vfs.close(&ctx, read_fd).unwrap();
}
