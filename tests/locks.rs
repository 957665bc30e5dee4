//! Advisory locking through `fcntl` and `flock`.

mod common;

use std::thread;
use std::time::Duration;

use common::fresh_vfs;
use vfscore::{Errno, FcntlArg, Flock, TeamId};

fn write_lock(start: i64, len: i64) -> Flock {
    Flock {
        kind: libc::F_WRLCK,
        whence: libc::SEEK_SET,
        start,
        len,
        team: None,
    }
}

fn unlock(start: i64, len: i64) -> Flock {
    Flock {
        kind: libc::F_UNLCK,
        whence: libc::SEEK_SET,
        start,
        len,
        team: None,
    }
}

#[test]
fn posix_lock_conflict_and_wait() {
    let (vfs, ctx1) = fresh_vfs();
    let ctx2 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(4711));

    let fd1 = vfs
        .open(&ctx1, "/locked", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let fd2 = vfs.open(&ctx2, "/locked", libc::O_RDWR, 0).unwrap();

    // P1 takes [0, 100); P2's overlapping attempt would block.
    let mut lock = write_lock(0, 100);
    assert_eq!(
        vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut lock))
            .unwrap(),
        0
    );
    let mut contended = write_lock(50, 150);
    assert_eq!(
        vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut contended))
            .unwrap_err(),
        Errno::EWOULDBLOCK
    );

    // F_GETLK reports the conflicting region and owner.
    let mut probe = write_lock(50, 150);
    vfs.fcntl(&ctx2, fd2, libc::F_GETLK, FcntlArg::Lock(&mut probe))
        .unwrap();
    assert_eq!(probe.kind, libc::F_WRLCK);
    assert_eq!(probe.start, 0);
    assert_eq!(probe.len, 100);
    assert_eq!(probe.team, Some(ctx1.team()));

    // A waiting F_SETLKW completes once P1 unlocks.
    let waiter = {
        let vfs = vfs.clone();
        let ctx2 = ctx2.clone();
        thread::spawn(move || {
            let mut lock = write_lock(50, 150);
            vfs.fcntl(&ctx2, fd2, libc::F_SETLKW, FcntlArg::Lock(&mut lock))
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    let mut release = unlock(0, 100);
    vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut release))
        .unwrap();
    assert_eq!(waiter.join().unwrap().unwrap(), 0);

    vfs.close(&ctx2, fd2).unwrap();
    vfs.close(&ctx1, fd1).unwrap();
    vfs.exit_io_context(&ctx2);
}

#[test]
fn shared_locks_coexist_but_block_writers() {
    let (vfs, ctx1) = fresh_vfs();
    let ctx2 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(100));
    let ctx3 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(101));

    let fd1 = vfs
        .open(&ctx1, "/shared", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let fd2 = vfs.open(&ctx2, "/shared", libc::O_RDWR, 0).unwrap();
    let fd3 = vfs.open(&ctx3, "/shared", libc::O_RDWR, 0).unwrap();

    let mut shared = Flock {
        kind: libc::F_RDLCK,
        whence: libc::SEEK_SET,
        start: 0,
        len: 0,
        team: None,
    };
    vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut shared))
        .unwrap();
    let mut shared2 = shared;
    vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut shared2))
        .unwrap();

    let mut exclusive = write_lock(10, 10);
    assert_eq!(
        vfs.fcntl(&ctx3, fd3, libc::F_SETLK, FcntlArg::Lock(&mut exclusive))
            .unwrap_err(),
        Errno::EWOULDBLOCK
    );

    vfs.close(&ctx1, fd1).unwrap();
    vfs.close(&ctx2, fd2).unwrap();
    vfs.close(&ctx3, fd3).unwrap();
    vfs.exit_io_context(&ctx2);
    vfs.exit_io_context(&ctx3);
}

#[test]
fn unlocking_a_subrange_splits_the_lock() {
    let (vfs, ctx1) = fresh_vfs();
    let ctx2 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(7));

    let fd1 = vfs
        .open(&ctx1, "/split", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let fd2 = vfs.open(&ctx2, "/split", libc::O_RDWR, 0).unwrap();

    let mut whole = write_lock(0, 100);
    vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut whole))
        .unwrap();
    let mut hole = unlock(40, 20);
    vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut hole))
        .unwrap();

    // The hole is free, the flanks remain taken.
    let mut in_hole = write_lock(45, 10);
    vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut in_hole))
        .unwrap();
    let mut left = write_lock(0, 10);
    assert_eq!(
        vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut left))
            .unwrap_err(),
        Errno::EWOULDBLOCK
    );
    let mut right = write_lock(90, 10);
    assert_eq!(
        vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut right))
            .unwrap_err(),
        Errno::EWOULDBLOCK
    );

    vfs.close(&ctx1, fd1).unwrap();
    vfs.close(&ctx2, fd2).unwrap();
    vfs.exit_io_context(&ctx2);
}

#[test]
fn closing_any_descriptor_drops_posix_locks() {
    let (vfs, ctx1) = fresh_vfs();
    let ctx2 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(8));

    let fd1 = vfs
        .open(&ctx1, "/dropme", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let mut lock = write_lock(0, 0);
    vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut lock))
        .unwrap();
    vfs.close(&ctx1, fd1).unwrap();

    let fd2 = vfs.open(&ctx2, "/dropme", libc::O_RDWR, 0).unwrap();
    let mut lock2 = write_lock(0, 0);
    vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut lock2))
        .unwrap();
    vfs.close(&ctx2, fd2).unwrap();
    vfs.exit_io_context(&ctx2);
}

#[test]
fn flock_whole_file_semantics() {
    let (vfs, ctx1) = fresh_vfs();
    let ctx2 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(9));

    let fd1 = vfs
        .open(&ctx1, "/flocked", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let fd2 = vfs.open(&ctx2, "/flocked", libc::O_RDWR, 0).unwrap();

    vfs.flock(&ctx1, fd1, libc::LOCK_EX).unwrap();
    assert_eq!(
        vfs.flock(&ctx2, fd2, libc::LOCK_EX | libc::LOCK_NB)
            .unwrap_err(),
        Errno::EACCES
    );

    // Converting the holder's lock to shared lets a second shared in.
    vfs.flock(&ctx1, fd1, libc::LOCK_SH).unwrap();
    vfs.flock(&ctx2, fd2, libc::LOCK_SH | libc::LOCK_NB).unwrap();

    vfs.flock(&ctx1, fd1, libc::LOCK_UN).unwrap();
    vfs.flock(&ctx2, fd2, libc::LOCK_UN).unwrap();

    vfs.close(&ctx1, fd1).unwrap();
    vfs.close(&ctx2, fd2).unwrap();
    vfs.exit_io_context(&ctx2);
}

#[test]
fn same_context_never_conflicts_with_itself() {
    let (vfs, ctx) = fresh_vfs();
    let fd = vfs
        .open(&ctx, "/self", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();

    let mut first = write_lock(0, 100);
    vfs.fcntl(&ctx, fd, libc::F_SETLK, FcntlArg::Lock(&mut first))
        .unwrap();
    // Overlapping lock from the same owner is no collision.
    let mut second = write_lock(50, 100);
    vfs.fcntl(&ctx, fd, libc::F_SETLK, FcntlArg::Lock(&mut second))
        .unwrap();

    vfs.close(&ctx, fd).unwrap();
}

#[test]
fn seek_cur_lock_ranges_use_the_descriptor_position() {
    let (vfs, ctx1) = fresh_vfs();
    let ctx2 = vfs.new_io_context_for_team(Some(&ctx1), TeamId(10));

    let fd1 = vfs
        .open(&ctx1, "/cursor", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    vfs.write(&ctx1, fd1, &[0u8; 100]).unwrap();
    // Position is now 100; lock [100, 110) via SEEK_CUR.
    let mut lock = Flock {
        kind: libc::F_WRLCK,
        whence: libc::SEEK_CUR,
        start: 0,
        len: 10,
        team: None,
    };
    vfs.fcntl(&ctx1, fd1, libc::F_SETLK, FcntlArg::Lock(&mut lock))
        .unwrap();

    let fd2 = vfs.open(&ctx2, "/cursor", libc::O_RDWR, 0).unwrap();
    let mut before = write_lock(0, 100);
    vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut before))
        .unwrap();
    let mut overlapping = write_lock(105, 1);
    assert_eq!(
        vfs.fcntl(&ctx2, fd2, libc::F_SETLK, FcntlArg::Lock(&mut overlapping))
            .unwrap_err(),
        Errno::EWOULDBLOCK
    );

    vfs.close(&ctx1, fd1).unwrap();
    vfs.close(&ctx2, fd2).unwrap();
    vfs.exit_io_context(&ctx2);
}
