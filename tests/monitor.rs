//! Delivery of node events to registered listeners.

mod common;

use std::sync::Arc;

use common::fresh_vfs;
use parking_lot::Mutex;
use vfscore::{
    AttrCause, DeviceId, EventListener, NodeEvent, NodeId, StatFields, WatchFlags,
};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<NodeEvent>>,
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    fn take(&self) -> Vec<NodeEvent> {
        std::mem::take(&mut self.events.lock())
    }
}

impl EventListener for Recorder {
    fn event_occurred(&self, event: &NodeEvent) {
        self.events.lock().push(event.clone());
    }
}

#[test]
fn directory_watch_sees_entry_lifecycle() {
    let (vfs, ctx) = fresh_vfs();
    let root = vfs.read_stat_at(&ctx, None, "/", true).unwrap();

    let recorder = Recorder::new();
    vfs.monitors()
        .add_listener(
            &ctx,
            root.device,
            Some(root.node),
            WatchFlags::ENTRY_CREATED | WatchFlags::ENTRY_REMOVED | WatchFlags::ENTRY_MOVED,
            None,
            recorder.clone(),
        )
        .unwrap();

    let fd = vfs
        .open(&ctx, "/watched", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    vfs.close(&ctx, fd).unwrap();
    vfs.create_dir(&ctx, None, "/elsewhere", 0o755).unwrap();
    vfs.rename(&ctx, None, "/watched", None, "/elsewhere/watched")
        .unwrap();
    vfs.unlink(&ctx, None, "/elsewhere/watched").unwrap();

    let events = recorder.take();
    assert_eq!(events.len(), 3, "events: {events:?}");
    assert!(matches!(
        &events[0],
        NodeEvent::EntryCreated { name, .. } if name == "watched"
    ));
    assert!(matches!(
        &events[1],
        NodeEvent::EntryCreated { name, .. } if name == "elsewhere"
    ));
    // The move is seen because the watched root is the source directory;
    // the unlink happens in the unwatched target directory.
    assert!(matches!(
        &events[2],
        NodeEvent::EntryMoved { from_name, to_name, .. }
            if from_name == "watched" && to_name == "watched"
    ));

    let listener: Arc<dyn EventListener> = recorder;
    vfs.monitors()
        .remove_listener(root.device, Some(root.node), None, Some(&listener))
        .unwrap();
}

#[test]
fn stat_watch_reports_field_mask() {
    let (vfs, ctx) = fresh_vfs();
    let fd = vfs
        .open(&ctx, "/statted", libc::O_CREAT | libc::O_WRONLY, 0o644)
        .unwrap();
    vfs.close(&ctx, fd).unwrap();
    let stat = vfs.read_stat_at(&ctx, None, "/statted", true).unwrap();

    let recorder = Recorder::new();
    vfs.monitors()
        .add_listener(
            &ctx,
            stat.device,
            Some(stat.node),
            WatchFlags::STAT_CHANGED,
            None,
            recorder.clone(),
        )
        .unwrap();

    let mut changed = stat.clone();
    changed.size = 0;
    changed.mode = 0o600;
    vfs.write_stat_at(
        &ctx,
        None,
        "/statted",
        true,
        &changed,
        StatFields::MODE,
    )
    .unwrap();

    let events = recorder.take();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        NodeEvent::StatChanged { fields, .. } if *fields == StatFields::MODE
    ));
}

#[test]
fn volume_watch_sees_every_directory() {
    let (vfs, ctx) = fresh_vfs();
    let root = vfs.read_stat_at(&ctx, None, "/", true).unwrap();

    let recorder = Recorder::new();
    vfs.monitors()
        .add_listener(
            &ctx,
            root.device,
            None,
            WatchFlags::ENTRY_CREATED,
            None,
            recorder.clone(),
        )
        .unwrap();

    vfs.create_dir(&ctx, None, "/a", 0o755).unwrap();
    vfs.create_dir(&ctx, None, "/a/b", 0o755).unwrap();

    assert_eq!(recorder.take().len(), 2);
}

#[test]
fn mount_events_reach_volume_listeners() {
    let (vfs, ctx) = fresh_vfs();
    let root = vfs.read_stat_at(&ctx, None, "/", true).unwrap();

    let recorder = Recorder::new();
    vfs.monitors()
        .add_listener(
            &ctx,
            root.device,
            None,
            WatchFlags::MOUNT,
            None,
            recorder.clone(),
        )
        .unwrap();

    vfs.register_file_system(common::ScratchFs::new("subfs"))
        .unwrap();
    vfs.create_dir(&ctx, None, "/sub", 0o755).unwrap();
    let device = vfs
        .mount(
            &ctx,
            "/sub",
            None,
            "subfs",
            vfscore::MountFlags::empty(),
            None,
        )
        .unwrap();
    vfs.unmount_device(device, vfscore::UnmountFlags::empty())
        .unwrap();

    let events = recorder.take();
    assert_eq!(events.len(), 2, "events: {events:?}");
    assert!(matches!(
        &events[0],
        NodeEvent::Mounted { device: mounted, covered_directory: Some(_), .. }
            if *mounted == device
    ));
    assert!(matches!(
        &events[1],
        NodeEvent::Unmounted { device: unmounted } if *unmounted == device
    ));
}

#[test]
fn attribute_watch_reports_causes() {
    let (vfs, ctx) = fresh_vfs();
    let fd = vfs
        .open(&ctx, "/attrs", libc::O_CREAT | libc::O_RDWR, 0o644)
        .unwrap();
    let stat = vfs.read_fd_stat(&ctx, fd).unwrap();

    let recorder = Recorder::new();
    vfs.monitors()
        .add_listener(
            &ctx,
            stat.device,
            Some(stat.node),
            WatchFlags::ATTR_CHANGED,
            None,
            recorder.clone(),
        )
        .unwrap();

    let attr = vfs
        .create_attr(&ctx, fd, "user.tag", 0, libc::O_WRONLY)
        .unwrap();
    vfs.write(&ctx, attr, b"v").unwrap();
    vfs.close(&ctx, attr).unwrap();
    vfs.remove_attr(&ctx, fd, "user.tag").unwrap();

    let events = recorder.take();
    let causes: Vec<AttrCause> = events
        .iter()
        .map(|event| match event {
            NodeEvent::AttrChanged { cause, .. } => *cause,
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        causes,
        vec![AttrCause::Created, AttrCause::Changed, AttrCause::Removed]
    );

    vfs.close(&ctx, fd).unwrap();
}

#[test]
fn query_updates_skip_the_tables() {
    let recorder = Recorder::new();
    vfscore::notify_query_entry_created(
        recorder.as_ref(),
        DeviceId(3),
        NodeId(5),
        "fresh",
        NodeId(9),
    );
    vfscore::notify_query_entry_removed(
        recorder.as_ref(),
        DeviceId(3),
        NodeId(5),
        "fresh",
        NodeId(9),
    );

    let events = recorder.take();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], NodeEvent::EntryCreated { .. }));
    assert!(matches!(&events[1], NodeEvent::EntryRemoved { .. }));
}
