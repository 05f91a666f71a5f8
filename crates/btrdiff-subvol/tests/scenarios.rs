//! End-to-end reconstruction from encoded send-streams.

use std::sync::Arc;

use btrdiff_stream::testing::StreamBuilder;
use btrdiff_stream::{Command, DeviceNumber, StreamDecoder, StreamError};
use btrdiff_subvol::{
    replay_commands, replay_stream, replay_streams, ReconstructionError, ReplayOptions,
    SubvolumeSet,
};
use uuid::Uuid;

fn p(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

fn subvol(name: &str, uuid: u128) -> Command {
    Command::Subvol {
        path: p(name),
        uuid: Uuid::from_u128(uuid),
        ctransid: 10,
    }
}

fn snapshot(name: &str, uuid: u128, parent: u128) -> Command {
    Command::Snapshot {
        path: p(name),
        uuid: Uuid::from_u128(uuid),
        ctransid: 11,
        parent_uuid: Uuid::from_u128(parent),
        parent_ctransid: 10,
    }
}

fn stream(commands: &[Command]) -> Vec<u8> {
    StreamBuilder::new(1).commands(commands).into_bytes()
}

fn replay_bytes(set: &mut SubvolumeSet, bytes: &[u8]) -> Uuid {
    let decoder = StreamDecoder::new(bytes).unwrap();
    replay_stream(set, decoder, &ReplayOptions::default()).unwrap()
}

fn digest(set: &SubvolumeSet, uuid: Uuid, path: &str) -> String {
    set.get(uuid)
        .unwrap()
        .inode_at(path.as_bytes())
        .unwrap()
        .to_string()
}

#[test]
fn test_truncate_then_write_versus_write_then_truncate() {
    let mut set = SubvolumeSet::new();
    let data: Arc<[u8]> = Arc::from(vec![b'z'; 15]);
    let uuid = replay_bytes(
        &mut set,
        &stream(&[
            subvol("vol", 1),
            Command::Mkdir { path: p("a") },
            Command::Mkfile { path: p("a/b") },
            Command::Mkfile { path: p("a/c") },
            Command::Truncate {
                path: p("a/b"),
                size: 17,
            },
            Command::Write {
                path: p("a/b"),
                offset: 10,
                data: Arc::clone(&data),
            },
            Command::Write {
                path: p("a/c"),
                offset: 10,
                data,
            },
            Command::Truncate {
                path: p("a/c"),
                size: 17,
            },
            Command::End,
        ]),
    );
    assert_eq!(digest(&set, uuid, "a/b"), "(File h10d15)");
    assert_eq!(digest(&set, uuid, "a/c"), "(File h10d7)");
    assert_eq!(digest(&set, uuid, "a"), "(Dir)");
}

#[test]
fn test_mknod_variants() {
    let mut set = SubvolumeSet::new();
    let uuid = replay_bytes(
        &mut set,
        &stream(&[
            subvol("dev", 1),
            Command::Mknod {
                path: p("chr"),
                mode: 0o20711,
                dev: DeviceNumber(0x123),
            },
            Command::Mknod {
                path: p("blk"),
                mode: 0o60544,
                dev: DeviceNumber(0x345),
            },
            Command::End,
        ]),
    );
    assert_eq!(digest(&set, uuid, "chr"), "(Char m711 123)");
    assert_eq!(digest(&set, uuid, "blk"), "(Block m544 345)");

    let err = replay_commands(
        &set,
        [
            subvol("bad", 2),
            Command::Mknod {
                path: p("fifo"),
                mode: 0o10644,
                dev: DeviceNumber(0),
            },
            Command::End,
        ]
        .map(Ok::<_, StreamError>),
    )
    .unwrap_err();
    assert_eq!(err.index, 1);
    assert!(matches!(
        err.reconstruction(),
        Some(ReconstructionError::Inode { .. })
    ));
}

#[test]
fn test_hardlink_chmod_is_visible_through_every_name() {
    let mut set = SubvolumeSet::new();
    let uuid = replay_bytes(
        &mut set,
        &stream(&[
            subvol("links", 1),
            Command::Mkfile { path: p("x") },
            Command::Link {
                path: p("x"),
                dest: p("y"),
            },
            Command::Chmod {
                path: p("y"),
                mode: 0o644,
            },
            Command::End,
        ]),
    );
    assert_eq!(digest(&set, uuid, "x"), "(File m644)");
    assert_eq!(digest(&set, uuid, "y"), "(File m644)");
    let forest = set.get(uuid).unwrap().forest();
    assert_eq!(forest.id_of(b"x"), forest.id_of(b"y"));
}

#[test]
fn test_snapshot_unlink_leaves_parent_untouched() {
    let mut bytes = stream(&[
        subvol("parent", 1),
        Command::Mkfile { path: p("x") },
        Command::Mkfile { path: p("y") },
        Command::End,
    ]);
    bytes.extend(stream(&[
        snapshot("child", 2, 1),
        Command::Unlink { path: p("x") },
        Command::Chown {
            path: p("y"),
            uid: 5,
            gid: 6,
        },
        Command::End,
    ]));

    let mut set = SubvolumeSet::new();
    let uuids = replay_streams(&mut set, bytes.as_slice(), &ReplayOptions::default()).unwrap();
    let (parent, child) = (uuids[0], uuids[1]);

    let parent_listing: Vec<_> = set.get(parent).unwrap().listing().into_iter().collect();
    assert_eq!(
        parent_listing,
        [
            (p("."), "(Dir)".to_string()),
            (p("x"), "(File)".to_string()),
            (p("y"), "(File)".to_string()),
        ]
    );
    assert!(set.get(child).unwrap().inode_at(b"x").is_none());
    assert_eq!(digest(&set, child, "y"), "(File o5:6)");
    assert_eq!(set.display_name(child).unwrap(), "child");
}

#[test]
fn test_independent_snapshots_replay_in_parallel() {
    let mut set = SubvolumeSet::new();
    replay_bytes(
        &mut set,
        &stream(&[
            subvol("base", 1),
            Command::Mkfile { path: p("shared") },
            Command::Write {
                path: p("shared"),
                offset: 0,
                data: Arc::from(&b"base"[..]),
            },
            Command::End,
        ]),
    );

    let children: Vec<Vec<Command>> = (2..6u128)
        .map(|n| {
            vec![
                snapshot("child", n, 1),
                Command::Write {
                    path: p("shared"),
                    offset: 4,
                    data: Arc::from(format!("-{n}").into_bytes()),
                },
                Command::End,
            ]
        })
        .collect();

    let finished = std::thread::scope(|scope| {
        let handles: Vec<_> = children
            .iter()
            .map(|commands| {
                let set = &set;
                let items = commands.iter().cloned().map(Ok::<_, StreamError>);
                scope.spawn(move || replay_commands(set, items))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect::<Vec<_>>()
    });
    for subvolume in finished {
        set.insert(subvolume).unwrap();
    }

    let base = set.get(Uuid::from_u128(1)).unwrap();
    assert_eq!(base.inode_at(b"shared").unwrap().content().unwrap(), b"base");
    for n in 2..6u128 {
        let child = set.get(Uuid::from_u128(n)).unwrap();
        assert_eq!(
            child.inode_at(b"shared").unwrap().content().unwrap(),
            format!("base-{n}").into_bytes()
        );
        assert!(set.display_name(child.uuid()).unwrap().starts_with("child@"));
    }
}

#[test]
fn test_clone_across_subvolumes() {
    let mut set = SubvolumeSet::new();
    let source = replay_bytes(
        &mut set,
        &stream(&[
            subvol("src", 1),
            Command::Mkfile { path: p("f") },
            Command::Write {
                path: p("f"),
                offset: 0,
                data: Arc::from(&b"0123456789"[..]),
            },
            Command::End,
        ]),
    );
    let target = replay_bytes(
        &mut set,
        &stream(&[
            subvol("dst", 2),
            Command::Mkfile { path: p("g") },
            Command::Clone {
                path: p("g"),
                offset: 2,
                len: 4,
                from_uuid: source,
                from_ctransid: 10,
                from_path: p("f"),
                from_offset: 3,
            },
            Command::End,
        ]),
    );
    let g = set.get(target).unwrap().inode_at(b"g").unwrap();
    assert_eq!(g.to_string(), "(File h2d4)");
    assert_eq!(g.content().unwrap(), b"\0\03456");
}

#[test]
fn test_different_histories_reach_equal_listings() {
    let write = |path: &str, offset, s: &str| Command::Write {
        path: p(path),
        offset,
        data: Arc::from(s.as_bytes()),
    };
    let chown = |path: &str| Command::Chown {
        path: p(path),
        uid: 1,
        gid: 1,
    };
    let mut bytes = stream(&[
        subvol("one", 1),
        Command::Mkdir { path: p("d") },
        Command::Mkfile { path: p("d/f") },
        write("d/f", 0, "hello world"),
        chown("d/f"),
        Command::Link {
            path: p("d/f"),
            dest: p("g"),
        },
        Command::Mkfile { path: p("scratch") },
        Command::Unlink { path: p("scratch") },
        Command::End,
    ]);
    bytes.extend(stream(&[
        subvol("two", 2),
        Command::Mkfile { path: p("o257-7-0") },
        write("o257-7-0", 6, "world"),
        chown("o257-7-0"),
        write("o257-7-0", 0, "hello "),
        Command::Mkdir { path: p("d") },
        Command::Rename {
            from: p("o257-7-0"),
            to: p("d/f"),
        },
        Command::Link {
            path: p("d/f"),
            dest: p("g"),
        },
        Command::End,
    ]));

    let mut set = SubvolumeSet::new();
    let uuids = replay_streams(&mut set, bytes.as_slice(), &ReplayOptions::default()).unwrap();
    assert_eq!(uuids, [Uuid::from_u128(1), Uuid::from_u128(2)]);

    let one = set.get(uuids[0]).unwrap().listing();
    let two = set.get(uuids[1]).unwrap().listing();
    assert_eq!(one.get(&p("g")).map(String::as_str), Some("(File o1:1 d11)"));
    assert!(!one.contains_key(&p("scratch")));
    assert_eq!(one, two);
    assert_eq!(
        set.get(uuids[1]).unwrap().inode_at(b"g").unwrap().content().unwrap(),
        b"hello world"
    );
}
