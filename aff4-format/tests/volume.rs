//! Volume persistence, multi-archive merging and lock discipline.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use aff4_format::{
    attrs, CancellationToken, Compression, Error, Mode, Object, OpenOptions, Resolver,
    ResolverConfig, Segment, Urn, ZipVolume,
};
use tempfile::TempDir;

fn scratch(name: &str) -> (TempDir, Urn) {
    let dir = TempDir::new().unwrap();
    let backing = Urn::from_path(dir.path().join(name)).unwrap();
    (dir, backing)
}

/// The archive clock has one-second resolution.
fn next_second() {
    thread::sleep(Duration::from_millis(1100));
}

fn members(resolver: &Resolver, volume: &Urn) -> Vec<Urn> {
    let handle = resolver.open_as::<ZipVolume>(volume, Mode::Read).unwrap();
    let members = handle.members();
    resolver.cache_return(handle);
    members
}

/// Members written, closed and reloaded come back with their sizes and CRCs.
#[test]
fn test_close_and_reopen() {
    let (_dir, backing) = scratch("abc.zip");
    let resolver = Resolver::default();
    let mut volume = ZipVolume::create_in(&resolver, &backing).unwrap();
    let volume_urn = volume.urn().clone();

    let contents: BTreeMap<&str, Vec<u8>> = [
        ("A", b"first member".to_vec()),
        ("B", vec![0u8; 70_000]),
        ("C", Vec::from(&b"third"[..])),
    ]
    .into_iter()
    .collect();
    for (name, data) in &contents {
        let member = volume.member_urn(name);
        let compression = if data.len() > 1000 {
            Compression::Deflate
        } else {
            Compression::Stored
        };
        volume.writestr(&member, data, compression).unwrap();
    }
    volume.close().unwrap();
    resolver.flush().unwrap();

    let fresh = Resolver::default();
    assert_eq!(ZipVolume::load_from(&fresh, &backing).unwrap(), volume_urn);

    let mut listed: Vec<String> = members(&fresh, &volume_urn)
        .iter()
        .filter_map(|m| m.relative_to(&volume_urn).map(str::to_string))
        .filter(|name| name != "properties")
        .collect();
    listed.sort();
    assert_eq!(listed, ["A", "B", "C"]);

    for (name, data) in &contents {
        let member = volume_urn.append(name);
        assert_eq!(fresh.resolve_u64(&member, attrs::SIZE), Some(data.len() as u64));
        assert_eq!(
            fresh.resolve_u64(&member, attrs::ZIP_CRC),
            Some(u64::from(crc32fast::hash(data)))
        );
        assert_eq!(&Segment::read_all(&fresh, &member).unwrap(), data);
    }
}

/// The URN comes from the archive comment, so a moved archive still loads.
#[test]
fn test_relocated_archive() {
    let (dir, backing) = scratch("before.zip");
    let resolver = Resolver::default();
    let mut volume = ZipVolume::create_in(&resolver, &backing).unwrap();
    let volume_urn = volume.urn().clone();
    let member = volume.member_urn("note");
    volume.writestr(&member, b"moved", Compression::Stored).unwrap();
    volume.close().unwrap();
    resolver.flush().unwrap();

    let moved = dir.path().join("after.zip");
    std::fs::rename(backing.to_file_path().unwrap(), &moved).unwrap();

    let fresh = Resolver::default();
    assert_eq!(ZipVolume::open_path(&fresh, &moved).unwrap(), volume_urn);
    assert_eq!(
        fresh.resolve_urn(&volume_urn, attrs::STORED),
        Some(Urn::from_path(&moved).unwrap())
    );
    assert_eq!(Segment::read_all(&fresh, &member).unwrap(), b"moved");
}

/// Writes `member` into a new archive of `volume` and closes it.
fn archive_with(resolver: &Resolver, volume: &Urn, backing: &Urn, member: &Urn, data: &[u8]) {
    let mut handle = ZipVolume::create_named(resolver, volume, backing).unwrap();
    if data.is_empty() {
        handle.remove_member(member).unwrap();
    } else {
        handle.writestr(member, data, Compression::Stored).unwrap();
    }
    handle.close().unwrap();
}

/// A newer tombstone deletes a member whichever order the archives load in.
#[test]
fn test_merge_tombstone_wins_by_timestamp() {
    let dir = TempDir::new().unwrap();
    let v1 = Urn::from_path(dir.path().join("v1.zip")).unwrap();
    let v2 = Urn::from_path(dir.path().join("v2.zip")).unwrap();
    let volume = Urn::new("aff4://merged-volume");
    let member = volume.append("M");

    let resolver = Resolver::default();
    archive_with(&resolver, &volume, &v1, &member, &[5u8; 10]);
    next_second();
    archive_with(&resolver, &volume, &v2, &member, &[]);
    resolver.flush().unwrap();

    for order in [[v1.clone(), v2.clone()], [v2.clone(), v1.clone()]] {
        let fresh = Resolver::default();
        assert_eq!(ZipVolume::load_merged(&fresh, &order).unwrap(), volume);
        assert!(!members(&fresh, &volume).contains(&member));
    }
}

/// An older tombstone does not delete a member written after it.
#[test]
fn test_merge_newer_member_survives_older_tombstone() {
    let dir = TempDir::new().unwrap();
    let v1 = Urn::from_path(dir.path().join("v1.zip")).unwrap();
    let v2 = Urn::from_path(dir.path().join("v2.zip")).unwrap();
    let volume = Urn::new("aff4://readded-volume");
    let member = volume.append("M");

    let resolver = Resolver::default();
    archive_with(&resolver, &volume, &v1, &member, &[]);
    next_second();
    archive_with(&resolver, &volume, &v2, &member, b"back");
    resolver.flush().unwrap();

    for order in [[v1.clone(), v2.clone()], [v2.clone(), v1.clone()]] {
        let fresh = Resolver::default();
        ZipVolume::load_merged(&fresh, &order).unwrap();
        assert!(members(&fresh, &volume).contains(&member));
        assert_eq!(Segment::read_all(&fresh, &member).unwrap(), b"back");
    }
}

#[test]
fn test_merge_rejects_foreign_volumes() {
    let dir = TempDir::new().unwrap();
    let resolver = Resolver::default();
    let mut backings = vec![];
    for name in ["x.zip", "y.zip"] {
        let backing = Urn::from_path(dir.path().join(name)).unwrap();
        ZipVolume::create_in(&resolver, &backing)
            .unwrap()
            .close()
            .unwrap();
        backings.push(backing);
    }
    resolver.flush().unwrap();

    let err = ZipVolume::load_merged(&Resolver::default(), &backings).unwrap_err();
    assert!(matches!(err, Error::Structural(_)));
}

fn member_in_new_volume(resolver: &Resolver, backing: &Urn) -> Urn {
    let volume = ZipVolume::create_in(resolver, backing).unwrap();
    let volume_urn = volume.urn().clone();
    resolver.cache_return(volume);
    let mut segment = Segment::create_in(resolver, &volume_urn, "locked").unwrap();
    segment.write_all(b"contended").unwrap();
    let urn = segment.urn().clone();
    segment.close().unwrap();
    urn
}

/// Opening a URN twice on one thread without returning it hangs.
#[test]
fn test_reopen_on_same_thread_deadlocks() {
    let (_dir, backing) = scratch("deadlock.zip");
    let resolver = Resolver::default();
    let urn = member_in_new_volume(&resolver, &backing);

    let (tx, rx) = mpsc::channel();
    {
        let resolver = resolver.clone();
        let urn = urn.clone();
        thread::spawn(move || {
            let first = resolver.open(&urn, Mode::Read).unwrap();
            let second = resolver.open(&urn, Mode::Read);
            let _ = tx.send(second.is_ok());
            drop(first);
        });
    }
    assert!(matches!(
        rx.recv_timeout(Duration::from_millis(500)),
        Err(mpsc::RecvTimeoutError::Timeout)
    ));
}

#[test]
fn test_lock_timeout_and_cancellation() {
    let (_dir, backing) = scratch("lease.zip");
    let resolver = Resolver::default();
    let urn = member_in_new_volume(&resolver, &backing);

    let held = resolver.open(&urn, Mode::Read).unwrap();
    let err = resolver
        .open_with(&urn, Mode::Read, &OpenOptions::timeout(Duration::from_millis(100)))
        .unwrap_err();
    assert!(matches!(err, Error::LockTimeout(_)));

    let token = CancellationToken::new();
    let waiter = {
        let resolver = resolver.clone();
        let urn = urn.clone();
        let token = token.clone();
        thread::spawn(move || {
            resolver
                .open_with(&urn, Mode::Read, &OpenOptions::cancellable(token))
                .map(|handle| resolver.cache_return(handle))
        })
    };
    thread::sleep(Duration::from_millis(100));
    token.cancel();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Cancelled(_))));

    // Returning the object frees the URN for everyone else.
    resolver.cache_return(held);
    let again = thread::spawn({
        let resolver = resolver.clone();
        move || {
            let handle = resolver
                .open_with(&urn, Mode::Read, &OpenOptions::timeout(Duration::from_secs(5)))
                .unwrap();
            resolver.cache_return(handle);
        }
    });
    again.join().unwrap();
}

#[test]
fn test_reentrancy_detection() {
    let (_dir, backing) = scratch("reentrant.zip");
    let resolver = Resolver::new(ResolverConfig {
        detect_reentrancy: true,
        ..ResolverConfig::default()
    });
    let urn = member_in_new_volume(&resolver, &backing);

    let held = resolver.open(&urn, Mode::Read).unwrap();
    assert!(matches!(
        resolver.open(&urn, Mode::Read),
        Err(Error::ConcurrencyHazard(_))
    ));
    resolver.cache_return(held);
    resolver.flush().unwrap();
}
