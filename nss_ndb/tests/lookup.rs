use std::path::Path;

use nss_ndb::{
    Arena, BoundedGroups, Config, Generation, LoadOptions, LoadStats, Loader, Lookup, LookupError, RecordClass,
};
use rand::seq::SliceRandom;

const PASSWD: &str = "\
alice:x:1001:1001:Alice:/home/alice:/bin/sh
bob:x:1002:1002:Bob:/home/bob:/bin/sh
";

const GROUP: &str = "staff:x:20:alice,bob\n";

fn load(dir: &Path, class: RecordClass, generation: Generation, unique: bool, text: &str) -> (LoadStats, Vec<String>) {
    let base = dir.join(class.to_string());
    let options = LoadOptions {
        class,
        unique,
        generation,
        ..LoadOptions::default()
    };
    let mut loader = Loader::create(&base, options).unwrap();
    let mut warnings = Vec::new();
    loader.load(text.as_bytes(), |w| warnings.push(w.to_string())).unwrap();
    (loader.finish().unwrap(), warnings)
}

fn config(dir: &Path) -> Config {
    Config {
        dbdir: dir.to_path_buf(),
        extended_passwd: false,
        ..Config::default()
    }
}

fn enumerate_passwd(lookup: &mut Lookup) -> Vec<String> {
    let mut buf = vec![0u8; 1024];
    let mut names = Vec::new();
    loop {
        let mut arena = Arena::new(&mut buf);
        match lookup.getpwent(&mut arena) {
            Ok(pw) => names.push(pw.name.to_str().unwrap().to_owned()),
            Err(LookupError::NotFound) => return names,
            Err(e) => panic!("enumeration failed: {}", e),
        }
    }
}

#[test]
fn alice_and_bob() {
    for generation in [Generation::Sorted, Generation::Transactional] {
        let dir = tempfile::tempdir().unwrap();
        load(dir.path(), RecordClass::Passwd, generation, true, PASSWD);
        let mut lookup = Lookup::new(&config(dir.path()));
        let mut buf = [0u8; 256];

        let mut arena = Arena::new(&mut buf);
        let alice = lookup.getpwnam(b"alice", &mut arena).unwrap();
        assert_eq!(alice.uid, 1001);
        assert_eq!(alice.gecos.to_bytes(), b"Alice");
        assert_eq!(alice.shell.to_bytes(), b"/bin/sh");

        let mut arena = Arena::new(&mut buf);
        let bob = lookup.getpwuid(1002, &mut arena).unwrap();
        assert_eq!(bob.name.to_bytes(), b"bob");
        assert_eq!(bob.dir.to_bytes(), b"/home/bob");

        let mut arena = Arena::new(&mut buf);
        assert!(matches!(lookup.getpwnam(b"carol", &mut arena), Err(LookupError::NotFound)));
        let mut arena = Arena::new(&mut buf);
        assert!(matches!(lookup.getpwuid(1001 + 1000, &mut arena), Err(LookupError::NotFound)));

        assert_eq!(enumerate_passwd(&mut lookup), ["alice", "bob"]);
        lookup.endpwent();
    }
}

#[test]
fn staff_membership() {
    let dir = tempfile::tempdir().unwrap();
    load(dir.path(), RecordClass::Group, Generation::Sorted, true, GROUP);
    let mut lookup = Lookup::new(&config(dir.path()));

    let mut slots = [0u32; 10];
    let mut groups = BoundedGroups::new(&mut slots);
    let report = lookup.group_membership(b"alice", Some(1001), &mut groups).unwrap();
    assert!(report.found);
    assert_eq!(groups.as_slice(), &[1001, 20]);
    assert_eq!(report.attempted(), 2);

    let mut buf = [0u8; 256];
    let mut arena = Arena::new(&mut buf);
    let staff = lookup.getgrgid(20, &mut arena).unwrap();
    let members: Vec<_> = staff.members().map(|m| m.to_bytes().to_vec()).collect();
    assert_eq!(members, [b"alice".to_vec(), b"bob".to_vec()]);
}

#[test]
fn membership_overflow_is_counted() {
    let dir = tempfile::tempdir().unwrap();
    let text = "a:x:10:alice\nb:x:11:alice\nc:x:12:alice\nd:x:13:alice\n";
    load(dir.path(), RecordClass::Group, Generation::Sorted, true, text);
    let mut lookup = Lookup::new(&config(dir.path()));

    let mut slots = [0u32; 3];
    let mut groups = BoundedGroups::new(&mut slots);
    let report = lookup.group_membership(b"alice", Some(10), &mut groups).unwrap();
    assert_eq!(groups.as_slice(), &[10, 11, 12]);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.overflowed, 1);
    assert_eq!(groups.count(), 4);
}

#[test]
fn buffer_too_small_replays_the_same_record() {
    let dir = tempfile::tempdir().unwrap();
    load(dir.path(), RecordClass::Passwd, Generation::Sorted, true, PASSWD);
    let mut lookup = Lookup::new(&config(dir.path()));

    let mut small = [0u8; 8];
    let mut arena = Arena::new(&mut small);
    match lookup.getpwent(&mut arena) {
        Err(LookupError::BufferTooSmall(e)) => assert!(e.requested > e.available),
        other => panic!("expected buffer too small, got {:?}", other.map(|pw| pw.uid)),
    }

    let mut buf = [0u8; 256];
    let mut arena = Arena::new(&mut buf);
    assert_eq!(lookup.getpwent(&mut arena).unwrap().name.to_bytes(), b"alice");
    let mut arena = Arena::new(&mut buf);
    assert_eq!(lookup.getpwent(&mut arena).unwrap().name.to_bytes(), b"bob");
    let mut arena = Arena::new(&mut buf);
    assert!(matches!(lookup.getpwent(&mut arena), Err(LookupError::NotFound)));
}

#[test]
fn point_lookup_with_small_buffer_is_distinguishable() {
    let dir = tempfile::tempdir().unwrap();
    load(dir.path(), RecordClass::Passwd, Generation::Sorted, true, PASSWD);
    let mut lookup = Lookup::new(&config(dir.path()));
    let mut small = [0u8; 4];
    let mut arena = Arena::new(&mut small);
    assert!(matches!(
        lookup.getpwnam(b"alice", &mut arena),
        Err(LookupError::BufferTooSmall(_))
    ));
}

#[test]
fn uniqueness_keeps_the_first_value() {
    let dir = tempfile::tempdir().unwrap();
    let text = "alice:x:1001:1001:First:/home/alice:/bin/sh\nalice:x:1001:1001:Second:/home/alice:/bin/sh\n";
    let (stats, warnings) = load(dir.path(), RecordClass::Passwd, Generation::Sorted, true, text);
    // Both the uid and the name index reject the repeat.
    assert_eq!(stats.warnings, 2);
    assert_eq!(warnings.len(), 2);
    assert_eq!(stats.imported, 1);

    let mut lookup = Lookup::new(&config(dir.path()));
    let mut buf = [0u8; 256];
    let mut arena = Arena::new(&mut buf);
    assert_eq!(lookup.getpwnam(b"alice", &mut arena).unwrap().gecos.to_bytes(), b"First");
}

#[test]
fn overwrite_keeps_the_last_value() {
    let dir = tempfile::tempdir().unwrap();
    let text = "alice:x:1001:1001:First:/home/alice:/bin/sh\nalice:x:1001:1001:Second:/home/alice:/bin/sh\n";
    let (stats, _) = load(dir.path(), RecordClass::Passwd, Generation::Sorted, false, text);
    assert_eq!(stats.warnings, 0);

    let mut lookup = Lookup::new(&config(dir.path()));
    let mut buf = [0u8; 256];
    let mut arena = Arena::new(&mut buf);
    assert_eq!(lookup.getpwuid(1001, &mut arena).unwrap().gecos.to_bytes(), b"Second");
}

#[test]
fn membership_build_is_idempotent() {
    let groups = "staff:x:20:alice,bob\nwheel:x:0:alice\n";
    let once = tempfile::tempdir().unwrap();
    load(once.path(), RecordClass::Group, Generation::Sorted, false, groups);
    let twice = tempfile::tempdir().unwrap();
    load(twice.path(), RecordClass::Group, Generation::Sorted, false, groups);
    load(twice.path(), RecordClass::Group, Generation::Sorted, false, groups);

    let read = |dir: &Path| std::fs::read(dir.join("group.byuser.db")).unwrap();
    assert_eq!(read(once.path()), read(twice.path()));

    let mut lookup = Lookup::new(&config(twice.path()));
    let mut found = Vec::new();
    lookup.group_membership(b"alice", None, &mut found).unwrap();
    assert_eq!(found, [20, 0]);
}

#[test]
fn workgroup_and_realm_are_stripped() {
    let dir = tempfile::tempdir().unwrap();
    load(dir.path(), RecordClass::Passwd, Generation::Sorted, true, PASSWD);
    load(dir.path(), RecordClass::Group, Generation::Sorted, true, GROUP);
    let mut buf = [0u8; 256];

    let mut plain = Lookup::new(&config(dir.path()));
    let mut arena = Arena::new(&mut buf);
    assert!(matches!(plain.getpwnam(b"DOMAIN\\alice", &mut arena), Err(LookupError::NotFound)));

    let mut stripping = Lookup::new(&Config {
        strip_workgroup: Some("DOMAIN".into()),
        strip_realm: Some("REALM".into()),
        ..config(dir.path())
    });
    for name in [&b"DOMAIN\\alice"[..], b"domain\\alice", b"alice@REALM", b"DOMAIN\\alice@realm"] {
        let mut arena = Arena::new(&mut buf);
        assert_eq!(stripping.getpwnam(name, &mut arena).unwrap().uid, 1001);
    }
    let mut arena = Arena::new(&mut buf);
    assert!(matches!(stripping.getpwnam(b"OTHER\\alice", &mut arena), Err(LookupError::NotFound)));

    let mut found = Vec::new();
    stripping.group_membership(b"REALMLESS\\bob@REALM", None, &mut found).unwrap();
    assert!(found.is_empty());
    stripping.group_membership(b"bob@REALM", None, &mut found).unwrap();
    assert_eq!(found, [20]);
}

#[test]
fn enumeration_visits_every_record_once_in_key_order() {
    for generation in [Generation::Sorted, Generation::Transactional] {
        let dir = tempfile::tempdir().unwrap();
        let mut lines: Vec<String> = (0..500)
            .map(|i| format!("user{:04}:x:{}:100:User {}:/home/user{:04}:/bin/sh", i, 2000 + i, i, i))
            .collect();
        lines.shuffle(&mut rand::thread_rng());
        let (stats, warnings) = load(dir.path(), RecordClass::Passwd, generation, true, &lines.join("\n"));
        assert!(warnings.is_empty());
        assert_eq!(stats.imported, 500);

        let mut lookup = Lookup::new(&config(dir.path()));
        lookup.setpwent(false).unwrap();
        let names = enumerate_passwd(&mut lookup);
        let expected: Vec<String> = (0..500).map(|i| format!("user{:04}", i)).collect();
        assert_eq!(names, expected);
        lookup.endpwent();

        // A stay-open session yields the same sequence.
        lookup.setpwent(true).unwrap();
        assert_eq!(enumerate_passwd(&mut lookup), expected);
        lookup.endpwent();
    }
}

#[test]
fn decoded_fields_match_the_loaded_line() {
    let dir = tempfile::tempdir().unwrap();
    let line = "svc-backup:*:65001:65534:Backup Service,,,:/var/backups:/usr/sbin/nologin";
    load(dir.path(), RecordClass::Passwd, Generation::Sorted, true, line);
    let mut lookup = Lookup::new(&config(dir.path()));
    let mut buf = [0u8; 256];
    let mut arena = Arena::new(&mut buf);
    let pw = lookup.getpwuid(65001, &mut arena).unwrap();
    let fields: Vec<String> = line.split(':').map(str::to_owned).collect();
    assert_eq!(pw.name.to_str().unwrap(), fields[0]);
    assert_eq!(pw.passwd.to_str().unwrap(), fields[1]);
    assert_eq!(pw.uid.to_string(), fields[2]);
    assert_eq!(pw.gid.to_string(), fields[3]);
    assert_eq!(pw.gecos.to_str().unwrap(), fields[4]);
    assert_eq!(pw.dir.to_str().unwrap(), fields[5]);
    assert_eq!(pw.shell.to_str().unwrap(), fields[6]);
}

#[test]
fn missing_indexes_are_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let mut lookup = Lookup::new(&config(dir.path()));
    let mut buf = [0u8; 64];
    let mut arena = Arena::new(&mut buf);
    assert!(matches!(lookup.getpwnam(b"alice", &mut arena), Err(LookupError::Unavailable(_))));
    assert!(matches!(lookup.setgrent(true), Err(LookupError::Unavailable(_))));
    let mut arena = Arena::new(&mut buf);
    assert!(matches!(lookup.getgrent(&mut arena), Err(LookupError::Unavailable(_))));
}

#[test]
fn memberless_groups_leave_membership_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (stats, _) = load(dir.path(), RecordClass::Group, Generation::Sorted, true, "wheel:x:0:\nstaff:x:20:\n");
    assert_eq!(stats.imported, 2);
    let mut lookup = Lookup::new(&config(dir.path()));

    let mut slots = [0u32; 4];
    let mut groups = BoundedGroups::new(&mut slots);
    let report = lookup.group_membership(b"alice", Some(1001), &mut groups).unwrap();
    assert!(!report.found);
    assert_eq!(groups.as_slice(), &[1001]);

    let mut buf = [0u8; 64];
    let mut arena = Arena::new(&mut buf);
    let staff = lookup.getgrnam(b"staff", &mut arena).unwrap();
    assert_eq!(staff.members().count(), 0);
}
