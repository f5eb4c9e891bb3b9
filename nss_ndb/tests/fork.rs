//! Index sessions across `fork`. This file holds a single test so that no
//! other test thread owns a lock when the child starts.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use nss_ndb::{Access, Generation, LoadOptions, Loader, Seek, Store};

/// Runs `f` in a forked child and reports whether it returned normally.
fn in_child(f: impl FnOnce()) -> bool {
    match unsafe { libc::fork() } {
        -1 => panic!("fork: {}", std::io::Error::last_os_error()),
        0 => {
            let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        child => {
            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(child, &mut status, 0) }, child);
            libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
        }
    }
}

fn build(path: &Path, generation: Generation) {
    let options = LoadOptions {
        generation,
        ..LoadOptions::default()
    };
    let mut loader = Loader::create(path, options).unwrap();
    loader.load(&b"alice:1\nbob:2\n"[..], |w| panic!("{}", w)).unwrap();
    loader.finish().unwrap();
}

fn value(store: &mut Store, key: &str) -> Option<Vec<u8>> {
    store.get(key.as_bytes()).unwrap()
}

#[test]
fn readers_in_other_processes_and_forked_children() {
    let dir = tempfile::tempdir_in("/tmp").unwrap();
    fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755)).unwrap();

    for generation in [Generation::Sorted, Generation::Transactional] {
        let path = dir.path().join(generation.to_string());
        build(&path, generation);

        let mut store = Store::open(&path, Access::ReadOnly).unwrap();
        assert_eq!(value(&mut store, "alice"), Some(b"alice:1\0".to_vec()));

        // Another process opens the same index while this one holds it.
        assert!(
            in_child(|| {
                let mut other = Store::open(&path, Access::ReadOnly).unwrap();
                assert_eq!(value(&mut other, "bob"), Some(b"bob:2\0".to_vec()));
                other.close().unwrap();
            }),
            "{}: second reader failed",
            generation
        );

        // A child keeps using the session it inherited.
        assert!(
            in_child(|| {
                assert_eq!(value(&mut store, "bob"), Some(b"bob:2\0".to_vec()));
                let last = store.seek(Seek::Last).unwrap().map(|(key, _)| key);
                assert_eq!(last, Some(b"bob".to_vec()));
            }),
            "{}: inherited session failed",
            generation
        );

        // Without root, an index readable by everyone still opens.
        if unsafe { libc::geteuid() } == 0 {
            assert!(
                in_child(|| {
                    unsafe {
                        assert_eq!(libc::setgid(65534), 0);
                        assert_eq!(libc::setuid(65534), 0);
                    }
                    let mut other = Store::open(&path, Access::ReadOnly).unwrap();
                    assert_eq!(value(&mut other, "alice"), Some(b"alice:1\0".to_vec()));
                }),
                "{}: unprivileged reader failed",
                generation
            );
        }

        assert_eq!(value(&mut store, "bob"), Some(b"bob:2\0".to_vec()));
        store.close().unwrap();
    }
}
