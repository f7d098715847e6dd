//! Round-trip and overlay properties of the virtual directory layer

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use weir_cas::{CasTree, ImportSource, ObjectStore};

fn new_tree() -> (TempDir, CasTree) {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ObjectStore::open(tmp.path()).unwrap());
    (tmp, CasTree::new(store))
}

fn stage_fixture(dir: &std::path::Path) {
    fs::write(dir.join("a"), b"x\n").unwrap();
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("bin/hello"), b"#!/bin/sh\necho hello\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir.join("bin/hello"), fs::Permissions::from_mode(0o755)).unwrap();
    }
    fs::create_dir_all(dir.join("empty")).unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("bin/hello", dir.join("hello-link")).unwrap();
}

#[test]
fn import_export_round_trip() {
    let src = TempDir::new().unwrap();
    stage_fixture(src.path());

    let (_store_tmp, mut tree) = new_tree();
    let root = tree.root();
    tree.import(root, ImportSource::Fs(src.path()), None).unwrap();

    let out = TempDir::new().unwrap();
    let dest = out.path().join("export");
    tree.export_to(root, &dest).unwrap();

    // Same path set, same contents, same types
    let src_listing = weir_cas::fs_list_relative_paths(src.path()).unwrap();
    let dest_listing = weir_cas::fs_list_relative_paths(&dest).unwrap();
    assert_eq!(src_listing, dest_listing);

    assert_eq!(fs::read(dest.join("a")).unwrap(), b"x\n");
    assert_eq!(
        fs::read(dest.join("bin/hello")).unwrap(),
        b"#!/bin/sh\necho hello\n"
    );
    assert!(dest.join("empty").is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dest.join("bin/hello")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "executable bit survives the round trip");
        assert_eq!(
            fs::read_link(dest.join("hello-link")).unwrap().to_string_lossy(),
            "bin/hello"
        );
    }
}

#[test]
fn import_is_idempotent() {
    let src = TempDir::new().unwrap();
    stage_fixture(src.path());

    let (_t1, mut once) = new_tree();
    let once_root = once.root();
    once.import(once_root, ImportSource::Fs(src.path()), None).unwrap();
    let once_digest = once.digest(once_root).unwrap();

    let (_t2, mut twice) = new_tree();
    let twice_root = twice.root();
    twice.import(twice_root, ImportSource::Fs(src.path()), None).unwrap();
    twice.import(twice_root, ImportSource::Fs(src.path()), None).unwrap();
    let twice_digest = twice.digest(twice_root).unwrap();

    assert_eq!(once_digest, twice_digest);
}

#[test]
fn overlay_rule_across_cas_trees() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(ObjectStore::open(tmp.path()).unwrap());

    // Base tree: a file, an empty dir, a non-empty dir
    let mut base = CasTree::new(store.clone());
    let base_root = base.root();
    let d = store.put_bytes(b"from base").unwrap();
    base.add_file_entry(base_root, "shared", d, false, false);
    base.descend(base_root, &["emptycol"], true).unwrap();
    let nonempty = base.descend(base_root, &["noncol"], true).unwrap();
    let keep = store.put_bytes(b"keep me").unwrap();
    base.add_file_entry(nonempty, "keep", keep, false, false);
    let only = store.put_bytes(b"base only").unwrap();
    base.add_file_entry(base_root, "base-only", only, false, false);

    // Overlay tree: overwrites the file, collides with both dirs
    let mut overlay = CasTree::new(store.clone());
    let overlay_root = overlay.root();
    let d2 = store.put_bytes(b"from overlay").unwrap();
    overlay.add_file_entry(overlay_root, "shared", d2.clone(), false, false);
    overlay.descend(overlay_root, &["emptycol"], true).unwrap();
    overlay.descend(overlay_root, &["noncol"], true).unwrap();

    let result = base
        .import(base_root, ImportSource::Cas(&mut overlay, overlay_root), None)
        .unwrap();

    // File collision overwritten
    assert!(result.overwritten.iter().any(|p| p == "shared"));
    assert!(matches!(
        base.lookup(base_root, "shared").unwrap(),
        Some(weir_cas::EntryKind::File { digest, .. }) if digest == d2
    ));
    // Empty dir collision replaced
    assert!(result.overwritten.iter().any(|p| p == "emptycol"));
    // Non-empty dir collision ignored and reported
    assert_eq!(result.ignored, vec!["noncol"]);
    assert!(base.lookup(base_root, "noncol/keep").unwrap().is_some());
    // Paths only in the base are untouched
    assert!(base.lookup(base_root, "base-only").unwrap().is_some());
}

#[test]
fn symlinks_import_before_files_that_traverse_them() {
    let src = TempDir::new().unwrap();
    fs::create_dir_all(src.path().join("real")).unwrap();
    fs::write(src.path().join("real/file"), b"data").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("real", src.path().join("alias")).unwrap();

    let (_t, mut tree) = new_tree();
    let root = tree.root();
    tree.import(root, ImportSource::Fs(src.path()), None).unwrap();

    // The alias resolves through to the imported directory
    let through = tree.descend(root, &["alias"], false).unwrap();
    let direct = tree.descend(root, &["real"], false).unwrap();
    assert_eq!(through, direct);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Directory digests are a function of logical content only.
    #[test]
    fn digest_determinism(files in proptest::collection::btree_map(
        "[a-z]{1,8}",
        proptest::collection::vec(any::<u8>(), 0..64),
        1..8,
    )) {
        let digest_of = |files: &BTreeMap<String, Vec<u8>>| {
            let (_t, mut tree) = new_tree();
            let root = tree.root();
            for (name, data) in files {
                let d = tree.store().put_bytes(data).unwrap();
                tree.add_file_entry(root, name, d, false, false);
            }
            tree.digest(root).unwrap()
        };

        prop_assert_eq!(digest_of(&files), digest_of(&files));
    }

    /// An import into a fresh tree always reproduces the source listing.
    #[test]
    fn import_listing_matches_source(files in proptest::collection::btree_map(
        "[a-z]{1,6}(/[a-z]{1,6}){0,2}",
        proptest::collection::vec(any::<u8>(), 0..32),
        1..8,
    )) {
        let src = TempDir::new().unwrap();
        let mut staged = 0;
        for (rel, data) in &files {
            let path = src.path().join(rel);
            // A nested path may collide with a file staged earlier
            // (e.g. "a" then "a/b"); skip those.
            if let Some(parent) = path.parent() {
                if fs::create_dir_all(parent).is_err() {
                    continue;
                }
            }
            if path.exists() || fs::write(&path, data).is_err() {
                continue;
            }
            staged += 1;
        }
        prop_assume!(staged > 0);

        let (_t, mut tree) = new_tree();
        let root = tree.root();
        tree.import(root, ImportSource::Fs(src.path()), None).unwrap();

        let src_listing = weir_cas::fs_list_relative_paths(src.path()).unwrap();
        let tree_listing = tree.list_relative_paths(root).unwrap();
        prop_assert_eq!(src_listing, tree_listing);
    }
}
