mod common;

use std::sync::Arc;

use apfs::{Error, Inode, Options, ROOT_DIR_INO};
use common::{FailingStore, Test};

const ROOT: u64 = ROOT_DIR_INO;

fn failing() -> (Test, Arc<FailingStore>) {
    let store = Arc::new(FailingStore::default());
    let mut options = Options::new();
    options.inode_store(store.clone());
    (Test::with_options(&options), store)
}

fn is_injected(err: Error) -> bool {
    matches!(err, Error::Io(_))
}

/// Everything a failed operation must leave untouched.
struct Snapshot {
    image: Vec<Vec<u8>>,
    inodes: Vec<Inode>,
}

impl Snapshot {
    fn take(t: &Test, cnids: &[u64]) -> Self {
        Snapshot {
            image: t.catalog_image(),
            inodes: cnids.iter().map(|cnid| t.inode(*cnid)).collect(),
        }
    }

    fn assert_unchanged(&self, t: &Test, cnids: &[u64]) {
        assert!(t.catalog_image() == self.image, "catalog changed");
        let inodes: Vec<Inode> = cnids.iter().map(|cnid| t.inode(*cnid)).collect();
        assert_eq!(inodes, self.inodes);
    }
}

#[test]
fn failed_create_leaves_no_trace() {
    let (t, store) = failing();
    let d = t.mkdir(ROOT, "D");
    for name in ["x", "y", "z"] {
        t.create(d, name);
    }
    let before = Snapshot::take(&t, &[d]);

    store.fail_updates_of(d);
    let err = t.fs.create(d, "a", 0o644, 0).unwrap_err();
    assert!(is_injected(err));
    assert_eq!(t.inode(d).nchildren, 3);
    assert_eq!(t.lookup(d, "a"), None);
    assert_eq!(t.names(d), ["x", "y", "z"]);
    before.assert_unchanged(&t, &[d]);

    let err = t.fs.mkdir(d, "sub", 0o755).unwrap_err();
    assert!(is_injected(err));
    before.assert_unchanged(&t, &[d]);

    store.heal();
    let a = t.create(d, "a");
    assert_eq!(t.lookup(d, "a"), Some(a));
    assert_eq!(t.inode(d).nchildren, 4);
    t.check();
}

#[test]
fn failed_link_leaves_no_trace() {
    let (t, store) = failing();
    let d = t.mkdir(ROOT, "d");
    let f = t.create(ROOT, "f");
    let before = Snapshot::take(&t, &[ROOT, d, f]);

    // The new name is never created if the link count cannot be raised.
    store.fail_updates_of(f);
    assert!(is_injected(t.fs.link(f, d, "g").unwrap_err()));
    before.assert_unchanged(&t, &[ROOT, d, f]);
    assert!(t.sibling_links(f).is_empty());

    // Nor if the directory cannot account for it.
    store.fail_updates_of(d);
    assert!(is_injected(t.fs.link(f, d, "g").unwrap_err()));
    before.assert_unchanged(&t, &[ROOT, d, f]);
    assert_eq!(t.lookup(d, "g"), None);
    assert_eq!(t.drec(ROOT, "f").sibling_id, 0);
    t.check();

    store.heal();
    t.fs.link(f, d, "g").unwrap();
    assert_eq!(t.inode(f).nlink, 2);
    t.check();
}

#[test]
fn failed_unlink_keeps_the_entry() {
    let (t, store) = failing();
    let d = t.mkdir(ROOT, "d");
    let x = t.create(d, "x");
    t.fs.link(x, d, "y").unwrap();
    let before = Snapshot::take(&t, &[d, x]);

    store.fail_updates_of(d);
    assert!(is_injected(t.fs.unlink(d, "x").unwrap_err()));
    before.assert_unchanged(&t, &[d, x]);
    assert_eq!(t.lookup(d, "x"), Some(x));
    assert_eq!(t.sibling_links(x).len(), 2);

    // Dropping the last link fails while the inode cannot be moved to the orphanage.
    store.heal();
    t.fs.unlink(d, "y").unwrap();
    let before = Snapshot::take(&t, &[d, x]);
    store.fail_updates_of(x);
    assert!(is_injected(t.fs.unlink(d, "x").unwrap_err()));
    before.assert_unchanged(&t, &[d, x]);
    assert_eq!(t.check().orphans, 0);

    store.heal();
    t.fs.unlink(d, "x").unwrap();
    assert_eq!(t.check().orphans, 1);
}

#[test]
fn failed_rmdir_keeps_the_directory() {
    let (t, store) = failing();
    let d = t.mkdir(ROOT, "d");
    let before = Snapshot::take(&t, &[ROOT, d]);

    store.fail_updates_of(ROOT);
    assert!(is_injected(t.fs.rmdir(ROOT, "d").unwrap_err()));
    before.assert_unchanged(&t, &[ROOT, d]);
    assert_eq!(t.lookup(ROOT, "d"), Some(d));

    store.heal();
    t.fs.rmdir(ROOT, "d").unwrap();
    t.check();
}

#[test]
fn failed_rename_is_undone() {
    let (t, store) = failing();
    let src = t.mkdir(ROOT, "src");
    let dst = t.mkdir(ROOT, "dst");
    let a = t.create(src, "a");
    let b = t.create(dst, "b");
    let cnids = [ROOT, src, dst, a, b];
    let before = Snapshot::take(&t, &cnids);

    // The source directory is updated last, after the new name already exists.
    store.fail_updates_of(src);
    assert!(is_injected(
        t.fs.rename(src, "a", dst, "new", 0).unwrap_err()
    ));
    before.assert_unchanged(&t, &cnids);
    assert_eq!(t.lookup(src, "a"), Some(a));
    assert_eq!(t.lookup(dst, "new"), None);

    // Replacing an existing name fails after the victim lost its entry.
    assert!(is_injected(t.fs.rename(src, "a", dst, "b", 0).unwrap_err()));
    before.assert_unchanged(&t, &cnids);
    assert_eq!(t.lookup(dst, "b"), Some(b));
    t.check();

    store.heal();
    t.fs.rename(src, "a", dst, "b", 0).unwrap();
    assert_eq!(t.lookup(dst, "b"), Some(a));
    assert_eq!(t.lookup(src, "a"), None);
    assert_eq!(t.inode(b).nlink, 0);
    t.check();
}
