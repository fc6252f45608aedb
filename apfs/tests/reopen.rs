mod common;

use apfs::{Container, FileDevice, Filesystem, FormatParams, Options, ROOT_DIR_INO};
use common::{Test, BLOCKS};

const ROOT: u64 = ROOT_DIR_INO;

fn open(path: &std::path::Path) -> Test {
    let dev = FileDevice::open(path, 4096).unwrap();
    let fs = Container::open(Box::new(dev), &Options::new()).unwrap();
    Test {
        fs: Filesystem::from(fs),
    }
}

#[test]
fn tree_survives_remount() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image");

    let dev = FileDevice::create(&path, 4096, BLOCKS).unwrap();
    let mut params = FormatParams::new();
    params.label("scratch");
    let fs = Filesystem::format(Box::new(dev), &params, &Options::new()).unwrap();
    let t = Test { fs };

    let docs = t.mkdir(ROOT, "docs");
    let notes = t.mkdir(docs, "notes");
    let a = t.create(docs, "a.txt");
    t.create(notes, "todo");
    t.fs.link(a, notes, "a-link").unwrap();
    let gone = t.create(ROOT, "gone");
    t.fs.unlink(ROOT, "gone").unwrap();
    t.fs.rename(docs, "a.txt", ROOT, "a.txt", 0).unwrap();

    let tree = [ROOT, docs, notes].map(|dir| t.names(dir));
    let inodes = [ROOT, docs, notes, a, gone].map(|cnid| t.inode(cnid));
    let report = t.check();
    let (uuid, xid) = t.fs.with_container(|fs| (fs.uuid(), fs.xid()));
    drop(t.fs.into_container().into_device());

    let t = open(&path);
    t.fs.with_container(|fs| {
        assert_eq!(fs.uuid(), uuid);
        assert_eq!(fs.xid(), xid);
        assert_eq!(fs.label(), "scratch");
        assert_eq!(fs.block_count(), BLOCKS);
    });
    assert_eq!([ROOT, docs, notes].map(|dir| t.names(dir)), tree);
    assert_eq!([ROOT, docs, notes, a, gone].map(|cnid| t.inode(cnid)), inodes);
    assert_eq!(t.check().to_string(), report.to_string());

    // New ids do not reuse the old ones.
    let fresh = t.create(ROOT, "fresh");
    assert!(fresh > gone);
    t.fs.evict_inode(gone).unwrap();
    t.check();
}

#[test]
fn uncommitted_work_is_lost() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image");
    let dev = FileDevice::create(&path, 4096, BLOCKS).unwrap();
    let mut fs = Container::format(Box::new(dev), &FormatParams::new(), &Options::new()).unwrap();

    fs.transaction_start().unwrap();
    let mut root = fs.inode(ROOT).unwrap();
    root.nchildren = 7;
    fs.persist_inode(&root, None).unwrap();
    // Unmount with the transaction still open.
    drop(fs.into_device());

    let t = open(&path);
    assert_eq!(t.inode(ROOT).nchildren, 0);
    t.check();
}
