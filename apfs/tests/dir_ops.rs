mod common;

use apfs::catalog::orphan_name;
use apfs::dir::NAME_MAX;
use apfs::{
    Container, Error, Filesystem, FormatParams, MemDevice, Options, PRIV_DIR_INO, RENAME_EXCHANGE,
    RENAME_NOREPLACE, RENAME_WHITEOUT, ROOT_DIR_INO,
};
use apfs_core::records::{DT_DIR, DT_REG, S_IFREG};
use common::{Test, BLOCKS};

const ROOT: u64 = ROOT_DIR_INO;

#[test]
fn create_lookup_readdir() {
    let t = Test::new();
    let a = t.create(ROOT, "a");
    let d = t.mkdir(ROOT, "d");
    let b = t.create(d, "b");

    assert_eq!(t.lookup(ROOT, "a"), Some(a));
    assert_eq!(t.lookup(d, "b"), Some(b));
    assert_eq!(t.root_names(), ["a", "d"]);

    let mut entries = Vec::new();
    let end = t
        .fs
        .readdir(d, 0, &mut |name, cnid, ty| {
            entries.push((name.to_owned(), cnid, ty));
            true
        })
        .unwrap();
    assert_eq!(end, 3);
    assert_eq!(
        entries,
        [
            (".".to_owned(), d, DT_DIR),
            ("..".to_owned(), ROOT, DT_DIR),
            ("b".to_owned(), b, DT_REG),
        ]
    );

    let inode = t.inode(b);
    assert_eq!((inode.parent_id, inode.name.as_str(), inode.nlink), (d, "b", 1));
    assert_eq!(t.inode(ROOT).nchildren, 2);
    assert_eq!(t.inode(d).nchildren, 1);

    let report = t.check();
    assert_eq!(report.inodes, 5);
    assert_eq!(report.dentries, 3);
}

#[test]
fn bad_names_are_rejected() {
    let t = Test::new();
    for name in ["", ".", "..", "a/b"] {
        assert!(matches!(
            t.fs.create(ROOT, name, S_IFREG, 0),
            Err(Error::InvalidArgument(_))
        ));
    }
    for len in [NAME_MAX + 1, 1000] {
        assert!(matches!(
            t.fs.create(ROOT, &"x".repeat(len), S_IFREG, 0),
            Err(Error::NameTooLong)
        ));
        assert!(matches!(
            t.fs.mkdir(ROOT, &"x".repeat(len), 0o755),
            Err(Error::NameTooLong)
        ));
        assert!(matches!(t.fs.lookup(ROOT, &"x".repeat(len)), Err(Error::NameTooLong)));
    }
    assert!(t.root_names().is_empty());
    let long = "y".repeat(NAME_MAX);
    let cnid = t.create(ROOT, &long);
    assert_eq!(t.lookup(ROOT, &long), Some(cnid));
    t.check();
}

#[test]
fn absent_names_stay_absent() {
    let t = Test::new();
    assert_eq!(t.lookup(ROOT, "never"), None);
    assert_eq!(t.lookup(ROOT, "never"), None);

    t.create(ROOT, "gone");
    t.fs.unlink(ROOT, "gone").unwrap();
    assert_eq!(t.lookup(ROOT, "gone"), None);
    assert_eq!(t.lookup(ROOT, "gone"), None);
    assert!(matches!(t.fs.unlink(ROOT, "gone"), Err(Error::NotFound)));
}

#[test]
fn link_then_unlink() {
    let t = Test::new();
    let f = t.create(ROOT, "f");
    assert_eq!(t.inode(f).nlink, 1);
    assert_eq!(t.drec(ROOT, "f").sibling_id, 0);
    assert!(t.sibling_links(f).is_empty());

    t.fs.link(f, ROOT, "g").unwrap();
    assert_eq!(t.inode(f).nlink, 2);
    let sf = t.drec(ROOT, "f").sibling_id;
    let sg = t.drec(ROOT, "g").sibling_id;
    assert!(sf != 0 && sg != 0);
    assert_ne!(sf, sg);
    let links = t.sibling_links(f);
    assert_eq!(links.len(), 2);
    for (sibling_id, name) in [(sf, "f"), (sg, "g")] {
        let link = links.iter().find(|l| l.sibling_id == sibling_id).unwrap();
        assert_eq!((link.parent_id, link.name.as_str()), (ROOT, name));
        assert_eq!(t.sibling_map_owner(sibling_id), Some(f));
    }
    assert_eq!(t.check().hard_linked, 1);

    let g_before = t.drec(ROOT, "g");
    t.fs.unlink(ROOT, "f").unwrap();
    let inode = t.inode(f);
    assert_eq!(inode.nlink, 1);
    assert_eq!((inode.parent_id, inode.name.as_str()), (ROOT, "g"));
    assert_eq!(t.lookup(ROOT, "f"), None);
    assert_eq!(t.drec(ROOT, "g"), g_before);
    let links = t.sibling_links(f);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].sibling_id, sg);
    assert_eq!(t.sibling_map_owner(sf), None);
    assert_eq!(t.inode(ROOT).nchildren, 1);
    assert_eq!(t.check().hard_linked, 0);
}

#[test]
fn primary_link_follows_the_lowest_sibling_id() {
    let t = Test::new();
    let d = t.mkdir(ROOT, "d");
    let a = t.create(ROOT, "a");
    t.fs.link(a, d, "b").unwrap();
    t.fs.link(a, ROOT, "c").unwrap();
    t.fs.link(a, d, "e").unwrap();
    assert_eq!(t.inode(a).nlink, 4);

    let ids: Vec<_> = t.sibling_links(a).iter().map(|l| l.sibling_id).collect();
    assert_eq!(ids.len(), 4);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));

    t.fs.unlink(ROOT, "a").unwrap();
    let inode = t.inode(a);
    assert_eq!((inode.parent_id, inode.name.as_str()), (d, "b"));

    // Removing a link other than the primary keeps the primary.
    t.fs.unlink(ROOT, "c").unwrap();
    let inode = t.inode(a);
    assert_eq!((inode.parent_id, inode.name.as_str()), (d, "b"));

    t.fs.unlink(d, "b").unwrap();
    let inode = t.inode(a);
    assert_eq!((inode.parent_id, inode.name.as_str(), inode.nlink), (d, "e", 1));
    t.check();

    // The primary name survives a remount.
    let fs = Container::open(t.fs.into_container().into_device(), &Options::new()).unwrap();
    let fs = Filesystem::from(fs);
    let inode = fs.stat(a).unwrap();
    assert_eq!((inode.parent_id, inode.name.as_str(), inode.nlink), (d, "e", 1));
}

#[test]
fn rmdir_leaves_non_empty_directories_alone() {
    let t = Test::new();
    let d = t.mkdir(ROOT, "d");
    t.create(d, "x");
    let image = t.catalog_image();
    let xid = t.fs.with_container(|fs| fs.xid());

    assert!(matches!(t.fs.rmdir(ROOT, "d"), Err(Error::NotEmpty)));
    assert_eq!(t.catalog_image(), image);
    assert_eq!(t.fs.with_container(|fs| fs.xid()), xid);
    assert_eq!(t.inode(d).nchildren, 1);

    assert!(matches!(t.fs.rmdir(d, "x"), Err(Error::NotDirectory)));
    t.fs.unlink(d, "x").unwrap();
    t.fs.rmdir(ROOT, "d").unwrap();
    assert_eq!(t.lookup(ROOT, "d"), None);
    assert_eq!(t.inode(ROOT).nchildren, 0);
    t.check();
}

#[test]
fn rename_rejects_exchange_without_touching_anything() {
    let t = Test::new();
    let a = t.create(ROOT, "a");
    let b = t.create(ROOT, "b");
    let image = t.catalog_image();
    let inodes = (t.inode(a), t.inode(b), t.inode(ROOT));

    for flags in [RENAME_EXCHANGE, RENAME_WHITEOUT, RENAME_EXCHANGE | RENAME_NOREPLACE] {
        assert!(matches!(
            t.fs.rename(ROOT, "a", ROOT, "b", flags),
            Err(Error::InvalidArgument(_))
        ));
    }
    assert_eq!(t.catalog_image(), image);
    assert_eq!((t.inode(a), t.inode(b), t.inode(ROOT)), inodes);
    assert_eq!(t.lookup(ROOT, "a"), Some(a));
    assert_eq!(t.lookup(ROOT, "b"), Some(b));
}

#[test]
fn rename_moves_between_directories() {
    let t = Test::new();
    let src = t.mkdir(ROOT, "src");
    let dst = t.mkdir(ROOT, "dst");
    let f = t.create(src, "f");

    t.fs.rename(src, "f", dst, "g", RENAME_NOREPLACE).unwrap();
    assert_eq!(t.lookup(src, "f"), None);
    assert_eq!(t.lookup(dst, "g"), Some(f));
    let inode = t.inode(f);
    assert_eq!((inode.parent_id, inode.name.as_str(), inode.nlink), (dst, "g", 1));
    assert_eq!(t.inode(src).nchildren, 0);
    assert_eq!(t.inode(dst).nchildren, 1);
    t.check();

    // Renaming onto another link of the same inode changes nothing.
    t.fs.link(f, dst, "h").unwrap();
    let image = t.catalog_image();
    t.fs.rename(dst, "g", dst, "h", 0).unwrap();
    assert_eq!(t.catalog_image(), image);
    t.check();
}

#[test]
fn orphans_live_until_evicted() {
    let t = Test::new();
    let o = t.create(ROOT, "o");
    t.fs.unlink(ROOT, "o").unwrap();

    let inode = t.inode(o);
    assert_eq!(inode.nlink, 0);
    assert_eq!(inode.parent_id, PRIV_DIR_INO);
    assert_eq!(inode.name, orphan_name(o));
    assert_eq!(t.lookup(PRIV_DIR_INO, &orphan_name(o)), Some(o));
    assert_eq!(t.inode(PRIV_DIR_INO).nchildren, 1);
    assert!(matches!(t.fs.link(o, ROOT, "back"), Err(Error::NotFound)));
    assert_eq!(t.check().orphans, 1);

    t.fs.evict_inode(o).unwrap();
    assert!(matches!(t.fs.stat(o), Err(Error::NotFound)));
    assert_eq!(t.inode(PRIV_DIR_INO).nchildren, 0);
    let report = t.check();
    assert_eq!((report.orphans, report.inodes), (0, 2));
}

#[test]
fn case_insensitive_lookups() {
    let dev = MemDevice::new(4096, BLOCKS);
    let mut params = FormatParams::new();
    params.case_insensitive(true);
    let fs = Container::format(Box::new(dev), &params, &Options::new()).unwrap();
    let t = Test {
        fs: Filesystem::from(fs),
    };

    let cnid = t.create(ROOT, "ReadMe");
    assert_eq!(t.lookup(ROOT, "README"), Some(cnid));
    assert_eq!(t.lookup(ROOT, "readme"), Some(cnid));
    assert!(matches!(
        t.fs.create(ROOT, "readme", S_IFREG, 0),
        Err(Error::Exists)
    ));
    assert_eq!(t.root_names(), ["ReadMe"]);
    t.fs.unlink(ROOT, "README").unwrap();
    assert_eq!(t.lookup(ROOT, "ReadMe"), None);
    t.check();
}
