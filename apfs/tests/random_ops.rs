//! Random sequences of directory operations checked against a simple in-memory model.

mod common;

use std::collections::{BTreeMap, BTreeSet};

use apfs::ROOT_DIR_INO;
use apfs_core::records::S_IFREG;
use common::{random_name, Test};
use lazy_static::lazy_static;
use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};
use rand::SeedableRng;

const MAX_TESTS: u64 = 40;
const AVG_OPS: usize = 60;
const NAME_POOL: usize = 8;

// Required to increase reproducibility
lazy_static! {
    static ref SEED: [u8; 16] = {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("no time?")
            .as_nanos()
            .to_le_bytes()[0..16]
            .try_into()
            .unwrap()
    };
    // A small pool, so that operations keep running into each other's names.
    static ref NAMES: Vec<String> = {
        let mut rng = rand_pcg::Lcg64Xsh32::from_seed(*SEED);
        let mut names = BTreeSet::new();
        while names.len() < NAME_POOL {
            names.insert(random_name(&mut rng, 12));
        }
        names.into_iter().collect()
    };
}

fn name(i: u8) -> &'static str {
    &NAMES[i as usize % NAMES.len()]
}

#[derive(Debug, Clone)]
enum Op {
    Create { dir: u8, name: u8 },
    Mkdir { dir: u8, name: u8 },
    Link { file: u8, dir: u8, name: u8 },
    Unlink { dir: u8, name: u8 },
    Rmdir { dir: u8, name: u8 },
    Rename {
        from_dir: u8,
        from_name: u8,
        to_dir: u8,
        to_name: u8,
        noreplace: bool,
    },
    Evict { orphan: u8 },
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        fn pick(g: &mut Gen) -> u8 {
            u8::arbitrary(g)
        }
        match pick(g) % 16 {
            0..=3 => Op::Create {
                dir: pick(g),
                name: pick(g),
            },
            4..=5 => Op::Mkdir {
                dir: pick(g),
                name: pick(g),
            },
            6..=7 => Op::Link {
                file: pick(g),
                dir: pick(g),
                name: pick(g),
            },
            8..=9 => Op::Unlink {
                dir: pick(g),
                name: pick(g),
            },
            10 => Op::Rmdir {
                dir: pick(g),
                name: pick(g),
            },
            11..=14 => Op::Rename {
                from_dir: pick(g),
                from_name: pick(g),
                to_dir: pick(g),
                to_name: pick(g),
                noreplace: bool::arbitrary(g),
            },
            _ => Op::Evict { orphan: pick(g) },
        }
    }
}

/// What the directory tree should look like.
struct Model {
    /// Entries of every reachable directory.
    dirs: BTreeMap<u64, BTreeMap<String, u64>>,
    parents: BTreeMap<u64, u64>,
    /// Link counts of regular files, orphans included.
    files: BTreeMap<u64, u32>,
    /// Inodes without links that were not evicted yet.
    orphans: BTreeSet<u64>,
}

impl Model {
    fn new() -> Self {
        Model {
            dirs: [(ROOT_DIR_INO, BTreeMap::new())].into(),
            parents: BTreeMap::new(),
            files: BTreeMap::new(),
            orphans: BTreeSet::new(),
        }
    }

    fn dir(&self, i: u8) -> u64 {
        let dirs: Vec<u64> = self.dirs.keys().copied().collect();
        dirs[i as usize % dirs.len()]
    }

    fn linked_file(&self, i: u8) -> Option<u64> {
        let files: Vec<u64> = self
            .files
            .iter()
            .filter(|(_, nlink)| **nlink > 0)
            .map(|(cnid, _)| *cnid)
            .collect();
        (!files.is_empty()).then(|| files[i as usize % files.len()])
    }

    fn entry(&self, dir: u64, name: &str) -> Option<u64> {
        self.dirs[&dir].get(name).copied()
    }

    fn is_dir(&self, cnid: u64) -> bool {
        self.dirs.contains_key(&cnid)
    }

    fn is_ancestor(&self, ancestor: u64, mut dir: u64) -> bool {
        loop {
            if dir == ancestor {
                return true;
            }
            match self.parents.get(&dir) {
                Some(parent) => dir = *parent,
                None => return false,
            }
        }
    }

    fn add(&mut self, dir: u64, name: &str, cnid: u64) {
        self.dirs.get_mut(&dir).unwrap().insert(name.to_owned(), cnid);
        if self.is_dir(cnid) {
            self.parents.insert(cnid, dir);
        }
    }

    /// Drops the entry `name` of `dir` and whatever it kept alive.
    fn remove(&mut self, dir: u64, name: &str) {
        let cnid = self.dirs.get_mut(&dir).unwrap().remove(name).unwrap();
        if self.is_dir(cnid) {
            self.dirs.remove(&cnid);
            self.parents.remove(&cnid);
            self.orphans.insert(cnid);
            return;
        }
        let nlink = self.files.get_mut(&cnid).unwrap();
        *nlink -= 1;
        if *nlink == 0 {
            self.orphans.insert(cnid);
        }
    }

    fn rename_allowed(&self, from_dir: u64, from: &str, to_dir: u64, to: &str, noreplace: bool) -> bool {
        let Some(source) = self.entry(from_dir, from) else {
            return false;
        };
        if let Some(target) = self.entry(to_dir, to) {
            if noreplace {
                return false;
            }
            if target == source {
                return true;
            }
            match (self.is_dir(source), self.is_dir(target)) {
                (true, false) | (false, true) => return false,
                (true, true) if !self.dirs[&target].is_empty() => return false,
                _ => {}
            }
        }
        !(self.is_dir(source) && self.is_ancestor(source, to_dir))
    }
}

fn apply(t: &Test, model: &mut Model, op: &Op) {
    match *op {
        Op::Create { dir, name: n } => {
            let (dir, name) = (model.dir(dir), name(n));
            let result = t.fs.create(dir, name, S_IFREG | 0o644, 0);
            assert_eq!(result.is_ok(), model.entry(dir, name).is_none(), "{op:?}: {result:?}");
            if let Ok(cnid) = result {
                model.files.insert(cnid, 1);
                model.add(dir, name, cnid);
            }
        }
        Op::Mkdir { dir, name: n } => {
            let (dir, name) = (model.dir(dir), name(n));
            let result = t.fs.mkdir(dir, name, 0o755);
            assert_eq!(result.is_ok(), model.entry(dir, name).is_none(), "{op:?}: {result:?}");
            if let Ok(cnid) = result {
                model.dirs.insert(cnid, BTreeMap::new());
                model.add(dir, name, cnid);
            }
        }
        Op::Link { file, dir, name: n } => {
            let Some(file) = model.linked_file(file) else {
                return;
            };
            let (dir, name) = (model.dir(dir), name(n));
            let result = t.fs.link(file, dir, name);
            assert_eq!(result.is_ok(), model.entry(dir, name).is_none(), "{op:?}: {result:?}");
            if result.is_ok() {
                *model.files.get_mut(&file).unwrap() += 1;
                model.add(dir, name, file);
            }
        }
        Op::Unlink { dir, name: n } => {
            let (dir, name) = (model.dir(dir), name(n));
            let allowed = model.entry(dir, name).is_some_and(|cnid| !model.is_dir(cnid));
            let result = t.fs.unlink(dir, name);
            assert_eq!(result.is_ok(), allowed, "{op:?}: {result:?}");
            if allowed {
                model.remove(dir, name);
            }
        }
        Op::Rmdir { dir, name: n } => {
            let (dir, name) = (model.dir(dir), name(n));
            let allowed = model
                .entry(dir, name)
                .is_some_and(|cnid| model.dirs.get(&cnid).is_some_and(|e| e.is_empty()));
            let result = t.fs.rmdir(dir, name);
            assert_eq!(result.is_ok(), allowed, "{op:?}: {result:?}");
            if allowed {
                model.remove(dir, name);
            }
        }
        Op::Rename {
            from_dir,
            from_name,
            to_dir,
            to_name,
            noreplace,
        } => {
            let (from_dir, from) = (model.dir(from_dir), name(from_name));
            let (to_dir, to) = (model.dir(to_dir), name(to_name));
            let allowed = model.rename_allowed(from_dir, from, to_dir, to, noreplace);
            let flags = if noreplace { apfs::RENAME_NOREPLACE } else { 0 };
            let result = t.fs.rename(from_dir, from, to_dir, to, flags);
            assert_eq!(result.is_ok(), allowed, "{op:?}: {result:?}");
            if !allowed {
                return;
            }
            let source = model.entry(from_dir, from).unwrap();
            if model.entry(to_dir, to) == Some(source) {
                return;
            }
            if model.entry(to_dir, to).is_some() {
                model.remove(to_dir, to);
            }
            let moved = model.dirs.get_mut(&from_dir).unwrap().remove(from).unwrap();
            model.add(to_dir, to, moved);
        }
        Op::Evict { orphan } => {
            let orphans: Vec<u64> = model.orphans.iter().copied().collect();
            if orphans.is_empty() {
                return;
            }
            let cnid = orphans[orphan as usize % orphans.len()];
            t.fs.evict_inode(cnid).unwrap();
            model.orphans.remove(&cnid);
            model.files.remove(&cnid);
        }
    }
}

fn assert_matches(t: &Test, model: &Model) {
    for (dir, entries) in &model.dirs {
        let names: Vec<&String> = entries.keys().collect();
        assert_eq!(t.names(*dir).iter().collect::<Vec<_>>(), names, "entries of 0x{dir:x}");
        assert_eq!(t.inode(*dir).nchildren as usize, entries.len());
        for (name, cnid) in entries {
            assert_eq!(t.lookup(*dir, name), Some(*cnid));
        }
    }
    for (cnid, nlink) in &model.files {
        assert_eq!(t.inode(*cnid).nlink, *nlink, "link count of 0x{cnid:x}");
    }
}

fn random_ops_inner(ops: Vec<Op>) -> TestResult {
    let t = Test::new();
    let mut model = Model::new();
    for op in &ops {
        apply(&t, &mut model, op);
        assert_matches(&t, &model);
    }

    let report = t.check();
    let orphan_dirs = model
        .orphans
        .iter()
        .filter(|cnid| !model.files.contains_key(*cnid))
        .count();
    assert_eq!(report.orphans, model.orphans.len() as u64);
    assert_eq!(
        report.inodes,
        (1 + model.dirs.len() + model.files.len() + orphan_dirs) as u64
    );
    TestResult::passed()
}

#[test]
fn random_ops() {
    let test_result = std::panic::catch_unwind(|| {
        QuickCheck::new()
            .rng(Gen::new(AVG_OPS))
            .max_tests(MAX_TESTS)
            .quickcheck(random_ops_inner as fn(_) -> TestResult)
    });

    if let Err(cause) = test_result {
        eprintln!("random_ops failed with seed: {:?}", *SEED);
        std::panic::resume_unwind(cause);
    }
}
