use sapwood::db::{CommitMode, Db};
use sapwood::file::StoreConfig;

fn key(tail: u8) -> [u8; 32] {
    let mut k = [0u8; 32];
    k[31] = tail;
    k
}

#[test]
fn test_persistent_trie_simple() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig::builder().build();
    let root_hash = {
        let db = Db::open(dir.path(), &cfg).unwrap();
        let mut wb = db.begin();
        for i in 0..50u8 {
            wb.set(&key(i), &[i; 32]).unwrap();
        }
        wb.commit(CommitMode::ForceFlush).unwrap();
        db.root_hash().unwrap()
    };
    {
        let db = Db::open(dir.path(), &cfg).unwrap();
        assert_eq!(db.root_hash().unwrap(), root_hash);
        for i in 0..50u8 {
            assert_eq!(db.try_get(&key(i)).unwrap(), Some(vec![i; 32]));
        }
        assert_eq!(db.try_get(&key(200)).unwrap(), None);
        // a reopened store treats everything on disk as sealed history
        let mut wb = db.begin();
        wb.set(&key(0), &[0xee; 32]).unwrap();
        wb.commit(CommitMode::ForceFlush).unwrap();
    }
    {
        let db = Db::open(dir.path(), &cfg).unwrap();
        assert_eq!(db.try_get(&key(0)).unwrap(), Some(vec![0xee; 32]));
        assert_eq!(db.try_get(&key(1)).unwrap(), Some(vec![1; 32]));
        assert_ne!(db.root_hash().unwrap(), root_hash);
    }
}

#[test]
fn test_unflushed_commit_is_not_durable() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig::builder().build();
    {
        let db = Db::open(dir.path(), &cfg).unwrap();
        let mut wb = db.begin();
        wb.set(&key(1), b"flushed").unwrap();
        wb.commit(CommitMode::ForceFlush).unwrap();
        // committed but never flushed: the root on disk stays behind
        let mut wb = db.begin();
        wb.set(&key(2), b"memory only").unwrap();
        wb.commit(CommitMode::SealUpdatable).unwrap();
    }
    let db = Db::open(dir.path(), &cfg).unwrap();
    assert_eq!(db.try_get(&key(1)).unwrap(), Some(b"flushed".to_vec()));
    assert_eq!(db.try_get(&key(2)).unwrap(), None);
}

#[test]
fn test_store_is_single_writer() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig::builder().build();
    let _db = Db::open(dir.path(), &cfg).unwrap();
    assert!(Db::open(dir.path(), &cfg).is_err());
}

#[test]
fn test_root_only_commit_keeps_frontier_open() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = StoreConfig::builder().build();
    let db = Db::open(dir.path(), &cfg).unwrap();
    let mut wb = db.begin();
    wb.set(&key(1), &[0x11; 32]).unwrap();
    wb.commit(CommitMode::RootOnly).unwrap();
    // the next batch may still rewrite those nodes in place
    let mut wb = db.begin();
    wb.set(&key(1), &[0x22; 32]).unwrap();
    wb.commit(CommitMode::ForceFlush).unwrap();
    assert_eq!(db.try_get(&key(1)).unwrap(), Some(vec![0x22; 32]));
}
