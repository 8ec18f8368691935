use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use kestreldb::common::types::Rid;
use kestreldb::index::btree::BTreeIndex;
use kestreldb::transaction::concurrency::{
    IndexUndo, IndexWriteRecord, IsolationLevel, LockManager, TransactionManager,
    TransactionState, WriteOp,
};

mod common;
use common::{create_test_buffer_pool, TestTable};

fn setup() -> (Arc<LockManager>, TransactionManager) {
    common::init_logging();
    let lock_manager = Arc::new(LockManager::new(Duration::from_millis(50)));
    let tm = TransactionManager::new(lock_manager.clone());
    (lock_manager, tm)
}

#[test]
fn test_commit_makes_insert_visible() {
    let (lm, tm) = setup();
    let table = TestTable::new(1, &[233, 234]);

    let t1 = tm.begin(IsolationLevel::ReadUncommitted);
    table.insert(&lm, &t1, 1).unwrap();
    tm.commit(&t1);
    assert_eq!(t1.state(), TransactionState::Committed);

    let t2 = tm.begin(IsolationLevel::ReadUncommitted);
    assert_eq!(table.scan(&lm, &t2).unwrap(), vec![1, 233, 234]);
    tm.commit(&t2);
}

#[test]
fn test_abort_rolls_back_insert() {
    let (lm, tm) = setup();
    let table = TestTable::new(1, &[233, 234]);

    let t1 = tm.begin(IsolationLevel::ReadUncommitted);
    table.insert(&lm, &t1, 1).unwrap();
    tm.abort(&t1);
    assert_eq!(t1.state(), TransactionState::Aborted);

    let t2 = tm.begin(IsolationLevel::ReadUncommitted);
    assert_eq!(table.scan(&lm, &t2).unwrap(), vec![233, 234]);
    tm.commit(&t2);
}

#[test]
fn test_abort_rolls_back_delete() {
    let (lm, tm) = setup();
    let table = TestTable::new(1, &[233, 234]);

    let t1 = tm.begin(IsolationLevel::ReadUncommitted);
    let rid = table.find_rid(233).unwrap();
    table.delete(&lm, &t1, rid).unwrap();
    tm.abort(&t1);

    let t2 = tm.begin(IsolationLevel::ReadUncommitted);
    assert_eq!(table.scan(&lm, &t2).unwrap(), vec![233, 234]);
    tm.commit(&t2);
}

#[test]
fn test_abort_undoes_insert_then_delete() {
    let (lm, tm) = setup();
    let table = TestTable::new(1, &[233, 234]);

    let t1 = tm.begin(IsolationLevel::ReadUncommitted);
    let rid = table.insert(&lm, &t1, 1).unwrap();
    table.delete(&lm, &t1, rid).unwrap();
    tm.abort(&t1);

    let t2 = tm.begin(IsolationLevel::ReadUncommitted);
    assert_eq!(table.scan(&lm, &t2).unwrap(), vec![233, 234]);
    tm.commit(&t2);
}

#[test]
fn test_committed_delete_stays_deleted() {
    let (lm, tm) = setup();
    let table = TestTable::new(1, &[233, 234]);

    let t1 = tm.begin(IsolationLevel::ReadCommitted);
    let rid = table.find_rid(233).unwrap();
    table.delete(&lm, &t1, rid).unwrap();
    tm.commit(&t1);

    let t2 = tm.begin(IsolationLevel::ReadCommitted);
    assert_eq!(table.scan(&lm, &t2).unwrap(), vec![234]);
    tm.commit(&t2);
}

#[test]
fn test_abort_undoes_index_writes() -> Result<()> {
    let (_lm, tm) = setup();
    let (bpm, _file) = create_test_buffer_pool(20)?;
    let index = Arc::new(BTreeIndex::<i64>::create("txn_index", bpm, 4, 5)?);

    // Seed two committed entries.
    let t0 = tm.begin(IsolationLevel::RepeatableRead);
    for key in [233i64, 234] {
        let rid = Rid::new(1, key as u32);
        index.insert(key, rid)?;
        t0.append_index_write_record(IndexWriteRecord {
            key: bincode::serialize(&key)?,
            rid,
            op: WriteOp::Insert,
            index: index.clone(),
        });
    }
    tm.commit(&t0);

    // An aborted transaction's index insert and delete both roll back.
    let t1 = tm.begin(IsolationLevel::RepeatableRead);
    let new_rid = Rid::new(1, 1);
    index.insert(1, new_rid)?;
    t1.append_index_write_record(IndexWriteRecord {
        key: bincode::serialize(&1i64)?,
        rid: new_rid,
        op: WriteOp::Insert,
        index: index.clone(),
    });
    let gone_rid = Rid::new(1, 233);
    index.remove(&233)?;
    t1.append_index_write_record(IndexWriteRecord {
        key: bincode::serialize(&233i64)?,
        rid: gone_rid,
        op: WriteOp::Delete,
        index: index.clone(),
    });
    tm.abort(&t1);

    let keys: Vec<i64> = index.iter()?.map(|(k, _)| k).collect();
    assert_eq!(keys, vec![233, 234]);
    Ok(())
}

#[test]
fn test_index_undo_trait_surface() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(20)?;
    let index = BTreeIndex::<i64>::create("undo_surface", bpm, 4, 5)?;

    let key_bytes = bincode::serialize(&5i64)?;
    let rid = Rid::new(2, 5);

    IndexUndo::insert_entry(&index, &key_bytes, rid);
    assert_eq!(index.get(&5)?, Some(rid));
    IndexUndo::delete_entry(&index, &key_bytes, rid);
    assert_eq!(index.get(&5)?, None);
    Ok(())
}

#[test]
fn test_writers_block_readers_until_commit() {
    let (lm, tm) = setup();
    let table = TestTable::new(1, &[233, 234]);

    let writer = tm.begin(IsolationLevel::ReadCommitted);
    table.insert(&lm, &writer, 1).unwrap();

    // A READ_COMMITTED reader blocks on the writer's X row lock.
    let reader_join = {
        let lm = lm.clone();
        let table = table.clone();
        let reader = tm.begin(IsolationLevel::ReadCommitted);
        std::thread::spawn(move || table.scan(&lm, &reader).unwrap())
    };
    std::thread::sleep(Duration::from_millis(50));
    assert!(!reader_join.is_finished());

    tm.commit(&writer);
    assert_eq!(reader_join.join().unwrap(), vec![1, 233, 234]);
}
