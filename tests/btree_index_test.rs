use anyhow::Result;
use rand::seq::SliceRandom;
use rand::thread_rng;

use kestreldb::common::types::Rid;
use kestreldb::index::btree::BTreeIndex;

mod common;
use common::create_test_buffer_pool;

fn rid_for(key: i64) -> Rid {
    Rid::new(1, key as u32)
}

#[test]
fn test_empty_tree() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(10)?;
    let tree = BTreeIndex::<i64>::create("empty", bpm, 4, 5)?;

    assert!(tree.is_empty()?);
    assert_eq!(tree.get(&1)?, None);
    assert_eq!(tree.iter()?.count(), 0);
    Ok(())
}

#[test]
fn test_insert_and_get() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(20)?;
    let tree = BTreeIndex::<i64>::create("insert_get", bpm, 4, 5)?;

    for key in [5i64, 3, 8, 1, 9, 2, 7, 4, 6] {
        assert!(tree.insert(key, rid_for(key))?);
    }
    assert!(!tree.is_empty()?);

    for key in 1..=9i64 {
        assert_eq!(tree.get(&key)?, Some(rid_for(key)));
    }
    assert_eq!(tree.get(&0)?, None);
    assert_eq!(tree.get(&10)?, None);
    Ok(())
}

#[test]
fn test_duplicate_insert_keeps_first_value() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(10)?;
    let tree = BTreeIndex::<i64>::create("dupes", bpm, 4, 5)?;

    assert!(tree.insert(42, Rid::new(1, 1))?);
    assert!(!tree.insert(42, Rid::new(2, 2))?);
    assert_eq!(tree.get(&42)?, Some(Rid::new(1, 1)));
    Ok(())
}

#[test]
fn test_remove_round_trip() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(20)?;
    let tree = BTreeIndex::<i64>::create("remove", bpm, 4, 5)?;

    for key in 1..=20i64 {
        tree.insert(key, rid_for(key))?;
    }
    for key in (1..=20i64).filter(|k| k % 3 == 0) {
        tree.remove(&key)?;
    }
    // Removing an absent key is a no-op.
    tree.remove(&100)?;

    for key in 1..=20i64 {
        let expected = if key % 3 == 0 { None } else { Some(rid_for(key)) };
        assert_eq!(tree.get(&key)?, expected);
    }
    Ok(())
}

#[test]
fn test_iterator_ascending_order() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(30)?;
    let tree = BTreeIndex::<i64>::create("iter", bpm, 4, 5)?;

    let mut keys: Vec<i64> = (1..=100).collect();
    keys.shuffle(&mut thread_rng());
    for &key in &keys {
        tree.insert(key, rid_for(key))?;
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (1..=100).collect();
    assert_eq!(scanned, expected);
    Ok(())
}

#[test]
fn test_iter_from_positions_exactly() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(20)?;
    let tree = BTreeIndex::<i64>::create("iter_from", bpm, 4, 5)?;

    for key in (2..=40i64).step_by(2) {
        tree.insert(key, rid_for(key))?;
    }

    let from_ten: Vec<i64> = tree.iter_from(&10)?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (10..=40).step_by(2).collect();
    assert_eq!(from_ten, expected);

    // A key that is not present yields the end iterator, not a lower bound.
    assert_eq!(tree.iter_from(&11)?.count(), 0);
    Ok(())
}

#[test]
fn test_string_keys() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(20)?;
    let tree = BTreeIndex::<String>::create("strings", bpm, 4, 5)?;

    for (i, name) in ["cherry", "apple", "banana", "elder", "date"].iter().enumerate() {
        tree.insert(name.to_string(), Rid::new(1, i as u32))?;
    }

    let scanned: Vec<String> = tree.iter()?.map(|(k, _)| k).collect();
    assert_eq!(scanned, vec!["apple", "banana", "cherry", "date", "elder"]);
    Ok(())
}

#[test]
fn test_random_stress_with_small_nodes() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(50)?;
    let tree = BTreeIndex::<i64>::create("stress", bpm.clone(), 4, 5)?;

    let mut keys: Vec<i64> = (1..=1000).collect();
    keys.shuffle(&mut thread_rng());
    for &key in &keys {
        assert!(tree.insert(key, rid_for(key))?);
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (1..=1000).collect();
    assert_eq!(scanned, expected);

    let mut odds: Vec<i64> = (1..=1000).filter(|k| k % 2 == 1).collect();
    odds.shuffle(&mut thread_rng());
    for &key in &odds {
        tree.remove(&key)?;
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (2..=1000).step_by(2).collect();
    assert_eq!(scanned, expected);

    for key in 1..=1000i64 {
        let expected = if key % 2 == 0 { Some(rid_for(key)) } else { None };
        assert_eq!(tree.get(&key)?, expected);
    }

    // Every guard has been dropped, so nothing is left pinned.
    assert_eq!(bpm.pinned_frame_count(), 0);
    Ok(())
}

#[test]
fn test_remove_everything_empties_the_tree() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(30)?;
    let tree = BTreeIndex::<i64>::create("drain", bpm, 4, 5)?;

    for key in 1..=200i64 {
        tree.insert(key, rid_for(key))?;
    }
    for key in 1..=200i64 {
        tree.remove(&key)?;
    }

    assert!(tree.is_empty()?);
    assert_eq!(tree.iter()?.count(), 0);

    // The tree is still usable after draining.
    tree.insert(7, rid_for(7))?;
    assert_eq!(tree.get(&7)?, Some(rid_for(7)));
    Ok(())
}

#[test]
fn test_concurrent_inserts() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(64)?;
    let tree = std::sync::Arc::new(BTreeIndex::<i64>::create("concurrent", bpm.clone(), 4, 5)?);

    let mut handles = Vec::new();
    for t in 0..4i64 {
        let tree = tree.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..250i64 {
                let key = t * 250 + i + 1;
                assert!(tree.insert(key, rid_for(key)).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let scanned: Vec<i64> = tree.iter()?.map(|(k, _)| k).collect();
    let expected: Vec<i64> = (1..=1000).collect();
    assert_eq!(scanned, expected);
    assert_eq!(bpm.pinned_frame_count(), 0);
    Ok(())
}

#[test]
fn test_concurrent_reads_during_inserts() -> Result<()> {
    let (bpm, _file) = create_test_buffer_pool(64)?;
    let tree = std::sync::Arc::new(BTreeIndex::<i64>::create("mixed", bpm, 8, 8)?);

    for key in (1..=500i64).step_by(2) {
        tree.insert(key, rid_for(key))?;
    }

    let writer = {
        let tree = tree.clone();
        std::thread::spawn(move || {
            for key in (2..=500i64).step_by(2) {
                tree.insert(key, rid_for(key)).unwrap();
            }
        })
    };
    let reader = {
        let tree = tree.clone();
        std::thread::spawn(move || {
            for _ in 0..20 {
                // Pre-seeded odd keys stay visible throughout.
                for key in (1..=499i64).step_by(50) {
                    assert_eq!(tree.get(&key).unwrap(), Some(rid_for(key)));
                }
            }
        })
    };
    writer.join().unwrap();
    reader.join().unwrap();

    assert_eq!(tree.iter()?.count(), 500);
    Ok(())
}
