//! Concrete acceptance scenarios, run against both map variants.

use logitree_map::{AvlMap, BstMap};

#[test]
fn s1_singleton_bst() {
    let map: BstMap<i32> = BstMap::new();
    assert_eq!(map.insert(5, 1).unwrap(), true);
    assert_eq!(map.lookup(5).unwrap(), true);
    assert_eq!(map.lookup(4).unwrap(), false);
    assert_eq!(map.delete(5).unwrap(), true);
    assert_eq!(map.delete(5).unwrap(), false);
    assert_eq!(map.lookup(5).unwrap(), false);
    assert!(map.validate());
}

#[test]
fn s1_singleton_avl() {
    let map: AvlMap<i32> = AvlMap::new();
    assert_eq!(map.insert(5, 1).unwrap(), true);
    assert_eq!(map.lookup(5).unwrap(), true);
    assert_eq!(map.lookup(4).unwrap(), false);
    assert_eq!(map.delete(5).unwrap(), true);
    assert_eq!(map.delete(5).unwrap(), false);
    assert_eq!(map.lookup(5).unwrap(), false);
    assert!(map.validate());
}

#[test]
fn s2_ordered_fill_bst() {
    let map: BstMap<i32> = BstMap::new();
    for k in 1..=7 {
        map.insert(k, k).unwrap();
    }
    let keys: Vec<i32> = (1..=7)
        .filter(|&k| map.lookup(k).unwrap())
        .collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 7]);
    assert!(map.validate());
}

#[test]
fn s2_ordered_fill_avl() {
    let map: AvlMap<i32> = AvlMap::new();
    for k in 1..=7 {
        map.insert(k, k).unwrap();
    }
    let report = map.validate_report();
    assert!(report.is_valid());
    let keys: Vec<i32> = (1..=7)
        .filter(|&k| map.lookup(k).unwrap())
        .collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn s3_reverse_fill_avl() {
    let map: AvlMap<i32> = AvlMap::new();
    for k in (1..=7).rev() {
        map.insert(k, k).unwrap();
    }
    let report = map.validate_report();
    assert!(report.is_valid());
    // a balanced 7-node AVL tree has height 3 (max_path_len counts edges
    // from the logical root, 0-indexed, so the deepest leaf is at depth 2).
    assert!(report.max_path_len <= 2);
    let keys: Vec<i32> = (1..=7)
        .filter(|&k| map.lookup(k).unwrap())
        .collect();
    assert_eq!(keys, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn s4_two_child_delete_bst() {
    let map: BstMap<i32> = BstMap::new();
    for k in [5, 3, 8, 1, 4, 7, 9] {
        map.insert(k, k).unwrap();
    }
    assert_eq!(map.delete(5).unwrap(), true);
    let keys: Vec<i32> = [1, 3, 4, 5, 7, 8, 9]
        .into_iter()
        .filter(|&k| map.lookup(k).unwrap())
        .collect();
    assert_eq!(keys, vec![1, 3, 4, 7, 8, 9]);
    assert!(map.validate());
}

#[test]
fn s4_two_child_delete_avl() {
    let map: AvlMap<i32> = AvlMap::new();
    for k in [5, 3, 8, 1, 4, 7, 9] {
        map.insert(k, k).unwrap();
    }
    assert_eq!(map.delete(5).unwrap(), true);
    let keys: Vec<i32> = [1, 3, 4, 5, 7, 8, 9]
        .into_iter()
        .filter(|&k| map.lookup(k).unwrap())
        .collect();
    assert_eq!(keys, vec![1, 3, 4, 7, 8, 9]);
    assert!(map.validate());
}

#[test]
fn s5_concurrent_churn_bst() {
    use std::sync::Arc;
    use std::thread;

    let map: Arc<BstMap<i32>> = Arc::new(BstMap::new());
    let mut handles = Vec::new();
    for t in 0..8 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..2_000 {
                let key = ((t * 2_000 + i) % 1_000) + 1;
                if i % 2 == 0 {
                    let _ = map.insert(key, key);
                } else {
                    let _ = map.delete(key);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(map.validate());
}

#[test]
fn s5_concurrent_churn_avl() {
    use std::sync::Arc;
    use std::thread;

    let map: Arc<AvlMap<i32>> = Arc::new(AvlMap::new());
    let mut handles = Vec::new();
    for t in 0..8 {
        let map = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..2_000 {
                let key = ((t * 2_000 + i) % 1_000) + 1;
                if i % 2 == 0 {
                    let _ = map.insert(key, key);
                } else {
                    let _ = map.delete(key);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(map.validate());
}

#[test]
fn s6_lookup_under_churn_avl() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    let map: Arc<AvlMap<i32>> = Arc::new(AvlMap::new());
    for k in (0..1_000).step_by(2) {
        map.insert(k, k).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..4 {
        let map = Arc::clone(&map);
        let stop = Arc::clone(&stop);
        writers.push(thread::spawn(move || {
            let mut key: i32 = 1;
            while !stop.load(Ordering::Relaxed) {
                let _ = map.insert(key, key);
                let _ = map.delete(key);
                key = (key + 2) % 1_000;
            }
        }));
    }

    for _ in 0..2_000 {
        for k in (0..1_000).step_by(2) {
            assert!(map.lookup(k).unwrap());
        }
    }

    stop.store(true, Ordering::Relaxed);
    for w in writers {
        w.join().unwrap();
    }
}
