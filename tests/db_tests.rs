use atoll::{AtollError, Config, Db, SetOptions};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

#[test]
fn test_set_get_delete_round_trip() {
    let db = Db::memory().unwrap();

    db.update(|tx| {
        let (prev, replaced) = tx.set("fruit", "apple", None)?;
        assert!(prev.is_none());
        assert!(!replaced);

        let (prev, replaced) = tx.set("fruit", "banana", None)?;
        assert_eq!(prev.unwrap().as_ref(), b"apple");
        assert!(replaced);
        Ok(())
    })
    .unwrap();

    let value = db.view(|tx| tx.get("fruit", false)).unwrap();
    assert_eq!(value.as_ref(), b"banana");

    let deleted = db.update(|tx| tx.delete("fruit")).unwrap();
    assert_eq!(deleted.as_ref(), b"banana");

    let err = db.view(|tx| tx.get("fruit", false)).unwrap_err();
    assert!(matches!(err, AtollError::NotFound));
}

#[test]
fn test_update_error_rolls_back() {
    let db = Db::memory().unwrap();

    let err = db
        .update(|tx| {
            tx.set("a", "1", None)?;
            tx.set("b", "2", None)?;
            Err::<(), _>(AtollError::InvalidOperation)
        })
        .unwrap_err();
    assert!(matches!(err, AtollError::InvalidOperation));

    db.view(|tx| {
        assert!(matches!(tx.get("a", false), Err(AtollError::NotFound)));
        assert!(matches!(tx.get("b", false), Err(AtollError::NotFound)));
        assert_eq!(tx.len()?, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_rollback_restores_prior_values() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("k", "original", None)?;
        Ok(())
    })
    .unwrap();

    let _ = db.update(|tx| {
        tx.set("k", "mutated", None)?;
        tx.delete("k")?;
        tx.set("k", "mutated again", None)?;
        Err::<(), _>(AtollError::InvalidOperation)
    });

    let value = db.view(|tx| tx.get("k", false)).unwrap();
    assert_eq!(value.as_ref(), b"original");
}

#[test]
fn test_panic_in_update_rolls_back() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("stable", "yes", None)?;
        Ok(())
    })
    .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _ = db.update(|tx| -> atoll::Result<()> {
            tx.set("stable", "clobbered", None)?;
            tx.set("junk", "junk", None)?;
            panic!("user callback exploded");
        });
    }));
    assert!(result.is_err());

    db.view(|tx| {
        assert_eq!(tx.get("stable", false)?.as_ref(), b"yes");
        assert!(matches!(tx.get("junk", false), Err(AtollError::NotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_read_tx_cannot_write() {
    let db = Db::memory().unwrap();
    let err = db.view(|tx| tx.set("k", "v", None)).unwrap_err();
    assert!(matches!(err, AtollError::TxNotWritable));

    let err = db.view(|tx| tx.delete("k")).unwrap_err();
    assert!(matches!(err, AtollError::TxNotWritable));
}

#[test]
fn test_mutation_during_iteration_fails() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("a", "1", None)?;
        tx.set("b", "2", None)?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let mut seen = 0;
        let mut inner_err = None;
        tx.ascend("", |_, _| {
            seen += 1;
            if let Err(err) = tx.set("c", "3", None) {
                inner_err = Some(err);
            }
            true
        })?;
        assert_eq!(seen, 2);
        assert!(matches!(inner_err, Some(AtollError::TxIterating)));

        // reads stay legal mid-iteration
        tx.ascend("", |_, _| {
            assert!(tx.get("a", false).is_ok());
            true
        })?;

        // and mutation works again once iteration is over
        tx.set("c", "3", None)?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_explicit_begin_commit_rollback() {
    let db = Db::memory().unwrap();

    let tx = db.begin(true).unwrap();
    tx.set("k", "v", None).unwrap();
    tx.commit().unwrap();

    let tx = db.begin(true).unwrap();
    tx.set("k", "other", None).unwrap();
    tx.rollback().unwrap();

    let tx = db.begin(false).unwrap();
    assert_eq!(tx.get("k", false).unwrap().as_ref(), b"v");
    drop(tx);

    // an abandoned write transaction rolls back on drop
    {
        let tx = db.begin(true).unwrap();
        tx.set("k", "dropped", None).unwrap();
    }
    let value = db.view(|tx| tx.get("k", false)).unwrap();
    assert_eq!(value.as_ref(), b"v");
}

#[test]
fn test_commit_on_read_tx_fails() {
    let db = Db::memory().unwrap();
    let tx = db.begin(false).unwrap();
    assert!(matches!(tx.commit(), Err(AtollError::TxNotWritable)));
}

#[test]
fn test_ttl_reporting() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("forever", "v", None)?;
        tx.set(
            "fleeting",
            "v",
            Some(SetOptions::with_ttl(Duration::from_secs(60))),
        )?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert_eq!(tx.ttl("forever")?, None);
        let remaining = tx.ttl("fleeting")?.unwrap();
        assert!(remaining > Duration::from_secs(59));
        assert!(matches!(tx.ttl("missing"), Err(AtollError::NotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_zero_ttl_expires_immediately() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("x", "y", Some(SetOptions::with_ttl(Duration::ZERO)))?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        assert!(matches!(tx.get("x", false), Err(AtollError::NotFound)));
        // the raw item is still visible until the sweeper runs
        assert_eq!(tx.get("x", true)?.as_ref(), b"y");
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_background_sweeper_removes_expired() {
    let config = Config::default().with_expiration_tick(Duration::from_millis(20));
    let db = Db::memory_with_config(config).unwrap();

    db.update(|tx| {
        tx.set(
            "x",
            "y",
            Some(SetOptions::with_ttl(Duration::from_millis(50))),
        )?;
        tx.set("keeper", "v", None)?;
        Ok(())
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    db.view(|tx| {
        // gone entirely, even ignoring expiry: the sweeper deleted it
        assert!(matches!(tx.get("x", true), Err(AtollError::NotFound)));
        assert_eq!(tx.get("keeper", false)?.as_ref(), b"v");
        assert_eq!(tx.len()?, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_on_expired_hook_defers_deletion() {
    let fired = Arc::new(AtomicBool::new(false));
    let fired_clone = fired.clone();
    let config = Config::default()
        .with_expiration_tick(Duration::from_millis(20))
        .with_on_expired(Arc::new(move |keys| {
            assert!(keys.iter().any(|k| k.as_ref() == b"x"));
            fired_clone.store(true, Ordering::SeqCst);
        }));
    let db = Db::memory_with_config(config).unwrap();

    db.update(|tx| {
        tx.set("x", "y", Some(SetOptions::with_ttl(Duration::from_millis(30))))?;
        Ok(())
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(150));
    assert!(fired.load(Ordering::SeqCst));

    // deletion was deferred to the hook, so the item is still there
    let value = db.view(|tx| tx.get("x", true)).unwrap();
    assert_eq!(value.as_ref(), b"y");
}

#[test]
fn test_on_expired_sync_hook_runs_in_tx() {
    let config = Config::default()
        .with_expiration_tick(Duration::from_millis(20))
        .with_on_expired_sync(Arc::new(|key, _value, tx| {
            // replace instead of delete
            tx.set(key, "expired marker", None)?;
            Ok(())
        }));
    let db = Db::memory_with_config(config).unwrap();

    db.update(|tx| {
        tx.set("x", "y", Some(SetOptions::with_ttl(Duration::from_millis(30))))?;
        Ok(())
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(150));

    let value = db.view(|tx| tx.get("x", false)).unwrap();
    assert_eq!(value.as_ref(), b"expired marker");
}

#[test]
fn test_injected_clock_controls_expiry() {
    let now = SystemTime::now();
    let config = Config::default().with_time_source(Arc::new(move || now));
    let db = Db::memory_with_config(config).unwrap();

    db.update(|tx| {
        tx.set(
            "k",
            "v",
            Some(SetOptions::with_ttl(Duration::from_millis(10))),
        )?;
        Ok(())
    })
    .unwrap();

    // wall time marches on, the injected clock does not
    std::thread::sleep(Duration::from_millis(50));
    let value = db.view(|tx| tx.get("k", false)).unwrap();
    assert_eq!(value.as_ref(), b"v");
}

#[test]
fn test_delete_all() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("a", "1", None)?;
        tx.set("b", "2", Some(SetOptions::with_ttl(Duration::from_secs(60))))?;
        tx.create_index("vals", "*", vec![atoll::index_binary()])?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| tx.delete_all()).unwrap();

    db.view(|tx| {
        assert_eq!(tx.len()?, 0);
        // indexes stay registered, just empty
        assert_eq!(tx.indexes()?, vec!["vals".to_string()]);
        let mut count = 0;
        tx.ascend("vals", |_, _| {
            count += 1;
            true
        })?;
        assert_eq!(count, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_delete_all_rollback() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("a", "1", None)?;
        tx.set("b", "2", None)?;
        Ok(())
    })
    .unwrap();

    let _ = db.update(|tx| {
        tx.delete_all()?;
        tx.set("c", "3", None)?;
        Err::<(), _>(AtollError::InvalidOperation)
    });

    db.view(|tx| {
        assert_eq!(tx.len()?, 2);
        assert_eq!(tx.get("a", false)?.as_ref(), b"1");
        assert_eq!(tx.get("b", false)?.as_ref(), b"2");
        assert!(matches!(tx.get("c", false), Err(AtollError::NotFound)));
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_concurrent_readers() {
    let db = Arc::new(Db::memory().unwrap());
    db.update(|tx| {
        for i in 0..100 {
            tx.set(format!("key:{i:03}"), format!("value {i}"), None)?;
        }
        Ok(())
    })
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..50 {
                let count = db
                    .view(|tx| {
                        let mut n = 0;
                        tx.ascend("", |_, _| {
                            n += 1;
                            true
                        })?;
                        Ok(n)
                    })
                    .unwrap();
                assert_eq!(count, 100);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_close_rejects_operations() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("k", "v", None)?;
        Ok(())
    })
    .unwrap();

    db.close().unwrap();
    assert!(matches!(db.begin(false), Err(AtollError::DatabaseClosed)));
    assert!(matches!(
        db.view(|tx| tx.get("k", false)),
        Err(AtollError::DatabaseClosed)
    ));
    assert!(matches!(db.close(), Err(AtollError::DatabaseClosed)));
}

#[test]
fn test_replaced_expired_item_reports_not_replaced() {
    let db = Db::memory().unwrap();
    db.update(|tx| {
        tx.set("k", "old", Some(SetOptions::with_ttl(Duration::ZERO)))?;
        Ok(())
    })
    .unwrap();

    db.update(|tx| {
        let (prev, replaced) = tx.set("k", "new", None)?;
        assert!(prev.is_none());
        assert!(!replaced);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_set_config_round_trip() {
    let db = Db::memory().unwrap();
    let mut config = db.read_config().unwrap();
    config.auto_shrink_disabled = true;
    db.set_config(config).unwrap();
    assert!(db.read_config().unwrap().auto_shrink_disabled);
}
