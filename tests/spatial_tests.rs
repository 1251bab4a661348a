use atoll::{AtollError, Db, index_binary, index_rect};

fn spatial_db() -> Db {
    let db = Db::memory().unwrap();
    db.create_spatial_index("rects", "*", index_rect()).unwrap();
    db.update(|tx| {
        tx.set("r1", "[0 0],[10 10]", None)?;
        tx.set("r2", "[20 20],[30 30]", None)?;
        Ok(())
    })
    .unwrap();
    db
}

#[test]
fn test_intersects_finds_overlapping() {
    let db = spatial_db();
    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("rects", "[5 5],[6 6]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["r1"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_intersects_boundary_touch_counts() {
    let db = spatial_db();
    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("rects", "[10 10],[15 15]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["r1"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_intersects_point_query() {
    let db = spatial_db();
    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("rects", "[25 25]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["r2"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_nearby_orders_by_box_distance() {
    let db = spatial_db();
    db.view(|tx| {
        let mut order = Vec::new();
        let mut dists = Vec::new();
        tx.nearby("rects", "[0 0],[1 1]", |key, _, dist| {
            order.push(String::from_utf8_lossy(key).into_owned());
            dists.push(dist);
            true
        })?;
        assert_eq!(order, vec!["r1", "r2"]);
        assert_eq!(dists[0], 0.0);
        // r2 is separated by 19 along each axis
        assert_eq!(dists[1], 19.0 * 19.0 + 19.0 * 19.0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_nearby_early_stop() {
    let db = spatial_db();
    db.view(|tx| {
        let mut count = 0;
        tx.nearby("rects", "[0 0]", |_, _, _| {
            count += 1;
            false
        })?;
        assert_eq!(count, 1);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_spatial_updates_follow_items() {
    let db = spatial_db();
    db.update(|tx| {
        tx.set("r1", "[40 40],[50 50]", None)?; // moved away
        tx.delete("r2")?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("rects", "[0 0],[35 35]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert!(hits.is_empty());

        hits.clear();
        tx.intersects("rects", "[45 45]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["r1"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_empty_index_name_is_noop() {
    let db = spatial_db();
    db.view(|tx| {
        let mut count = 0;
        tx.intersects("", "[0 0],[100 100]", |_, _| {
            count += 1;
            true
        })?;
        tx.nearby("", "[0 0]", |_, _, _| {
            count += 1;
            true
        })?;
        assert_eq!(count, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_unknown_index_is_not_found() {
    let db = spatial_db();
    let err = db
        .view(|tx| tx.intersects("nope", "[0 0]", |_, _| true))
        .unwrap_err();
    assert!(matches!(err, AtollError::NotFound));

    let err = db
        .view(|tx| tx.nearby("nope", "[0 0]", |_, _, _| true))
        .unwrap_err();
    assert!(matches!(err, AtollError::NotFound));
}

#[test]
fn test_non_spatial_index_yields_nothing() {
    let db = Db::memory().unwrap();
    db.create_index("vals", "*", vec![index_binary()]).unwrap();
    db.update(|tx| {
        tx.set("k", "[0 0],[10 10]", None)?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut count = 0;
        tx.intersects("vals", "[0 0],[100 100]", |_, _| {
            count += 1;
            true
        })?;
        assert_eq!(count, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_ordered_scan_on_spatial_index_is_empty() {
    let db = spatial_db();
    db.view(|tx| {
        let mut count = 0;
        tx.ascend("rects", |_, _| {
            count += 1;
            true
        })?;
        assert_eq!(count, 0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_unparseable_values_stay_out_of_index() {
    let db = Db::memory().unwrap();
    db.create_spatial_index("rects", "*", index_rect()).unwrap();
    db.update(|tx| {
        tx.set("good", "[1 1],[2 2]", None)?;
        tx.set("bad", "not a rectangle", None)?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("rects", "[0 0],[100 100]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["good"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_spatial_rollback() {
    let db = spatial_db();
    let _ = db.update(|tx| {
        tx.set("r3", "[5 5],[6 6]", None)?;
        tx.delete("r1")?;
        Err::<(), _>(AtollError::InvalidOperation)
    });

    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("rects", "[0 0],[15 15]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["r1"]);
        Ok(())
    })
    .unwrap();
}

#[test]
fn test_three_dimensional_rectangles() {
    let db = Db::memory().unwrap();
    db.create_spatial_index("boxes", "*", index_rect()).unwrap();
    db.update(|tx| {
        tx.set("low", "[0 0 0],[10 10 10]", None)?;
        tx.set("high", "[0 0 100],[10 10 110]", None)?;
        Ok(())
    })
    .unwrap();

    db.view(|tx| {
        let mut hits = Vec::new();
        tx.intersects("boxes", "[5 5 105]", |key, _| {
            hits.push(String::from_utf8_lossy(key).into_owned());
            true
        })?;
        assert_eq!(hits, vec!["high"]);
        Ok(())
    })
    .unwrap();
}
