use std::sync::Arc;
use std::time::Duration;

use bson::doc;

use crate::collinfo::{CollinfoCache, CollinfoLookup};

#[test]
fn first_caller_owns_the_fetch() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    // Re-asking as the same context is still ownership.
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    // A second context observes the pending owner.
    match cache.get_or_create("db.coll", 2) {
        CollinfoLookup::Pending { owner } => assert_eq!(owner, 1),
        _ => panic!("expected pending"),
    }
}

#[test]
fn owner_completion_is_broadcast() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));

    let collinfo = doc! {"name": "coll"};
    cache.add_copy("db.coll", &collinfo, 1);

    match cache.get_or_create("db.coll", 2) {
        CollinfoLookup::Done(doc) => assert_eq!(doc, collinfo),
        _ => panic!("expected done"),
    }
}

#[test]
fn non_owner_add_copy_is_ignored() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));

    cache.add_copy("db.coll", &doc! {"intruder": true}, 2);

    match cache.get_or_create("db.coll", 3) {
        CollinfoLookup::Pending { owner } => assert_eq!(owner, 1),
        _ => panic!("entry must still be pending under ctx 1"),
    }
}

#[test]
fn failure_is_broadcast() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    cache.fail("db.coll", "fetch exploded", 1);
    match cache.get_or_create("db.coll", 2) {
        CollinfoLookup::Failed(msg) => assert_eq!(msg, "fetch exploded"),
        _ => panic!("expected failed"),
    }
}

#[test]
fn remove_by_owner_lets_a_waiter_take_over() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    assert!(matches!(
        cache.get_or_create("db.coll", 2),
        CollinfoLookup::Pending { owner: 1 }
    ));

    cache.remove_by_owner(1);

    // The waiter re-polls and becomes the new owner.
    assert!(matches!(cache.get_or_create("db.coll", 2), CollinfoLookup::Owned));
}

#[test]
fn remove_by_owner_does_not_touch_done_entries() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    cache.add_copy("db.coll", &doc! {"name": "coll"}, 1);
    cache.remove_by_owner(1);
    assert!(matches!(cache.get_or_create("db.coll", 2), CollinfoLookup::Done(_)));
}

#[test]
fn wait_returns_immediately_when_already_resolved() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    cache.add_copy("db.coll", &doc! {}, 1);
    // Must not block: the transition happened before the wait.
    cache.wait("db.coll", Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn wait_returns_for_unknown_namespace() {
    let cache = CollinfoCache::new();
    cache.wait("db.other", Some(Duration::from_secs(5))).unwrap();
}

#[test]
fn wait_times_out_while_pending() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));
    let err = cache
        .wait("db.coll", Some(Duration::from_millis(50)))
        .unwrap_err();
    assert!(matches!(err, crate::error::Error::Cache(_)));
}

#[test]
fn wait_wakes_on_completion_from_another_thread() {
    let cache = Arc::new(CollinfoCache::new());
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));

    let waiter = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || cache.wait("db.coll", Some(Duration::from_secs(10))))
    };

    std::thread::sleep(Duration::from_millis(50));
    cache.add_copy("db.coll", &doc! {"name": "coll"}, 1);

    waiter.join().unwrap().unwrap();
}

#[test]
fn wait_wakes_on_owner_removal() {
    let cache = Arc::new(CollinfoCache::new());
    assert!(matches!(cache.get_or_create("db.coll", 1), CollinfoLookup::Owned));

    let waiter = {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || cache.wait("db.coll", Some(Duration::from_secs(10))))
    };

    std::thread::sleep(Duration::from_millis(50));
    cache.remove_by_owner(1);

    waiter.join().unwrap().unwrap();
}

#[test]
fn namespaces_are_independent() {
    let cache = CollinfoCache::new();
    assert!(matches!(cache.get_or_create("db.a", 1), CollinfoLookup::Owned));
    assert!(matches!(cache.get_or_create("db.b", 2), CollinfoLookup::Owned));
    cache.add_copy("db.a", &doc! {"name": "a"}, 1);
    assert!(matches!(cache.get_or_create("db.b", 3), CollinfoLookup::Pending { owner: 2 }));
}
