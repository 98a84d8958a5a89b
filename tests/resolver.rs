use std::cell::Cell;
use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use sql_capability::{
    ensure_capability, is_bound, CapabilityRef, CapabilityResolver, ModuleError, ModuleRegistry,
    Namespace, SqlEngine, SQL_CAPABILITY, SQL_MODULE,
};

#[derive(Debug, PartialEq)]
struct FakeEngine {
    query: &'static str,
}

fn fake(query: &'static str) -> CapabilityRef {
    Arc::new(FakeEngine { query })
}

fn as_fake(cap: &CapabilityRef) -> &FakeEngine {
    cap.downcast_ref::<FakeEngine>().expect("bound value is a FakeEngine")
}

#[test]
fn acquires_and_binds_into_empty_namespace() {
    let ns = Namespace::new();
    let calls = Cell::new(0);

    let cap = ensure_capability(&ns, "SQL", || {
        calls.set(calls.get() + 1);
        Ok(Some(fake("select")))
    })
    .unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(as_fake(&cap).query, "select");
    assert!(is_bound(&ns, "SQL"));
    assert_eq!(ns.names(), vec!["SQL".to_string()]);
    assert!(Arc::ptr_eq(&cap, &ns.get("SQL").unwrap()));
}

#[test]
fn bound_capability_is_returned_without_acquiring() {
    let ns = Namespace::new();
    let existing = ns.bind("SQL", fake("existing"));

    let cap = ensure_capability(&ns, "SQL", || -> anyhow::Result<Option<CapabilityRef>> {
        panic!("acquire must not run when the capability is bound")
    })
    .unwrap();

    assert!(Arc::ptr_eq(&cap, &existing));
    assert_eq!(ns.len(), 1);
}

#[test]
fn failed_acquisition_leaves_namespace_empty() {
    let ns = Namespace::new();

    let err = ensure_capability(&ns, "SQL", || Err(anyhow!("ModuleNotFound: rusqlite")))
        .unwrap_err();

    assert_eq!(err.name, "SQL");
    assert!(err.to_string().contains("SQL"));
    assert!(
        err.to_string().contains("Load the SQL capability before using it."),
        "{err}"
    );
    assert!(err.source().unwrap().to_string().contains("ModuleNotFound"));
    assert!(ns.is_empty());
    assert!(!is_bound(&ns, "SQL"));
}

#[test]
fn empty_acquisition_is_a_failure() {
    let ns = Namespace::new();

    let err = ensure_capability(&ns, "SQL", || Ok(None)).unwrap_err();

    assert!(err.to_string().contains("SQL"));
    assert!(err.to_string().contains("before using it"));
    assert!(err.source.is_none());
    assert!(ns.is_empty());
}

#[test]
fn each_unbound_call_acquires_exactly_once() {
    let ns = Namespace::new();
    let calls = Cell::new(0);

    for _ in 0..3 {
        let result = ensure_capability(&ns, "SQL", || {
            calls.set(calls.get() + 1);
            Err(anyhow!("not yet"))
        });
        assert!(result.is_err());
    }
    assert_eq!(calls.get(), 3);

    ensure_capability(&ns, "SQL", || {
        calls.set(calls.get() + 1);
        Ok(Some(fake("late")))
    })
    .unwrap();
    assert_eq!(calls.get(), 4);

    let cap = ensure_capability(&ns, "SQL", || {
        calls.set(calls.get() + 1);
        Ok(Some(fake("never")))
    })
    .unwrap();
    assert_eq!(calls.get(), 4);
    assert_eq!(as_fake(&cap).query, "late");
}

#[test]
fn error_names_the_capability() {
    let ns = Namespace::new();
    for name in ["SQL", "Crypto", "some.module/entry"] {
        let err = ensure_capability(&ns, name, || Ok(None)).unwrap_err();
        assert!(err.to_string().contains(name), "{err} should mention {name}");
    }
}

#[test]
fn empty_name_is_rejected() {
    let ns = Namespace::new();
    let err = ensure_capability(&ns, "", || Ok(Some(fake("x")))).unwrap_err();
    assert!(err.to_string().contains("must not be empty"));
    assert!(ns.is_empty());
}

#[test]
fn bind_never_replaces_an_existing_binding() {
    let ns = Namespace::new();
    let first = ns.bind("SQL", fake("first"));
    let second = ns.bind("SQL", fake("second"));

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(ns.get_as::<FakeEngine>("SQL").unwrap().query, "first");
}

#[test]
fn concurrent_first_callers_share_one_acquisition() {
    let ns = Arc::new(Namespace::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let ns = ns.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                ensure_capability(&ns, "SQL", || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    Ok(Some(fake("shared")))
                })
                .unwrap()
            })
        })
        .collect();

    let caps: Vec<CapabilityRef> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(caps.iter().all(|cap| Arc::ptr_eq(cap, &caps[0])));
}

#[test]
fn acquisition_may_resolve_another_capability() {
    let ns = Arc::new(Namespace::new());
    let (tx, rx) = mpsc::channel();

    let worker = {
        let ns = ns.clone();
        thread::spawn(move || {
            let outer = ensure_capability(&ns, "A", || {
                let inner = ensure_capability(&ns, "B", || Ok(Some(fake("b"))))?;
                Ok(Some(inner))
            });
            let _ = tx.send(outer.map(|cap| as_fake(&cap).query));
        })
    };

    let outcome = rx
        .recv_timeout(Duration::from_secs(3))
        .expect("nested resolution finished");
    assert_eq!(outcome.unwrap(), "b");
    worker.join().unwrap();
    assert_eq!(ns.names(), vec!["A".to_string(), "B".to_string()]);
}

#[test]
fn slow_acquisition_does_not_block_other_names() {
    let ns = Arc::new(Namespace::new());
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let slow = {
        let ns = ns.clone();
        thread::spawn(move || {
            ensure_capability(&ns, "Slow", || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(Some(fake("slow")))
            })
            .unwrap();
        })
    };

    started_rx.recv().unwrap();
    // "Slow" is mid-acquisition; "Fast" resolves regardless.
    let fast = ensure_capability(&ns, "Fast", || Ok(Some(fake("fast")))).unwrap();
    assert_eq!(as_fake(&fast).query, "fast");
    assert!(!is_bound(&ns, "Slow"));

    release_tx.send(()).unwrap();
    slow.join().unwrap();
    assert!(is_bound(&ns, "Slow"));
}

#[test]
fn sql_resolver_loads_the_builtin_engine() {
    let ns = Namespace::new();
    let resolver = CapabilityResolver::sql();
    assert_eq!(resolver.name(), SQL_CAPABILITY);
    assert_eq!(resolver.module_id(), SQL_MODULE);

    let engine = SqlEngine::resolve(&ns).unwrap();
    let again = SqlEngine::resolve(&ns).unwrap();

    assert!(Arc::ptr_eq(&engine, &again));
    assert!(is_bound(&ns, "SQL"));
    assert!(!engine.version().is_empty());
}

#[test]
fn missing_module_reports_the_standard_hint() {
    let ns = Namespace::new();
    let resolver = CapabilityResolver::sql().with_loader(Arc::new(ModuleRegistry::new()));

    let err = resolver.resolve(&ns).unwrap_err();

    assert_eq!(
        err.to_string(),
        "Cannot find global SQL object. Did you load rusqlite?"
    );
    assert!(err.source().unwrap().to_string().contains("rusqlite"));
    assert!(ns.is_empty());
}

#[test]
fn module_of_the_wrong_type_is_not_bound() {
    let ns = Namespace::new();
    let registry = ModuleRegistry::new();
    registry
        .register("fake-sql", || Ok(Arc::new("not an engine") as CapabilityRef))
        .unwrap();
    let resolver = CapabilityResolver::new("SQL", "fake-sql", Arc::new(registry));

    let err = resolver.resolve_as::<SqlEngine>(&ns).unwrap_err();

    assert!(err.to_string().contains("SQL"));
    assert!(ns.is_empty());
}

#[test]
fn binding_of_the_wrong_type_is_reported_and_kept() {
    let ns = Namespace::new();
    ns.bind("SQL", Arc::new(42u32));

    let err = SqlEngine::resolve(&ns).unwrap_err();

    assert!(err.to_string().contains("incompatible type"));
    let kept = ns.get("SQL").unwrap();
    assert_eq!(kept.downcast_ref::<u32>(), Some(&42));
}

#[test]
fn registry_refuses_duplicate_module_ids() {
    let registry = ModuleRegistry::with_builtins();
    assert!(registry.contains(SQL_MODULE));

    let err = registry
        .register(SQL_MODULE, || Ok(Arc::new(()) as CapabilityRef))
        .unwrap_err();
    assert_eq!(err, ModuleError::AlreadyRegistered(SQL_MODULE.to_string()));
}

#[test]
fn global_namespace_is_shared() {
    let a = Namespace::global();
    let b = Namespace::global();
    assert!(std::ptr::eq(a, b));

    let engine = SqlEngine::resolve(Namespace::global()).unwrap();
    let bound = Namespace::global().get_as::<SqlEngine>(SQL_CAPABILITY).unwrap();
    assert!(Arc::ptr_eq(&engine, &bound));
}
