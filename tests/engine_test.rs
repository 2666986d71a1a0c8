//! End-to-end engine tests over in-process directory servers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metagate::pool::{AuthzTarget, IdentityKey, Requester, SessionStatus};
use metagate::target::QuarantineStatus;
use metagate::transport::MemoryConnector;
use metagate::{
    Dn, MetaBackend, MetaConfig, MetaError, OperationKind, RoutingRequest, Scope, TargetRegistry,
};

const PEOPLE_GROUPS: &str = r#"
[[targets]]
name = "people"
uris = ["mem://people"]
suffix = "ou=people,dc=x"

[targets.idassert]
authc_dn = "cn=proxy,ou=people,dc=x"
password = "proxypw"

[[targets]]
name = "groups"
uris = ["mem://groups"]
suffix = "ou=groups,dc=x"

[targets.idassert]
authc_dn = "cn=proxy,ou=groups,dc=x"
password = "proxypw"
"#;

const NESTED: &str = r#"
[[targets]]
name = "root"
uris = ["mem://root"]
suffix = "dc=x"

[[targets]]
name = "people"
uris = ["mem://people"]
suffix = "ou=people,dc=x"
"#;

fn dn(s: &str) -> Dn {
    Dn::parse(s).unwrap()
}

fn backend(toml: &str) -> (MetaBackend, Arc<MemoryConnector>) {
    let registry = Arc::new(TargetRegistry::from_config(&MetaConfig::from_toml_str(toml).unwrap()).unwrap());
    let connector = Arc::new(MemoryConnector::new());
    for target in registry.iter() {
        for uri in &target.uris {
            connector.server(uri);
        }
    }
    connector.server("mem://people").add_user("cn=proxy,ou=people,dc=x", "proxypw");
    connector.server("mem://people").add_user("uid=u1,ou=people,dc=x", "secret");
    connector.server("mem://groups").add_user("cn=proxy,ou=groups,dc=x", "proxypw");
    let backend = MetaBackend::new(registry, connector.clone());
    (backend, connector)
}

#[tokio::test]
async fn test_disjoint_suffixes_route_to_owner() {
    let (backend, _) = backend(PEOPLE_GROUPS);
    for kind in [OperationKind::Modify, OperationKind::Delete, OperationKind::Compare] {
        let set = backend
            .select_candidates(&RoutingRequest::new(kind, dn("uid=u1,ou=people,dc=x")))
            .await
            .unwrap();
        assert_eq!(set.candidates(), vec![0]);
    }
}

#[tokio::test]
async fn test_exact_suffix_of_nested_target_resolves_by_probe() {
    let (backend, connector) = backend(NESTED);
    connector.server("mem://people").add_entry("ou=people,dc=x");
    let req = RoutingRequest::new(OperationKind::Modify, dn("ou=people,dc=x"));

    let first = backend.select_candidates(&req).await.unwrap();
    assert_eq!(first.candidates(), vec![1]);
    let probes = connector.server("mem://people").probes() + connector.server("mem://root").probes();
    assert_eq!(probes, 2);

    // same input, same answer, served from the DN cache
    let second = backend.select_candidates(&req).await.unwrap();
    assert_eq!(first, second);
    let again = connector.server("mem://people").probes() + connector.server("mem://root").probes();
    assert_eq!(again, probes);
}

#[tokio::test]
async fn test_forgotten_resolution_is_probed_again() {
    let (backend, connector) = backend(NESTED);
    connector.server("mem://people").add_entry("ou=people,dc=x");
    let req = RoutingRequest::new(OperationKind::Delete, dn("ou=people,dc=x"));

    backend.select_candidates(&req).await.unwrap();
    backend.note_outcome::<()>(
        &req.dn,
        &Err(MetaError::Remote {
            code: metagate::ResultCode::NoSuchObject,
            message: String::new(),
        }),
    );
    backend.select_candidates(&req).await.unwrap();
    assert_eq!(connector.server("mem://people").probes(), 2);
}

#[tokio::test]
async fn test_add_routes_on_parent_and_rename_stays_on_target() {
    let (backend, _) = backend(PEOPLE_GROUPS);

    let add = RoutingRequest::new(OperationKind::Add, dn("cn=admins,ou=groups,dc=x"));
    assert_eq!(backend.select_candidates(&add).await.unwrap().single(), Some(1));

    let cross = RoutingRequest::new(OperationKind::Rename, dn("uid=u1,ou=people,dc=x"))
        .with_new_parent(dn("ou=groups,dc=x"));
    assert_eq!(
        backend.select_candidates(&cross).await.unwrap_err(),
        MetaError::CrossTargetUnsupported
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_connection() {
    let (backend, connector) = backend(PEOPLE_GROUPS);
    let people = connector.server("mem://people");
    people.set_delay(Duration::from_millis(50));

    let requester = Requester::anonymous(1);
    let req = RoutingRequest::new(OperationKind::Compare, dn("uid=u1,ou=people,dc=x"));
    let (a, b) = tokio::join!(backend.prepare(&requester, &req), backend.prepare(&requester, &req));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.lease.id(), b.lease.id());
    assert_eq!(a.lease.refcount(), 2);
    assert_eq!(people.connects(), 1);
    assert_eq!(a.lease.session_status(0), Some(SessionStatus::Anonymous));
}

#[tokio::test]
async fn test_search_fanout_drops_unreachable_target() {
    let (backend, connector) = backend(PEOPLE_GROUPS);
    connector.server("mem://groups").set_down(true);

    let req = RoutingRequest::new(OperationKind::Search { scope: Scope::Sub }, dn("dc=x"));
    let prepared = backend.prepare(&Requester::anonymous(1), &req).await.unwrap();
    assert_eq!(prepared.candidates.candidates(), vec![0, 1]);
    assert_eq!(prepared.targets(), vec![0]);
    assert!(matches!(
        prepared.candidates.slot(1).and_then(|s| s.error.clone()),
        Some(MetaError::ServerDown(_))
    ));

    // nothing reachable: the worst error is reported
    connector.server("mem://people").set_down(true);
    backend.invalidate(&prepared.lease, 0);
    drop(prepared);
    let err = backend.prepare(&Requester::anonymous(1), &req).await.unwrap_err();
    assert!(matches!(err, MetaError::ServerDown(_)));
}

#[tokio::test]
async fn test_stop_on_error_fails_fanout() {
    let (backend, connector) = backend(&format!("on_error = \"stop\"\n{}", PEOPLE_GROUPS));
    connector.server("mem://groups").set_down(true);

    let req = RoutingRequest::new(OperationKind::Search { scope: Scope::Sub }, dn("dc=x"));
    let err = backend.prepare(&Requester::anonymous(1), &req).await.unwrap_err();
    assert!(matches!(err, MetaError::ServerDown(_)));
}

#[tokio::test]
async fn test_transport_failure_is_retried_once_on_new_session() {
    let (backend, connector) = backend(PEOPLE_GROUPS);
    let people = connector.server("mem://people");
    let lease = backend.acquire_pool(&Requester::anonymous(1), false);

    let calls = AtomicUsize::new(0);
    let result = backend
        .with_session(&lease, 0, |_conn| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(MetaError::ServerDown("mem://people".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result, Ok(1));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(people.connects(), 2);
}

#[tokio::test]
async fn test_second_transport_failure_surfaces() {
    let (backend, _) = backend(PEOPLE_GROUPS);
    let lease = backend.acquire_pool(&Requester::anonymous(1), false);

    let calls = AtomicUsize::new(0);
    let result: metagate::Result<()> = backend
        .with_session(&lease, 0, |_conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MetaError::NetworkTimeout("mem://people".into())) }
        })
        .await;

    assert!(matches!(result, Err(MetaError::NetworkTimeout(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_quarantined_retry_reports_original_failure() {
    let toml = PEOPLE_GROUPS.replacen(
        "suffix = \"ou=people,dc=x\"\n",
        "suffix = \"ou=people,dc=x\"\nquarantine = \"10,3;60,+\"\n",
        1,
    );
    let (backend, connector) = backend(&toml);
    let lease = backend.acquire_pool(&Requester::anonymous(1), false);

    let calls = AtomicUsize::new(0);
    let result: metagate::Result<()> = backend
        .with_session(&lease, 0, |_conn| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MetaError::ServerDown("mem://people".into())) }
        })
        .await;

    assert_eq!(result, Err(MetaError::ServerDown("mem://people".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.quarantine().status(0), QuarantineStatus::Quarantined);
    assert_eq!(connector.server("mem://people").connects(), 1);
}

#[tokio::test]
async fn test_explicit_bind() {
    let (backend, _) = backend(PEOPLE_GROUPS);
    let requester = Requester::anonymous(9);

    let wrong = backend.bind(&requester, &dn("uid=u1,ou=people,dc=x"), "nope", false).await;
    assert_eq!(wrong.unwrap_err(), MetaError::InvalidCredentials);

    let nowhere = backend.bind(&requester, &dn("uid=u1,dc=elsewhere"), "secret", false).await;
    assert_eq!(nowhere.unwrap_err(), MetaError::InvalidCredentials);

    let lease = backend
        .bind(&requester, &dn("uid=u1,ou=people,dc=x"), "secret", false)
        .await
        .unwrap();
    assert_eq!(lease.authz_target(), AuthzTarget::Target(0));
    assert_eq!(
        lease.session(0).unwrap().bound_dn().map(Dn::as_str),
        Some("uid=u1,ou=people,dc=x")
    );

    let key = IdentityKey::exclusive(9, dn("uid=u1,ou=people,dc=x"));
    let indexed = backend.pool().lookup(&key).unwrap();
    assert_eq!(indexed.id(), lease.id());
}

#[tokio::test]
async fn test_rebind_replaces_older_entry() {
    let (backend, _) = backend(PEOPLE_GROUPS);
    let requester = Requester::anonymous(3);
    let user = dn("uid=u1,ou=people,dc=x");

    let first = backend.bind(&requester, &user, "secret", false).await.unwrap();
    let first_id = first.id();
    drop(first);

    let second = backend.bind(&requester, &user, "secret", false).await.unwrap();
    assert_ne!(second.id(), first_id);
    let indexed = backend.pool().lookup(&IdentityKey::exclusive(3, user)).unwrap();
    assert_eq!(indexed.id(), second.id());
}

#[tokio::test]
async fn test_root_bind_uses_proxy_identity_everywhere() {
    let (backend, connector) = backend(PEOPLE_GROUPS);
    let lease = backend
        .bind(&Requester::anonymous(4), &dn("cn=manager,dc=x"), "", true)
        .await
        .unwrap();

    assert_eq!(lease.authz_target(), AuthzTarget::All);
    assert_eq!(
        lease.session(1).unwrap().bound_dn().map(Dn::as_str),
        Some("cn=proxy,ou=groups,dc=x")
    );
    assert_eq!(connector.server("mem://people").binds(), 1);
    assert_eq!(connector.server("mem://groups").binds(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failures_then_success_return_to_healthy() {
    for failures in 1..=4u32 {
        let (backend, connector) =
            backend(&PEOPLE_GROUPS.replacen("suffix = \"ou=people,dc=x\"", "suffix = \"ou=people,dc=x\"\nquarantine = \"1,5\"", 1));
        let people = connector.server("mem://people");
        let lease = backend.acquire_pool(&Requester::anonymous(1), false);

        people.set_down(true);
        for _ in 0..failures {
            assert!(backend.ensure_bound(&lease, 0).await.is_err());
            tokio::time::advance(Duration::from_millis(1100)).await;
        }
        assert_ne!(backend.quarantine().status(0), QuarantineStatus::Healthy);

        people.set_down(false);
        backend.ensure_bound(&lease, 0).await.unwrap();
        let state = backend.quarantine().state(0).unwrap();
        assert_eq!(state.status, QuarantineStatus::Healthy);
        assert_eq!(state.block, 0);
        assert_eq!(state.attempts, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_quarantine_schedule_advances_to_long_block() {
    let (backend, connector) =
        backend(&PEOPLE_GROUPS.replacen("suffix = \"ou=people,dc=x\"", "suffix = \"ou=people,dc=x\"\nquarantine = \"10,3;60,+\"", 1));
    let people = connector.server("mem://people");
    people.set_down(true);
    let lease = backend.acquire_pool(&Requester::anonymous(1), false);

    // first failure enters quarantine, three failed retries exhaust the 10s block
    assert!(backend.ensure_bound(&lease, 0).await.is_err());
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(matches!(backend.ensure_bound(&lease, 0).await, Err(MetaError::ServerDown(_))));
    }
    assert_eq!(people.connects(), 4);
    assert_eq!(backend.quarantine().state(0).unwrap().block, 1);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(backend.ensure_bound(&lease, 0).await, Err(MetaError::Quarantined(0)));
    tokio::time::advance(Duration::from_secs(50)).await;
    assert_eq!(backend.ensure_bound(&lease, 0).await, Err(MetaError::Quarantined(0)));
    assert_eq!(people.connects(), 4);

    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(matches!(backend.ensure_bound(&lease, 0).await, Err(MetaError::ServerDown(_))));
    assert_eq!(people.connects(), 5);
}

#[tokio::test]
async fn test_quarantined_single_target_is_reported() {
    let (backend, connector) =
        backend(&PEOPLE_GROUPS.replacen("suffix = \"ou=groups,dc=x\"", "suffix = \"ou=groups,dc=x\"\nquarantine = \"30,+\"", 1));
    connector.server("mem://groups").set_down(true);
    let requester = Requester::anonymous(1);
    let req = RoutingRequest::new(OperationKind::Delete, dn("cn=g,ou=groups,dc=x"));

    assert!(matches!(backend.prepare(&requester, &req).await, Err(MetaError::ServerDown(_))));
    assert_eq!(
        backend.prepare(&requester, &req).await.unwrap_err(),
        MetaError::Quarantined(1)
    );
    assert_eq!(connector.server("mem://groups").connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reclaims_idle_entries() {
    let toml = format!("[pool]\nidle_timeout_secs = 30\nsweep_interval_secs = 10\n{}", PEOPLE_GROUPS);
    let (backend, connector) = backend(&toml);

    let lease = backend.acquire_pool(&Requester::anonymous(1), false);
    backend.ensure_bound(&lease, 0).await.unwrap();
    backend.release_pool(lease);
    assert_eq!(backend.pool().len(), 1);

    let sweeper = backend.sweeper().unwrap();
    Arc::clone(&sweeper).start().await;
    tokio::time::sleep(Duration::from_secs(45)).await;

    assert!(backend.pool().is_empty());
    assert_eq!(connector.server("mem://people").closes(), 1);
    sweeper.stop().await;
}
