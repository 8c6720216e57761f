// Behaviour every EntityStore backend must share. Each backend test file
// builds a `Harness` and expands `store_conformance_tests!` over it.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::json;

use idhub_core::workflows::{HolderCredentialRequest, HolderRequestState, RequestedCredential};
use idhub_core::{
    Caller, Clock, Criterion, EntityStore, Lease, ManualClock, Operator, QuerySpec, SharedClock,
    SortOrder, StatefulEntity, StoreError, WorkflowState,
};

pub type Request = HolderCredentialRequest;

pub const LEASE: Duration = Duration::from_secs(60);

pub fn init_tracing() -> tracing::dispatcher::DefaultGuard {
    let subscriber = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

pub struct Harness {
    pub store: Arc<dyn EntityStore<Request>>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap())
    }

    pub fn shared(clock: &ManualClock) -> SharedClock {
        Arc::new(clock.clone())
    }

    pub fn request(&self, id: &str, participant: &str, issuer: &str) -> Request {
        HolderCredentialRequest::new(
            id,
            participant,
            issuer,
            vec![RequestedCredential {
                id: "membership".to_string(),
                credential_type: "MembershipCredential".to_string(),
                format: "VC1_0_JWT".to_string(),
            }],
            self.clock.now(),
        )
        .expect("valid request")
    }

    pub fn in_state(&self, mut request: Request, state: HolderRequestState) -> Request {
        request.meta.transition_to(state.code(), self.clock.now());
        request
    }

    pub fn tick(&self) {
        self.clock.advance(Duration::from_secs(1));
    }

    pub async fn ids(&self, spec: QuerySpec) -> Result<Vec<String>> {
        Ok(self
            .store
            .query(&spec)
            .await?
            .into_iter()
            .map(|request| request.meta.id)
            .collect())
    }
}

fn ids(requests: &[Request]) -> Vec<&str> {
    requests.iter().map(|request| request.meta.id.as_str()).collect()
}

macro_rules! store_conformance_tests {
    ($setup:ident) => {
        store_conformance_tests!(
            $setup;
            create_and_find_round_trip,
            duplicate_create_is_rejected,
            update_respects_leases,
            lease_expires_after_ttl,
            commit_updates_and_releases,
            release_lease_checks_holder,
            delete_respects_leases,
            claim_orders_by_last_update,
            concurrent_claims_never_overlap,
            query_filters_sorts_and_pages,
            query_rejects_unsupported_criteria,
            query_sees_leased_entities_claim_does_not,
            like_with_many_wildcards_does_not_stall,
        );
    };
    ($setup:ident; $($check:ident),+ $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $check() -> anyhow::Result<()> {
                let _tracing = common::init_tracing();
                let (_guard, harness) = $setup().await?;
                common::$check(&harness).await
            }
        )+
    };
}

pub async fn create_and_find_round_trip(h: &Harness) -> Result<()> {
    let mut request = h.request("req-1", "tenant-a", "did:web:issuer");
    request
        .meta
        .trace_context
        .insert("traceparent".to_string(), "00-4bf92f35-01".to_string());
    h.store.create(&request).await?;

    let found = h.store.find_by_id("req-1").await?.expect("stored request");
    assert_eq!(found, request);
    assert!(h.store.find_by_id("missing").await?.is_none());

    let mut leased = h.request("req-2", "tenant-a", "did:web:issuer");
    leased.meta.lease = Some(Lease {
        owner: "intruder".to_string(),
        expires_at: h.clock.now() + chrono::Duration::hours(1),
    });
    h.store.create(&leased).await?;
    let found = h.store.find_by_id("req-2").await?.expect("stored request");
    assert!(found.meta.lease.is_none(), "create must not store a lease");
    assert!(h.store.acquire_lease("req-2", "worker", LEASE).await?);
    Ok(())
}

pub async fn duplicate_create_is_rejected(h: &Harness) -> Result<()> {
    let request = h.request("req-1", "tenant-a", "did:web:issuer");
    h.store.create(&request).await?;

    let err = h.store.create(&request).await.unwrap_err();
    assert!(matches!(err, StoreError::Duplicate { ref id, .. } if id == "req-1"), "{err:?}");
    assert_eq!(h.store.count(&[]).await?, 1);
    Ok(())
}

pub async fn update_respects_leases(h: &Harness) -> Result<()> {
    let mut request = h.request("req-1", "tenant-a", "did:web:issuer");
    h.store.create(&request).await?;

    request.issuer_pid = Some("pid-1".to_string());
    h.store.update(&request, Caller::Admin).await?;
    let found = h.store.find_by_id("req-1").await?.expect("stored request");
    assert_eq!(found.issuer_pid.as_deref(), Some("pid-1"));

    // Owning a lease is required for lease-owner writes
    let err = h
        .store
        .update(&request, Caller::LeaseOwner("worker-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleLease { .. }), "{err:?}");

    assert!(h.store.acquire_lease("req-1", "worker-a", LEASE).await?);
    let err = h.store.update(&request, Caller::Admin).await.unwrap_err();
    assert!(
        matches!(err, StoreError::StaleLease { holder: Some(ref holder), .. } if holder == "worker-a"),
        "{err:?}"
    );
    let err = h
        .store
        .update(&request, Caller::LeaseOwner("worker-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleLease { .. }), "{err:?}");

    request.issuer_pid = Some("pid-2".to_string());
    h.store
        .update(&request, Caller::LeaseOwner("worker-a"))
        .await?;
    let found = h.store.find_by_id("req-1").await?.expect("stored request");
    assert_eq!(found.issuer_pid.as_deref(), Some("pid-2"));
    assert!(h.store.is_leased_by("req-1", "worker-a").await?, "update keeps the lease");

    let ghost = h.request("ghost", "tenant-a", "did:web:issuer");
    let err = h.store.update(&ghost, Caller::Admin).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }), "{err:?}");
    Ok(())
}

pub async fn lease_expires_after_ttl(h: &Harness) -> Result<()> {
    let request = h.request("req-1", "tenant-a", "did:web:issuer");
    h.store.create(&request).await?;
    let ttl = Duration::from_secs(10);

    assert!(h.store.acquire_lease("req-1", "worker-a", ttl).await?);
    assert!(!h.store.acquire_lease("req-1", "worker-b", ttl).await?);
    assert!(h.store.acquire_lease("req-1", "worker-a", ttl).await?, "holder renews");
    assert!(h.store.is_leased_by("req-1", "worker-a").await?);
    assert!(!h.store.is_leased_by("req-1", "worker-b").await?);

    h.clock.advance(Duration::from_secs(11));
    assert!(!h.store.is_leased_by("req-1", "worker-a").await?);
    let err = h
        .store
        .update(&request, Caller::LeaseOwner("worker-a"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleLease { .. }), "{err:?}");

    assert!(h.store.acquire_lease("req-1", "worker-b", ttl).await?);
    assert!(h.store.is_leased_by("req-1", "worker-b").await?);

    let err = h
        .store
        .acquire_lease("missing", "worker-b", ttl)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }), "{err:?}");
    Ok(())
}

pub async fn commit_updates_and_releases(h: &Harness) -> Result<()> {
    let request = h.request("req-1", "tenant-a", "did:web:issuer");
    h.store.create(&request).await?;
    assert!(h.store.acquire_lease("req-1", "worker-a", LEASE).await?);

    h.tick();
    let submitted = h.in_state(request, HolderRequestState::Submitted);
    h.store.commit(&submitted, "worker-a").await?;

    let found = h.store.find_by_id("req-1").await?.expect("stored request");
    assert_eq!(found.state(), Some(HolderRequestState::Submitted));
    assert_eq!(found.meta.state_timestamp, h.clock.now());
    assert_eq!(found.meta.updated_at, h.clock.now());
    assert!(found.meta.lease.is_none());

    let err = h.store.commit(&submitted, "worker-a").await.unwrap_err();
    assert!(matches!(err, StoreError::StaleLease { .. }), "{err:?}");
    Ok(())
}

pub async fn release_lease_checks_holder(h: &Harness) -> Result<()> {
    let request = h.request("req-1", "tenant-a", "did:web:issuer");
    h.store.create(&request).await?;
    assert!(h.store.acquire_lease("req-1", "worker-a", LEASE).await?);

    let err = h.store.release_lease("req-1", "worker-b").await.unwrap_err();
    assert!(
        matches!(err, StoreError::StaleLease { holder: Some(ref holder), .. } if holder == "worker-a"),
        "{err:?}"
    );

    h.store.release_lease("req-1", "worker-a").await?;
    assert!(!h.store.is_leased_by("req-1", "worker-a").await?);
    assert!(h.store.acquire_lease("req-1", "worker-b", LEASE).await?);

    let err = h.store.release_lease("missing", "worker-a").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }), "{err:?}");
    Ok(())
}

pub async fn delete_respects_leases(h: &Harness) -> Result<()> {
    let request = h.request("req-1", "tenant-a", "did:web:issuer");
    h.store.create(&request).await?;
    assert!(h.store.acquire_lease("req-1", "worker-a", LEASE).await?);

    let err = h.store.delete("req-1", Caller::Admin).await.unwrap_err();
    assert!(matches!(err, StoreError::StaleLease { .. }), "{err:?}");
    let err = h
        .store
        .delete("req-1", Caller::LeaseOwner("worker-b"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::StaleLease { .. }), "{err:?}");

    h.store
        .delete("req-1", Caller::LeaseOwner("worker-a"))
        .await?;
    assert!(h.store.find_by_id("req-1").await?.is_none());

    let err = h.store.delete("req-1", Caller::Admin).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }), "{err:?}");
    Ok(())
}

pub async fn claim_orders_by_last_update(h: &Harness) -> Result<()> {
    for id in ["r1", "r2", "r3"] {
        h.store.create(&h.request(id, "tenant-a", "did:web:issuer")).await?;
        h.tick();
    }
    let submitted = h.in_state(
        h.request("s1", "tenant-a", "did:web:issuer"),
        HolderRequestState::Submitted,
    );
    h.store.create(&submitted).await?;

    let created = [HolderRequestState::Created];
    assert!(h.store.claim_next(0, &created, "worker-a", LEASE).await?.is_empty());
    assert!(h.store.claim_next(5, &[], "worker-a", LEASE).await?.is_empty());

    let first = h.store.claim_next(2, &created, "worker-a", LEASE).await?;
    assert_eq!(ids(&first), ["r1", "r2"]);
    for request in &first {
        let lease = request.meta.lease.as_ref().expect("claimed entities carry the lease");
        assert_eq!(lease.owner, "worker-a");
        assert_eq!(lease.expires_at, h.clock.now() + chrono::Duration::seconds(60));
    }

    let second = h.store.claim_next(2, &created, "worker-b", LEASE).await?;
    assert_eq!(ids(&second), ["r3"]);
    assert!(h.store.claim_next(2, &created, "worker-b", LEASE).await?.is_empty());

    // Expired leases make entities claimable again
    h.clock.advance(Duration::from_secs(61));
    let reclaimed = h.store.claim_next(5, &created, "worker-b", LEASE).await?;
    assert_eq!(ids(&reclaimed), ["r1", "r2", "r3"]);

    // A committed entity goes to the back of the queue
    h.tick();
    h.store.commit(&reclaimed[0], "worker-b").await?;
    h.clock.advance(Duration::from_secs(61));
    let requeued = h.store.claim_next(5, &created, "worker-c", LEASE).await?;
    assert_eq!(ids(&requeued), ["r2", "r3", "r1"]);
    Ok(())
}

pub async fn concurrent_claims_never_overlap(h: &Harness) -> Result<()> {
    for index in 0..30 {
        h.store
            .create(&h.request(&format!("req-{index:02}"), "tenant-a", "did:web:issuer"))
            .await?;
        h.clock.advance(Duration::from_millis(1));
    }

    let mut workers = Vec::new();
    for worker in 0..5 {
        let store = h.store.clone();
        workers.push(tokio::spawn(async move {
            let owner = format!("worker-{worker}");
            let mut claimed = Vec::new();
            loop {
                let batch = store
                    .claim_next(4, &[HolderRequestState::Created], &owner, LEASE)
                    .await?;
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch.into_iter().map(|request| request.meta.id));
            }
            anyhow::Ok(claimed)
        }));
    }

    let mut all = Vec::new();
    for worker in workers {
        all.extend(worker.await??);
    }
    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 30, "every entity claimed exactly once: {all:?}");
    assert_eq!(unique.len(), 30);
    Ok(())
}

async fn seed_query_fixtures(h: &Harness) -> Result<()> {
    h.store.create(&h.request("a1", "tenant-a", "did:web:alpha")).await?;
    h.tick();
    let mut a2 = h.in_state(
        h.request("a2", "tenant-a", "did:web:beta"),
        HolderRequestState::Submitted,
    );
    a2.issuer_pid = Some("pid-2".to_string());
    h.store.create(&a2).await?;
    h.tick();
    h.store
        .create(&h.in_state(
            h.request("b1", "tenant-b", "did:web:gamma"),
            HolderRequestState::Submitted,
        ))
        .await?;
    h.tick();
    let mut b2 = h.request("b2", "tenant-b", "did:web:delta");
    b2.meta
        .fail(HolderRequestState::Error.code(), "rejected by issuer", h.clock.now());
    h.store.create(&b2).await?;
    Ok(())
}

pub async fn query_filters_sorts_and_pages(h: &Harness) -> Result<()> {
    let start = h.clock.now();
    seed_query_fixtures(h).await?;
    let tenant_a = Criterion::new("participantContextId", Operator::Eq, "tenant-a");

    assert_eq!(h.ids(QuerySpec::new().filter(tenant_a.clone())).await?, ["a1", "a2"]);
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new(
            "participantContextId",
            Operator::Ne,
            "tenant-a"
        )))
        .await?,
        ["b1", "b2"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new(
            "state",
            Operator::In,
            json!(["SUBMITTED", 900])
        )))
        .await?,
        ["a2", "b1", "b2"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new("issuerDid", Operator::Like, "%GAMMA")))
            .await?,
        ["b1"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new("issuerPid", Operator::Eq, json!(null))))
            .await?,
        ["a1", "b1", "b2"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new("issuerPid", Operator::Ne, json!(null))))
            .await?,
        ["a2"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new(
            "createdAt",
            Operator::Ge,
            (start + chrono::Duration::seconds(2)).to_rfc3339()
        )))
        .await?,
        ["b1", "b2"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().filter(Criterion::new(
            "createdAt",
            Operator::Lt,
            (start + chrono::Duration::seconds(1)).timestamp_millis()
        )))
        .await?,
        ["a1"]
    );
    assert_eq!(
        h.ids(
            QuerySpec::new()
                .filter(tenant_a.clone())
                .filter(Criterion::new("state", Operator::Eq, "submitted"))
        )
        .await?,
        ["a2"]
    );

    assert_eq!(
        h.ids(QuerySpec::new().sort_by("issuerDid", SortOrder::Desc)).await?,
        ["b1", "b2", "a2", "a1"]
    );
    assert_eq!(
        h.ids(QuerySpec::new().sort_by("participantContextId", SortOrder::Desc))
            .await?,
        ["b1", "b2", "a1", "a2"],
        "ties fall back to creation order"
    );
    assert_eq!(h.ids(QuerySpec::new().offset(1).limit(2)).await?, ["a2", "b1"]);
    assert!(h.ids(QuerySpec::new().offset(10)).await?.is_empty());

    assert_eq!(h.store.count(&[]).await?, 4);
    assert_eq!(h.store.count(&[tenant_a]).await?, 2);
    assert_eq!(
        h.store
            .count(&[Criterion::new("errorDetail", Operator::Like, "%issuer")])
            .await?,
        1
    );
    Ok(())
}

pub async fn query_rejects_unsupported_criteria(h: &Harness) -> Result<()> {
    seed_query_fixtures(h).await?;
    let invalid = [
        QuerySpec::new().filter(Criterion::new("colour", Operator::Eq, "red")),
        QuerySpec::new().filter(Criterion::new(
            "requestedCredentials",
            Operator::Eq,
            "membership",
        )),
        QuerySpec::new().filter(Criterion::new("issuerPid", Operator::Lt, json!(null))),
        QuerySpec::new().filter(Criterion::new("state", Operator::Eq, "DISPATCHED")),
        QuerySpec::new().filter(Criterion {
            field: "issuerDid".to_string(),
            operator: "~".to_string(),
            value: json!("did"),
        }),
        QuerySpec::new().sort_by("requestedCredentials", SortOrder::Asc),
        QuerySpec::new().sort_by("colour", SortOrder::Asc),
    ];
    for spec in invalid {
        let err = h.store.query(&spec).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedQuery(_)), "{spec:?}: {err:?}");
    }

    let err = h
        .store
        .count(&[Criterion::new("retryCount", Operator::Like, "1%")])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UnsupportedQuery(_)), "{err:?}");
    Ok(())
}

pub async fn query_sees_leased_entities_claim_does_not(h: &Harness) -> Result<()> {
    for id in ["s1", "s2"] {
        h.store
            .create(&h.in_state(
                h.request(id, "tenant-a", "did:web:issuer"),
                HolderRequestState::Submitted,
            ))
            .await?;
        h.tick();
    }
    h.store.create(&h.request("c1", "tenant-a", "did:web:issuer")).await?;
    assert!(h.store.acquire_lease("s1", "other-runtime", LEASE).await?);

    let spec = QuerySpec::new()
        .filter(Criterion::new("state", Operator::Eq, "SUBMITTED"))
        .limit(10);
    assert_eq!(h.ids(spec).await?, ["s1", "s2"]);

    let claimed = h
        .store
        .claim_next(10, &[HolderRequestState::Submitted], "this-runtime", LEASE)
        .await?;
    assert_eq!(ids(&claimed), ["s2"]);
    Ok(())
}

/// A filter full of `%` wildcards neither hangs the query nor blocks
/// claims running next to it.
pub async fn like_with_many_wildcards_does_not_stall(h: &Harness) -> Result<()> {
    let tenant = "a".repeat(40);
    h.store.create(&h.request("req-1", &tenant, "did:web:issuer")).await?;
    h.store.create(&h.request("req-2", "tenant-b", "did:web:issuer")).await?;

    let pattern = Criterion::new("participantContextId", Operator::Like, "%a%a%a%a%a%a%a%ab");
    let (count, claimed) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::try_join!(
            h.store.count(std::slice::from_ref(&pattern)),
            h.store.claim_next(10, &[HolderRequestState::Created], "runtime-1", LEASE),
        )
    })
    .await??;
    assert_eq!(count, 0);
    assert_eq!(claimed.len(), 2);

    let matching = Criterion::new("participantContextId", Operator::Like, "%a%a%a%a%a%a%a%a");
    assert_eq!(h.store.count(&[matching]).await?, 1);
    Ok(())
}
