use super::*;
use crate::clock::{Clock, ManualClock};
use std::sync::Mutex;

// `Result::unwrap_err` on `register` needs the Ok type to be Debug.
impl std::fmt::Debug for dyn crate::handler::StateHandler<HolderCredentialRequest> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StateHandler")
    }
}

#[derive(Default)]
struct ScriptedIssuer {
    submit: Mutex<Vec<Result<String, RemoteError>>>,
    status: Mutex<Vec<Result<IssuerStatus, RemoteError>>>,
}

impl ScriptedIssuer {
    fn submitting(result: Result<String, RemoteError>) -> Arc<Self> {
        Arc::new(Self {
            submit: Mutex::new(vec![result]),
            ..Default::default()
        })
    }

    fn reporting(result: Result<IssuerStatus, RemoteError>) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(vec![result]),
            ..Default::default()
        })
    }
}

#[async_trait]
impl IssuerClient for ScriptedIssuer {
    async fn request_credentials(
        &self,
        _request: &HolderCredentialRequest,
    ) -> Result<String, RemoteError> {
        self.submit.lock().unwrap().pop().expect("unexpected submit")
    }

    async fn request_status(
        &self,
        _request: &HolderCredentialRequest,
    ) -> Result<IssuerStatus, RemoteError> {
        self.status.lock().unwrap().pop().expect("unexpected status poll")
    }
}

fn membership() -> RequestedCredential {
    RequestedCredential {
        id: "membership".to_string(),
        credential_type: "MembershipCredential".to_string(),
        format: "VC1_0_JWT".to_string(),
    }
}

fn request(clock: &ManualClock) -> HolderCredentialRequest {
    HolderCredentialRequest::new(
        "req-1",
        "participant-a",
        "did:web:issuer",
        vec![membership()],
        clock.now(),
    )
    .unwrap()
}

#[test]
fn test_new_request_starts_created_and_unleased() {
    let clock = ManualClock::starting_now();
    let request = request(&clock);
    assert_eq!(request.state(), Some(HolderRequestState::Created));
    assert!(request.meta.lease.is_none());
    assert_eq!(request.meta.retry_count, 0);
}

#[test]
fn test_new_request_requires_fields() {
    let now = chrono::Utc::now();
    let missing_issuer =
        HolderCredentialRequest::new("r", "participant", " ", vec![membership()], now);
    assert_eq!(
        missing_issuer.unwrap_err(),
        EntityError::MissingField {
            entity_type: "HolderCredentialRequest",
            field: "issuerDid"
        }
    );

    let nothing_requested =
        HolderCredentialRequest::new("r", "participant", "did:web:issuer", vec![], now);
    assert_eq!(
        nothing_requested.unwrap_err(),
        EntityError::MissingField {
            entity_type: "HolderCredentialRequest",
            field: "requestedCredentials"
        }
    );
}

#[test]
fn test_serializes_with_camel_case_fields() {
    let clock = ManualClock::starting_now();
    let json = serde_json::to_value(request(&clock)).unwrap();
    assert_eq!(json["participantContextId"], "participant-a");
    assert_eq!(json["requestedCredentials"][0]["type"], "MembershipCredential");
    assert_eq!(json["meta"]["state"], 100);
    assert!(json.get("issuerPid").is_none());
}

#[tokio::test]
async fn test_send_records_issuer_pid() {
    let clock = ManualClock::starting_now();
    let handler = SendCredentialRequest::new(ScriptedIssuer::submitting(Ok("pid-7".into())));
    let mut entity = request(&clock);

    let outcome = handler.handle(&mut entity).await.unwrap();

    assert_eq!(outcome, Outcome::Advance(HolderRequestState::Requested));
    assert_eq!(entity.issuer_pid.as_deref(), Some("pid-7"));
}

#[tokio::test]
async fn test_send_classifies_remote_failures() {
    let clock = ManualClock::starting_now();
    let transient = SendCredentialRequest::new(ScriptedIssuer::submitting(Err(
        RemoteError::Transient("503".into()),
    )));
    let permanent = SendCredentialRequest::new(ScriptedIssuer::submitting(Err(
        RemoteError::Permanent("400".into()),
    )));

    let mut entity = request(&clock);
    assert_eq!(
        transient.handle(&mut entity).await.unwrap(),
        Outcome::Retry("503".into())
    );
    assert_eq!(
        permanent.handle(&mut entity).await.unwrap(),
        Outcome::Fatal("400".into())
    );
}

#[tokio::test]
async fn test_status_check_maps_issuer_status() {
    let clock = ManualClock::starting_now();
    let mut entity = request(&clock);
    entity.issuer_pid = Some("pid-7".into());
    let limit = Duration::from_secs(3600);

    let received = CheckIssuanceStatus::new(
        ScriptedIssuer::reporting(Ok(IssuerStatus::Received)),
        Arc::new(clock.clone()),
        limit,
    );
    assert_eq!(received.handle(&mut entity).await.unwrap(), Outcome::Wait);

    let issued = CheckIssuanceStatus::new(
        ScriptedIssuer::reporting(Ok(IssuerStatus::Issued)),
        Arc::new(clock.clone()),
        limit,
    );
    assert_eq!(
        issued.handle(&mut entity).await.unwrap(),
        Outcome::Advance(HolderRequestState::Issued)
    );

    let rejected = CheckIssuanceStatus::new(
        ScriptedIssuer::reporting(Ok(IssuerStatus::Rejected(Some("not a member".into())))),
        Arc::new(clock.clone()),
        limit,
    );
    assert!(matches!(
        rejected.handle(&mut entity).await.unwrap(),
        Outcome::Fatal(reason) if reason.contains("not a member")
    ));
}

#[tokio::test]
async fn test_status_check_times_out() {
    let clock = ManualClock::starting_now();
    let mut entity = request(&clock);
    entity.issuer_pid = Some("pid-7".into());
    clock.advance(Duration::from_secs(61));

    let handler = CheckIssuanceStatus::new(
        Arc::new(ScriptedIssuer::default()),
        Arc::new(clock.clone()),
        Duration::from_secs(60),
    );

    assert!(matches!(
        handler.handle(&mut entity).await.unwrap(),
        Outcome::Fatal(reason) if reason.contains("60s")
    ));
}

#[test]
fn test_registry_covers_every_non_terminal_state() {
    let clock = ManualClock::starting_now();
    let registry = registry(
        Arc::new(ScriptedIssuer::default()),
        Arc::new(clock),
        Duration::from_secs(60),
    )
    .unwrap();
    assert_eq!(
        registry.states(),
        vec![
            HolderRequestState::Created,
            HolderRequestState::Submitted,
            HolderRequestState::Requested
        ]
    );
}

struct SkipsAhead;

#[async_trait]
impl StateHandler<HolderCredentialRequest> for SkipsAhead {
    fn produces(&self) -> Vec<HolderRequestState> {
        vec![HolderRequestState::Issued]
    }

    async fn handle(
        &self,
        _request: &mut HolderCredentialRequest,
    ) -> anyhow::Result<Outcome<HolderRequestState>> {
        Ok(Outcome::Advance(HolderRequestState::Issued))
    }
}

#[test]
fn test_registration_rejects_disallowed_targets() {
    let mut registry = HandlerRegistry::new(transition_table().unwrap());
    let err = registry
        .register(HolderRequestState::Created, Arc::new(SkipsAhead))
        .unwrap_err();
    assert_eq!(
        err,
        StateMachineError::DisallowedTarget {
            workflow: "holder-credential-request",
            from: "CREATED",
            to: "ISSUED"
        }
    );

    let err = registry
        .register(HolderRequestState::Issued, Arc::new(SubmitRequest))
        .unwrap_err();
    assert!(matches!(err, StateMachineError::HandlerForTerminalState { .. }));
}

#[test]
fn test_reregistration_replaces_handler() {
    let mut registry = HandlerRegistry::new(transition_table().unwrap());
    let first = registry
        .register(HolderRequestState::Created, Arc::new(SubmitRequest))
        .unwrap();
    let second = registry
        .register(HolderRequestState::Created, Arc::new(SubmitRequest))
        .unwrap();
    assert!(first.is_none());
    assert!(second.is_some());
    assert_eq!(registry.states(), vec![HolderRequestState::Created]);
}
