use std::sync::Arc;

use serde_json::{Value, json};
use session_guard::{
    Error, ErrorKind, EventName, InMemoryAuthority, Session, SessionContext, SessionHandle,
    SessionProtocol, UserId,
};

fn protocol() -> SessionProtocol<InMemoryAuthority> {
    SessionProtocol::new(InMemoryAuthority::new())
}

async fn login(protocol: &SessionProtocol<InMemoryAuthority>, user: &str) -> Session {
    protocol
        .create_session(UserId(user.into()), json!({ "name": user }), Value::Null)
        .await
        .unwrap()
}

fn access(session: &Session) -> String {
    session.access_token.as_ref().unwrap().value.clone()
}

fn refresh_value(session: &Session) -> String {
    session.refresh_token.as_ref().unwrap().value.clone()
}

#[tokio::test]
async fn create_issues_every_token() {
    let protocol = protocol();
    let session = login(&protocol, "u1").await;

    assert!(!session.handle.as_str().is_empty());
    assert!(!access(&session).is_empty());
    assert!(!refresh_value(&session).is_empty());
    assert!(!session.id_refresh_token.as_ref().unwrap().value.is_empty());
    assert!(session.anti_csrf_token.is_some());
}

#[tokio::test]
async fn create_without_anti_csrf_when_disabled() {
    let protocol = SessionProtocol::new(InMemoryAuthority::new().with_anti_csrf(false));
    let session = login(&protocol, "u1").await;
    assert!(session.anti_csrf_token.is_none());
    assert!(session.has_new_tokens());
}

#[tokio::test]
async fn revoke_nothing_is_not_an_error() {
    let protocol = protocol();
    assert!(!protocol.revoke_session(&SessionHandle(String::new())).await.unwrap());
    assert!(!protocol.revoke_session(&SessionHandle("unknown".into())).await.unwrap());
    assert!(
        protocol
            .revoke_all_sessions_for_user(&UserId("nobody".into()))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn verify_right_after_create_stays_local() {
    let protocol = protocol();
    let session = login(&protocol, "u1").await;

    let verified = protocol
        .verify_session(&access(&session), session.anti_csrf_token.as_deref(), true)
        .await
        .unwrap();

    assert_eq!(verified.handle, session.handle);
    assert!(verified.access_token.is_none());
    assert!(verified.refresh_token.is_none());
    assert!(verified.id_refresh_token.is_none());
    assert!(verified.anti_csrf_token.is_none());
    assert!(
        protocol
            .context()
            .events()
            .last_event_by_name(EventName::CallingServiceInVerify)
            .is_none()
    );
}

#[tokio::test]
async fn refresh_then_verify_calls_authority_once() {
    let protocol = protocol();
    let created = login(&protocol, "u1").await;

    let refreshed = protocol.refresh_session(&refresh_value(&created)).await.unwrap();
    assert_eq!(refreshed.handle, created.handle);
    assert_ne!(refresh_value(&refreshed), refresh_value(&created));

    let verified = protocol
        .verify_session(&access(&refreshed), refreshed.anti_csrf_token.as_deref(), true)
        .await
        .unwrap();

    assert_eq!(verified.handle, created.handle);
    assert!(verified.anti_csrf_token.is_none());
    assert!(verified.refresh_token.is_none());
    // The committed access token comes back for the client to store.
    let committed = verified.access_token.expect("committed access token");
    let events = protocol.context().events();
    assert_eq!(events.count(EventName::CallingServiceInVerify), 1);
    assert!(events.last_event_by_name(EventName::CallingServiceInVerify).is_some());

    // The committed token verifies locally again.
    protocol
        .verify_session(&committed.value, refreshed.anti_csrf_token.as_deref(), true)
        .await
        .unwrap();
    assert_eq!(events.count(EventName::CallingServiceInVerify), 1);
}

#[tokio::test]
async fn refresh_token_reuse_revokes_the_session() {
    let protocol = protocol();
    let created = login(&protocol, "u1").await;
    let refreshed = protocol.refresh_session(&refresh_value(&created)).await.unwrap();

    let err = protocol
        .refresh_session(&refresh_value(&created))
        .await
        .unwrap_err();
    match &err {
        Error::TokenTheftDetected { handle, user_id } => {
            assert_eq!(handle, &created.handle);
            assert_eq!(user_id.as_str(), "u1");
        }
        other => panic!("expected theft, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::TokenTheftDetected);
    assert_eq!(protocol.context().events().count(EventName::TokenTheftDetected), 1);

    for token in [access(&created), access(&refreshed)] {
        let err = protocol.verify_session(&token, None, false).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)), "got {err:?}");
    }

    // The newer refresh token died with the session.
    let err = protocol
        .refresh_session(&refresh_value(&refreshed))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn theft_is_visible_to_other_processes_through_the_authority() {
    let authority = Arc::new(InMemoryAuthority::new());
    let first = SessionProtocol::with_context(authority.clone(), Arc::new(SessionContext::new()));
    let second = SessionProtocol::with_context(authority, Arc::new(SessionContext::new()));

    let created = login(&first, "u1").await;
    let refreshed = first.refresh_session(&refresh_value(&created)).await.unwrap();
    first
        .refresh_session(&refresh_value(&created))
        .await
        .unwrap_err();

    // Uncommitted token: the second process must ask the authority, which refuses.
    let err = second
        .verify_session(&access(&refreshed), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn anti_csrf_is_optional_per_call() {
    let protocol = protocol();
    let session = login(&protocol, "u1").await;

    protocol
        .verify_session(&access(&session), None, false)
        .await
        .unwrap();

    let err = protocol
        .verify_session(&access(&session), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TryRefreshToken(_)));
}

#[tokio::test]
async fn anti_csrf_globally_disabled_ignores_the_flag() {
    let protocol = SessionProtocol::new(InMemoryAuthority::new().with_anti_csrf(false));
    let session = login(&protocol, "u1").await;

    for (token, enforce) in [(None, true), (None, false), (Some("junk"), true)] {
        protocol
            .verify_session(&access(&session), token, enforce)
            .await
            .unwrap();
    }
    assert_eq!(protocol.context().events().count(EventName::CallingServiceInVerify), 0);
}

#[tokio::test]
async fn revoke_all_for_user_returns_exactly_the_revoked_handles() {
    let protocol = protocol();
    let mut handles: Vec<SessionHandle> = Vec::new();
    for _ in 0..3 {
        handles.push(login(&protocol, "u1").await.handle);
    }
    let other = login(&protocol, "u2").await;
    handles.sort();

    let listed = protocol
        .get_all_session_handles_for_user(&UserId("u1".into()))
        .await
        .unwrap();
    assert_eq!(listed, handles);

    let revoked = protocol
        .revoke_all_sessions_for_user(&UserId("u1".into()))
        .await
        .unwrap();
    assert_eq!(revoked, handles);
    assert!(
        protocol
            .get_all_session_handles_for_user(&UserId("u1".into()))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        protocol
            .get_all_session_handles_for_user(&UserId("u2".into()))
            .await
            .unwrap(),
        vec![other.handle]
    );
}

#[tokio::test]
async fn revoke_session_blocks_local_verification() {
    let protocol = protocol();
    let session = login(&protocol, "u1").await;

    assert!(protocol.revoke_session(&session.handle).await.unwrap());
    assert!(!protocol.revoke_session(&session.handle).await.unwrap());

    let err = protocol
        .verify_session(&access(&session), None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthorized(_)));
}

#[tokio::test]
async fn revoke_multiple_reports_only_active_handles() {
    let protocol = protocol();
    let a = login(&protocol, "u1").await.handle;
    let b = login(&protocol, "u1").await.handle;

    let revoked = protocol
        .revoke_multiple_sessions(&[a.clone(), SessionHandle("ghost".into()), b.clone()])
        .await
        .unwrap();
    assert_eq!(revoked, vec![a, b]);
}

#[tokio::test]
async fn session_data_round_trips_through_the_authority() {
    let protocol = protocol();
    let session = protocol
        .create_session(UserId("u1".into()), json!({}), json!({ "theme": "dark" }))
        .await
        .unwrap();

    assert_eq!(
        protocol.get_session_data(&session.handle).await.unwrap(),
        json!({ "theme": "dark" })
    );
    protocol
        .update_session_data(&session.handle, Value::Null)
        .await
        .unwrap();
    assert_eq!(protocol.get_session_data(&session.handle).await.unwrap(), json!({}));
}

#[tokio::test]
async fn concurrent_verifies_share_one_context() {
    let protocol = protocol();
    let session = login(&protocol, "u1").await;
    let token = access(&session);

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let protocol = protocol.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            protocol.verify_session(&token, None, false).await
        }));
    }
    for task in tasks {
        let verified = task.await.unwrap().unwrap();
        assert_eq!(verified.handle, session.handle);
    }
    assert_eq!(protocol.context().events().count(EventName::CallingServiceInVerify), 0);
}

#[tokio::test]
async fn reset_context_refetches_handshake() {
    let protocol = protocol();
    let session = login(&protocol, "u1").await;
    protocol
        .verify_session(&access(&session), None, false)
        .await
        .unwrap();

    protocol.context().reset().await;
    assert!(protocol.context().events().events().is_empty());

    protocol
        .verify_session(&access(&session), None, false)
        .await
        .unwrap();
    assert_eq!(protocol.context().events().count(EventName::FetchingHandshake), 1);
}
