// SPDX-License-Identifier: Apache-2.0

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{fixture, vdb, Fixture, JOIN_SQL, SINGLE_MODEL_SQL, VDB};
use tessera::core_types::envelope::RequestMessage;
use tessera::core_types::{EngineError, LogonFailureKind};
use tessera::dispatch::MemoryConnector;
use tessera::session::Credentials;
use tessera::EngineConfig;

#[tokio::test]
async fn concurrent_logons_get_distinct_ids_or_quota_failure() {
    let mut config = EngineConfig::default();
    config.session.max_sessions_per_user = 2;
    let fx = fixture(config, MemoryConnector::new("mongo"));

    let attempts: Vec<_> = (0..5)
        .map(|_| {
            let engine = Arc::clone(&fx.engine);
            tokio::spawn(async move { engine.logon(Credentials::new("alice", "secret", VDB)).await })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut quota_failures = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(logon) => assert!(ids.insert(logon.session_id())),
            Err(EngineError::LogonFailure {
                kind: LogonFailureKind::QuotaExceeded,
                ..
            }) => quota_failures += 1,
            Err(other) => panic!("unexpected logon failure {other:?}"),
        }
    }
    assert_eq!(ids.len(), 2);
    assert_eq!(quota_failures, 3);
}

#[tokio::test]
async fn logoff_invalidates_the_token() {
    let fx = Fixture::standard();
    let logon = fx.logon_as("alice", "analyst").await;

    fx.engine.ping(&logon.token).await.unwrap();
    fx.engine.logoff(&logon.token).await.unwrap();

    let err = fx.engine.ping(&logon.token).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSession { .. }));
    let err = fx
        .engine
        .sessions()
        .assert_identity(&logon.token)
        .await
        .unwrap_err();
    assert!(err.is_recoverable());
}

#[tokio::test]
async fn join_runs_one_fragment_per_model() {
    let fx = Fixture::standard();
    let logon = fx.logon_as("alice", "analyst").await;

    let results = fx
        .engine
        .execute(&logon.token, RequestMessage::new(1, JOIN_SQL), None)
        .await
        .unwrap();

    assert_eq!(results.fragments.len(), 2);
    assert_eq!(results.row_count(), 4);
    assert_eq!(fx.pg.executed().len(), 1);
    assert_eq!(fx.mongo.executed().len(), 1);
    assert!(fx.engine.close_request(&logon.token, 1).await.unwrap());
    assert_eq!(fx.engine.dispatch().tracked_requests(), 0);
}

#[tokio::test]
async fn mixed_access_yields_one_denial_naming_nothing() {
    let fx = Fixture::standard();
    let logon = fx.logon_as("alice", "reader_a").await;

    let first = fx
        .engine
        .execute(&logon.token, RequestMessage::new(1, JOIN_SQL), None)
        .await
        .unwrap_err();
    let EngineError::AuthorizationDenied { message } = &first else {
        panic!("expected an authorization denial, got {first:?}");
    };
    assert!(!message.to_lowercase().contains("modelb"));
    assert!(!message.contains("t2"));
    assert!(fx.pg.executed().is_empty());
    assert!(fx.mongo.executed().is_empty());

    let second = fx
        .engine
        .execute(&logon.token, RequestMessage::new(2, JOIN_SQL), None)
        .await
        .unwrap_err();
    assert_eq!(first, second);
}

#[tokio::test]
async fn private_model_is_rejected_before_dispatch() {
    let fx = Fixture::standard();
    fx.catalog.set_model_public(&vdb(), "modelB", false).unwrap();
    let logon = fx.logon_as("alice", "analyst").await;
    let next_count = fx.engine.dispatch().next_execution_count();

    let err = fx
        .engine
        .execute(&logon.token, RequestMessage::new(1, JOIN_SQL), None)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::visibility_denied("modelB.t2"));
    assert!(err.to_string().contains("modelB.t2"));

    assert!(fx.pg.executed().is_empty());
    assert!(fx.mongo.executed().is_empty());
    assert_eq!(fx.engine.dispatch().next_execution_count(), next_count);
}

#[tokio::test]
async fn fetch_size_zero_is_an_argument_error() {
    let fx = Fixture::standard();
    let logon = fx.logon_as("alice", "analyst").await;

    let mut request = RequestMessage::new(1, SINGLE_MODEL_SQL);
    request.fetch_size = 0;
    let err = fx.engine.execute(&logon.token, request, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument { .. }));
    assert!(fx.pg.executed().is_empty());
}

#[tokio::test]
async fn atomic_ids_increase_across_sessions() {
    let fx = Fixture::standard();
    let alice = fx.logon_as("alice", "analyst").await;
    let bob = fx.logon_as("bob", "analyst").await;

    let first = fx
        .engine
        .execute(&alice.token, RequestMessage::new(1, SINGLE_MODEL_SQL), None)
        .await
        .unwrap();
    let second = fx
        .engine
        .execute(&bob.token, RequestMessage::new(1, SINGLE_MODEL_SQL), None)
        .await
        .unwrap();

    let a = first.fragments[0].atomic_request_id;
    let b = second.fragments[0].atomic_request_id;
    assert_eq!(a.request().session(), Some(alice.session_id()));
    assert_eq!(b.request().session(), Some(bob.session_id()));
    assert!(b.execution_count() > a.execution_count());
}

#[tokio::test]
async fn partial_results_turn_a_failed_fragment_into_a_warning() {
    let fx = Fixture::standard();
    fx.mongo.fail_on("modelB.t2");
    let logon = fx.logon_as("alice", "analyst").await;

    let err = fx
        .engine
        .execute(&logon.token, RequestMessage::new(1, JOIN_SQL), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ConnectorFailure { .. }));

    let mut request = RequestMessage::new(2, JOIN_SQL);
    request.partial_results = true;
    let results = fx.engine.execute(&logon.token, request, None).await.unwrap();
    assert_eq!(results.row_count(), 3);
    assert_eq!(results.warnings.len(), 1);
}

#[tokio::test]
async fn duplicate_execution_ids_are_rejected_until_closed() {
    let fx = Fixture::standard();
    let logon = fx.logon_as("alice", "analyst").await;

    fx.engine
        .execute(&logon.token, RequestMessage::new(7, SINGLE_MODEL_SQL), None)
        .await
        .unwrap();
    let err = fx
        .engine
        .execute(&logon.token, RequestMessage::new(7, SINGLE_MODEL_SQL), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument { .. }));

    assert!(fx.engine.close_request(&logon.token, 7).await.unwrap());
    fx.engine
        .execute(&logon.token, RequestMessage::new(7, SINGLE_MODEL_SQL), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn logoff_during_validation_stops_the_request() {
    let fx = Fixture::standard();
    let logon = fx.logon_as("alice", "analyst").await;
    fx.gate.arm();

    let engine = Arc::clone(&fx.engine);
    let token = logon.token.clone();
    let running = tokio::spawn(async move {
        engine
            .execute(&token, RequestMessage::new(1, SINGLE_MODEL_SQL), None)
            .await
    });

    fx.gate.entered().await;
    fx.engine.logoff(&logon.token).await.unwrap();
    fx.gate.release();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, EngineError::InvalidSession { .. }));
    assert!(fx.pg.executed().is_empty());
    assert_eq!(fx.engine.dispatch().tracked_requests(), 0);
}
