//! Concurrency tests for the connection registry.
//!
//! Many tasks add and remove connections at once; afterwards the member list
//! and the counters must still agree.

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use wsauth_core::{Identity, Principal};
use wsauth_server::application::{ConnectionHandle, ConnectionRegistry, Filter};
use wsauth_server::domain::OutboundMessage;

fn handle(index: u64) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(4);
    let principal = if index % 3 == 0 {
        Principal::Anonymous
    } else {
        Principal::Authenticated(Identity::new(index, format!("user{index}"), "secret"))
    };
    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    (Arc::new(ConnectionHandle::new(principal, ip, tx)), rx)
}

async fn assert_consistent(registry: &ConnectionRegistry) {
    let all = registry.snapshot(Filter::All).await.len();
    let auth = registry.snapshot(Filter::Authenticated).await.len();
    let anon = registry.snapshot(Filter::Anonymous).await.len();
    let counts = registry.describe().await;

    assert_eq!(all, auth + anon);
    assert_eq!(counts.auth, auth);
    assert_eq!(counts.anon, anon);
    assert_eq!(counts.total(), all);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_and_remove_keeps_counts_consistent() {
    // Arrange
    let registry = Arc::new(ConnectionRegistry::new());

    // Act: 200 tasks each add a connection; even ones remove it again
    let mut tasks = Vec::new();
    for index in 0..200u64 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let (member, rx) = handle(index);
            let id = member.id();
            registry.add(member).await;
            if index % 2 == 0 {
                registry.remove(id, false).await.unwrap();
            }
            rx
        }));
    }
    let mut receivers = Vec::new();
    for task in tasks {
        receivers.push(task.await.unwrap());
    }

    // Assert
    assert_eq!(registry.describe().await.total(), 100);
    assert_consistent(&registry).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broadcast_during_churn_never_fails_the_fan_out() {
    // Arrange
    let registry = Arc::new(ConnectionRegistry::new());
    let mut kept = Vec::new();
    for index in 0..20u64 {
        let (member, rx) = handle(index);
        registry.add(member).await;
        kept.push(rx);
    }

    // Act: churn and broadcast at the same time
    let churn = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for index in 100..200u64 {
                let (member, rx) = handle(index);
                let id = member.id();
                registry.add(member).await;
                drop(rx);
                registry.remove(id, false).await.unwrap();
            }
        })
    };
    for round in 0..4 {
        let report = registry
            .broadcast(Filter::All, OutboundMessage::text(format!("round {round}")), None)
            .await;
        assert!(report.delivered >= 20);
    }
    churn.await.unwrap();

    // Assert: every stable member got every round
    for rx in &mut kept {
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);
    }
    assert_eq!(registry.describe().await.total(), 20);
    assert_consistent(&registry).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_lenient_removes_of_same_connection() {
    let registry = Arc::new(ConnectionRegistry::new());
    let (member, _rx) = handle(1);
    let id = member.id();
    registry.add(member).await;

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move { registry.remove(id, true).await }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    assert_eq!(registry.describe().await.total(), 0);
    assert_consistent(&registry).await;
}
