//! Broker-driven reconnects, URI list updates and rebalancing


use broker_failover::protocol::{Command, CommandBody, ConnectionControl};
use broker_failover::testing::MockTransport;
use broker_failover::transport::narrow;
use std::time::Duration;
use test_helpers::*;
use tokio::time::sleep;

fn control(reconnect_to: Option<&str>, connected_brokers: Option<&str>) -> Command {
    Command::new(CommandBody::ConnectionControl(ConnectionControl {
        reconnect_to: reconnect_to.map(str::to_string),
        rebalance_connection: false,
        connected_brokers: connected_brokers.map(str::to_string),
    }))
}

fn active_mock(harness: &Harness) -> std::sync::Arc<MockTransport> {
    narrow::<MockTransport>(&harness.transport).unwrap()
}

#[tokio::test]
async fn test_reconnect_to_moves_connection() {
    // Arrange
    let harness = connected_harness("failover:(mock://a:1)?randomize=false").await;

    // Act
    active_mock(&harness).fire_command(control(Some("mock://c:3"), None));
    let moved = wait_until(|| {
        harness.transport.is_connected()
            && harness.failover.connected_uri().as_deref() == Some("mock://c:3")
    })
    .await;

    // Assert
    assert!(moved);
    assert!(harness.failover.uri_pool().contains("mock://c:3"));
    assert_eq!(harness.listener.interrupted_count(), 1);
    assert_eq!(harness.listener.resumed_count(), 1);
    assert!(kinds(&harness.listener.commands()).contains(&"ConnectionControl"));
    assert!(wait_until(|| harness.network.broker("a:1").connection_count() == 0).await);
}

#[tokio::test]
async fn test_reconnect_to_ignored_when_unsupported() {
    // Arrange
    let harness =
        connected_harness("failover:(mock://a:1)?randomize=false&reconnectSupported=false").await;

    // Act
    active_mock(&harness).fire_command(control(Some("mock://c:3"), None));
    sleep(Duration::from_millis(100)).await;

    // Assert
    assert_eq!(harness.failover.connected_uri().as_deref(), Some("mock://a:1"));
    assert!(!harness.failover.uri_pool().contains("mock://c:3"));
    assert_eq!(harness.network.broker("c:3").accepted_count(), 0);
}

#[tokio::test]
async fn test_connected_brokers_replace_previous_update() {
    // Arrange
    let harness = connected_harness("failover:(mock://a:1)?randomize=false").await;
    let mock = active_mock(&harness);

    // Act
    mock.fire_command(control(None, Some("mock://b:2, mock://c:3")));
    let first = harness.failover.uri_pool().members();
    mock.fire_command(control(None, Some("mock://c:3")));
    let second = harness.failover.uri_pool().members();

    // Assert: configured URIs survive, learned ones are replaced
    assert_eq!(first, vec!["mock://a:1", "mock://b:2", "mock://c:3"]);
    assert_eq!(second, vec!["mock://a:1", "mock://c:3"]);
    assert_eq!(harness.failover.connected_uri().as_deref(), Some("mock://a:1"));
}

#[tokio::test]
async fn test_connected_brokers_ignored_when_unsupported() {
    let harness =
        connected_harness("failover:(mock://a:1)?randomize=false&updateURIsSupported=false").await;

    active_mock(&harness).fire_command(control(None, Some("mock://b:2")));

    assert_eq!(harness.failover.uri_pool().members(), vec!["mock://a:1"]);
}

#[tokio::test]
async fn test_update_uris_with_rebalance_reconnects() {
    // Arrange
    let harness = connected_harness("failover:(mock://a:1)?randomize=false").await;

    // Act
    harness
        .transport
        .update_uris(true, &["mock://b:2".to_string()])
        .await
        .unwrap();
    let rebalanced = wait_until(|| harness.listener.resumed_count() == 1).await;

    // Assert
    assert!(rebalanced);
    assert!(harness.transport.is_connected());
    assert_eq!(harness.failover.connected_uri().as_deref(), Some("mock://b:2"));
}

#[tokio::test]
async fn test_removing_connected_uri_with_rebalance_moves_connection() {
    // Arrange
    let harness =
        connected_harness("failover:(mock://a:1,mock://b:2)?randomize=false&initialReconnectDelay=10")
            .await;

    // Act
    harness
        .failover
        .remove_uris(true, &["mock://a:1".to_string()]);
    let moved = wait_until(|| {
        harness.transport.is_connected()
            && harness.failover.connected_uri().as_deref() == Some("mock://b:2")
    })
    .await;

    // Assert
    assert!(moved);
    assert_eq!(harness.failover.uri_pool().members(), vec!["mock://b:2"]);
}

#[tokio::test]
async fn test_removing_other_uri_keeps_connection() {
    let harness = connected_harness("failover:(mock://a:1,mock://b:2)?randomize=false").await;

    harness
        .failover
        .remove_uris(true, &["mock://b:2".to_string()]);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(harness.failover.connected_uri().as_deref(), Some("mock://a:1"));
    assert_eq!(harness.listener.interrupted_count(), 0);
}

#[tokio::test]
async fn test_reconnect_operation_targets_uri() {
    // Arrange
    let harness = connected_harness("failover:(mock://a:1,mock://b:2)?randomize=false").await;

    // Act
    harness.transport.reconnect("mock://b:2").await.unwrap();
    let moved =
        wait_until(|| harness.failover.connected_uri().as_deref() == Some("mock://b:2")).await;

    // Assert
    assert!(moved);
    assert!(harness.transport.is_reconnect_supported());
    assert!(harness.transport.is_update_uris_supported());
    assert!(harness.transport.is_fault_tolerant());
}
