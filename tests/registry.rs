mod common;

use std::sync::atomic::Ordering;

use bastion_tunnel::config::ConnectionProfile;
use bastion_tunnel::ssh::TunnelError;
use bastion_tunnel::tunnel::{TunnelRegistry, TunnelState};
use tokio::net::TcpStream;

use common::*;

#[tokio::test]
async fn test_open_and_close_by_name() {
    let remote = spawn_echo_server().await;
    let registry = TunnelRegistry::new();

    let prod = registry
        .open_with_connector("prod", config_for(remote), DirectConnector::new())
        .await
        .unwrap();
    let staging = registry
        .open_with_connector("staging", config_for(remote), DirectConnector::new())
        .await
        .unwrap();

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.local_address("prod").as_deref(), Some(prod.as_str()));
    assert_ne!(prod, staging);

    let mut client = TcpStream::connect(&prod).await.unwrap();
    assert_eq!(echo_roundtrip(&mut client, b"ping").await, b"ping");

    let tunnel = registry.get("prod").unwrap();
    registry.close("prod").await.unwrap();
    assert_eq!(tunnel.state(), TunnelState::Stopped);
    assert!(!registry.contains("prod"));
    assert!(registry.contains("staging"));

    registry.close_all().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_reopen_replaces_previous_tunnel() {
    let remote = spawn_echo_server().await;
    let registry = TunnelRegistry::new();

    let first_connector = DirectConnector::new();
    registry
        .open_with_connector("prod", config_for(remote), first_connector.clone())
        .await
        .unwrap();
    let first = registry.get("prod").unwrap();

    let second_addr = registry
        .open_with_connector("prod", config_for(remote), DirectConnector::new())
        .await
        .unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(first.state(), TunnelState::Stopped);
    assert_eq!(first_connector.session.close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(registry.local_address("prod"), Some(second_addr));

    registry.close_all().await;
}

#[tokio::test]
async fn test_failed_open_is_not_registered() {
    let registry = TunnelRegistry::new();
    let result = registry
        .open_with_connector(
            "prod",
            config_for(closed_port().await),
            DirectConnector::failing(|| TunnelError::Dial("unreachable".into())),
        )
        .await;

    assert!(matches!(result, Err(TunnelError::Dial(_))));
    assert!(!registry.contains("prod"));
}

#[tokio::test]
async fn test_profile_through_registry() {
    let remote = spawn_echo_server().await;
    let profile = ConnectionProfile {
        name: "prod".into(),
        address: remote.to_string(),
        enable_ssh: true,
        ssh_host: "bastion.invalid".into(),
        ssh_port: 22,
        ssh_username: "ops".into(),
        ssh_password: "secret".into(),
        ..Default::default()
    };

    let registry = TunnelRegistry::new();
    let local = registry
        .open_with_connector(&profile.name, profile.tunnel_config().unwrap(), DirectConnector::new())
        .await
        .unwrap();

    let client_profile = profile.through_tunnel(&local);
    let mut client = TcpStream::connect(&client_profile.address).await.unwrap();
    assert_eq!(echo_roundtrip(&mut client, b"SHOW MEASUREMENTS").await, b"SHOW MEASUREMENTS");

    registry.close_all().await;
}
