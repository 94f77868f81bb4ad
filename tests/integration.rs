use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use zhonghong_vrf::{DeviceChange, GatewayClient, ListenerState};

/// Run with: ZHONGHONG_HOST=192.168.1.50 cargo test --test integration -- --ignored
/// Optional: ZHONGHONG_USER / ZHONGHONG_PASSWORD (defaults admin / empty).
fn gateway() -> GatewayClient {
    let host = env::var("ZHONGHONG_HOST").expect("ZHONGHONG_HOST not set");
    let user = env::var("ZHONGHONG_USER").unwrap_or_else(|_| "admin".to_string());
    let password = env::var("ZHONGHONG_PASSWORD").unwrap_or_default();
    GatewayClient::builder(host)
        .credentials(user, password)
        .build()
        .expect("client builds")
}

#[tokio::test]
#[ignore]
async fn discover_real_gateway() {
    let client = gateway();
    let discovery = client.discover().await.expect("discover failed");

    println!(
        "{} fw {} ({}), {} units",
        discovery.info.model,
        discovery.info.firmware,
        discovery.info.brand.name(),
        discovery.devices.len()
    );
    for (id, status) in &discovery.devices {
        assert!(status.control_index.is_some(), "{id} has no control index");
    }
    assert_eq!(client.refresh_all().await.expect("refresh failed"), discovery.devices.len());
}

#[tokio::test]
#[ignore]
async fn listen_for_broadcasts() {
    // Units only broadcast on change; touch a remote during the window.
    let changes: Arc<Mutex<Vec<DeviceChange>>> = Arc::new(Mutex::new(vec![]));
    let changes_clone = changes.clone();

    let host = env::var("ZHONGHONG_HOST").expect("ZHONGHONG_HOST not set");
    let client = GatewayClient::builder(host)
        .inactivity_timeout(Duration::from_secs(120))
        .on_change(move |change| changes_clone.lock().unwrap().push(change.clone()))
        .build()
        .unwrap();

    client.start();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.listener_state(), ListenerState::Listening);

    for change in changes.lock().unwrap().iter() {
        println!("{} -> {:?}", change.identity, change.current.report);
    }
    client.stop().await;
}
