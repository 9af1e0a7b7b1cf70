//! Lifecycle Integration Tests
//!
//! Subscription replay, login handshakes, and shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};

use common::{FakeConnector, eventually, fast_config};
use stream_client::{
    AuthError, ConnectionState, Connector, Credentials, Frame, Generation, HashAlgorithm, HmacAuth,
    Protocol, SignatureEncoding, StreamClient, StreamConfig, StreamError, Subscription,
    SubscriptionKey,
};

const WAIT: Duration = Duration::from_secs(3);

fn client(connector: &Arc<FakeConnector>, config: StreamConfig, protocol: Protocol) -> StreamClient {
    let connector: Arc<dyn Connector> = connector.clone();
    StreamClient::new(config, protocol, connector).unwrap()
}

fn requests(frames: &[Frame]) -> Vec<Value> {
    frames
        .iter()
        .filter_map(Frame::as_text)
        .filter_map(|text| serde_json::from_str(text).ok())
        .collect()
}

#[tokio::test]
async fn close_twice_returns_immediately() {
    let connector = FakeConnector::new();
    let client = client(&connector, fast_config(), Protocol::new());
    client.connect().await.unwrap();

    client.close().await;
    let started = Instant::now();
    client.close().await;

    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(connector.connection(0).closes(), 1);
    assert!(!client.trigger_reconnect());
    assert!(matches!(
        client
            .subscribe(Subscription::new(SubscriptionKey::new("trades"), Value::Null))
            .await,
        Err(StreamError::Closed)
    ));
    assert!(matches!(client.connect().await, Err(StreamError::Closed)));
}

#[tokio::test]
async fn subscriptions_made_before_connect_are_sent_on_connect() {
    let connector = FakeConnector::new();
    let client = client(&connector, fast_config(), Protocol::new());

    client
        .subscribe(Subscription::new(
            SubscriptionKey::new("trades").with_instrument("ETHUSD"),
            json!(["ETHUSD"]),
        ))
        .await
        .unwrap();
    assert_eq!(client.subscriptions().len(), 1);

    client.connect().await.unwrap();

    let sent = requests(&connector.connection(0).sent());
    assert_eq!(
        sent,
        vec![json!({"op": "subscribe", "channel": "trades", "params": ["ETHUSD"]})]
    );

    client.close().await;
}

#[tokio::test]
async fn replay_reflects_last_operation_per_key() {
    let connector = FakeConnector::new();
    let client = client(&connector, fast_config(), Protocol::new());
    client.connect().await.unwrap();

    let btc = SubscriptionKey::new("ticker").with_instrument("BTCUSD");
    let eth = SubscriptionKey::new("ticker").with_instrument("ETHUSD");

    client
        .subscribe(Subscription::new(btc.clone(), json!({"v": 1})))
        .await
        .unwrap();
    client
        .subscribe(Subscription::new(eth.clone(), json!({"v": 1})))
        .await
        .unwrap();
    client
        .subscribe(Subscription::new(btc.clone(), json!({"v": 2})))
        .await
        .unwrap();
    client.unsubscribe(&eth).await.unwrap();

    connector.connection(0).fail_read();
    assert!(eventually(WAIT, || client.generation() == Generation::new(2)).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let replayed = requests(&connector.connection(1).sent());
    assert_eq!(
        replayed,
        vec![json!({"op": "subscribe", "channel": "ticker", "params": {"v": 2}})]
    );

    client.close().await;
}

#[tokio::test]
async fn private_subscription_without_credentials_is_rejected() {
    let connector = FakeConnector::new();
    let client = client(&connector, fast_config(), Protocol::new());

    let result = client
        .subscribe(Subscription::new(SubscriptionKey::new("orders"), json!({})).private())
        .await;

    assert!(matches!(result, Err(StreamError::MissingCredentials)));
    assert!(client.subscriptions().is_empty());
}

#[tokio::test]
async fn per_request_signatures_on_private_channels() {
    let connector = FakeConnector::new();
    let auth = HmacAuth::per_request(HashAlgorithm::Sha512, SignatureEncoding::Hex);
    let config = fast_config().with_credentials(Credentials::new("key", "secret"));
    let client = client(&connector, config, Protocol::new().with_auth(auth));
    client.connect().await.unwrap();

    client
        .subscribe(Subscription::new(SubscriptionKey::new("spot.orders"), json!(["BTC_USDT"])).private())
        .await
        .unwrap();
    client
        .subscribe(Subscription::new(SubscriptionKey::new("spot.trades"), json!(["BTC_USDT"])))
        .await
        .unwrap();

    let sent = requests(&connector.connection(0).sent());
    assert_eq!(sent.len(), 2);

    let private = &sent[0];
    let time = private["time"].as_i64().unwrap();
    let expected = auth
        .sign(
            "secret",
            &format!("channel=spot.orders&event=subscribe&time={time}"),
        )
        .unwrap();
    assert_eq!(private["signature"], json!(expected));
    assert!(sent[1].get("signature").is_none());

    client.close().await;
}

#[tokio::test]
async fn login_is_acknowledged_before_replay() {
    let connector = FakeConnector::new();
    let auth = HmacAuth::login_frame(HashAlgorithm::Sha256, SignatureEncoding::Base64, true);
    let config = fast_config()
        .with_credentials(Credentials::new("key", "secret").with_passphrase("phrase"));
    let client = client(&connector, config, Protocol::new().with_auth(auth));

    client
        .subscribe(Subscription::new(SubscriptionKey::new("orders"), json!({"instType": "SPOT"})).private())
        .await
        .unwrap();

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    assert!(eventually(WAIT, || connector.connection_count() == 1).await);
    let connection = connector.connection(0);
    assert!(eventually(WAIT, || connection.sent_containing("\"login\"") == 1).await);

    // Nothing is replayed until the server acknowledges the login.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connection.sent_containing("\"subscribe\""), 0);

    connection.push_text(r#"{"event":"login","code":"0","msg":""}"#);
    connecting.await.unwrap().unwrap();

    let sent = requests(&connection.sent());
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0]["op"], json!("login"));
    assert_eq!(sent[0]["args"][0]["apiKey"], json!("key"));
    assert_eq!(sent[0]["args"][0]["passphrase"], json!("phrase"));
    assert_eq!(sent[1]["op"], json!("subscribe"));

    client.close().await;
}

#[tokio::test]
async fn rejected_login_is_reported_and_connection_kept() {
    let connector = FakeConnector::new();
    let auth = HmacAuth::login_frame(HashAlgorithm::Sha256, SignatureEncoding::Base64, true);
    let config = fast_config().with_credentials(Credentials::new("key", "wrong"));
    let client = client(&connector, config, Protocol::new().with_auth(auth));

    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    {
        let errors = Arc::clone(&errors);
        client.set_error_callback(move |error| {
            if let StreamError::Auth(AuthError::Rejected { code, .. }) = error {
                errors.lock().push(code.clone());
            }
        });
    }

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    assert!(eventually(WAIT, || connector.connection_count() == 1).await);
    let connection = connector.connection(0);
    assert!(eventually(WAIT, || connection.sent_containing("\"login\"") == 1).await);
    connection.push_text(r#"{"event":"error","code":"60009","msg":"Login failed."}"#);

    connecting.await.unwrap().unwrap();

    assert_eq!(errors.lock().clone(), vec!["60009".to_string()]);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(connector.dials(), 1);

    client.close().await;
}

#[tokio::test]
async fn login_timeout_is_reported() {
    let connector = FakeConnector::new();
    let auth = HmacAuth::login_frame(HashAlgorithm::Sha256, SignatureEncoding::Hex, true);
    let config = fast_config()
        .with_credentials(Credentials::new("key", "secret"))
        .with_login_timeout(Duration::from_millis(100));
    let client = client(&connector, config, Protocol::new().with_auth(auth));

    let timeouts: Arc<Mutex<usize>> = Arc::default();
    {
        let timeouts = Arc::clone(&timeouts);
        client.set_error_callback(move |error| {
            if matches!(error, StreamError::Auth(AuthError::Timeout(_))) {
                *timeouts.lock() += 1;
            }
        });
    }

    client.connect().await.unwrap();

    assert_eq!(*timeouts.lock(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);

    client.close().await;
}

#[tokio::test]
async fn close_interrupts_pending_dial_retries() {
    let connector = FakeConnector::new();
    connector.fail_next_dials(usize::MAX);
    let config = fast_config().with_backoff(Duration::from_secs(30), Duration::from_secs(30));
    let client = client(&connector, config, Protocol::new());

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };

    assert!(eventually(WAIT, || connector.dials() == 1).await);
    client.close().await;

    let result = tokio::time::timeout(WAIT, connecting).await.unwrap().unwrap();
    assert!(matches!(result, Err(StreamError::Closed)));
    assert_eq!(client.state(), ConnectionState::Closed);
}
