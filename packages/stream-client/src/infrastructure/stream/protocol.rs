//! Endpoint Protocol
//!
//! Bundles the per-endpoint strategies the stream engine is parameterized
//! over: frame codec, request layout, heartbeat style, authentication
//! scheme, and the subscription-to-routing-key mapping. One [`Protocol`]
//! value describes one vendor endpoint; the connection logic never branches
//! on vendor.
//!
//! # Request Encoding
//!
//! Subscribe and unsubscribe requests are JSON objects whose field names
//! come from [`RequestLayout`]:
//!
//! ```json
//! {"op": "subscribe", "channel": "ticker", "params": {...}, "signature": "..", "time": 1700000000}
//! ```

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::auth::{AuthError, AuthMode, HmacAuth};
use super::codec::JsonCodec;
use super::heartbeat::HeartbeatStyle;
use crate::domain::envelope::RoutingKey;
use crate::domain::subscription::{Subscription, SubscriptionKey, SubscriptionOp};
use crate::infrastructure::config::Credentials;

/// Maps a subscription key to the routing key its frames arrive under.
pub type RouteFn = Arc<dyn Fn(&SubscriptionKey) -> RoutingKey + Send + Sync>;

// =============================================================================
// Request Layout
// =============================================================================

/// Field names and operation values for subscription requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLayout {
    /// Field carrying the operation.
    pub op_field: String,
    /// Field carrying the channel.
    pub channel_field: String,
    /// Field carrying the opaque request payload.
    pub params_field: String,
    /// Field carrying the request signature.
    pub signature_field: String,
    /// Field carrying the signing timestamp.
    pub time_field: String,
    /// Operation value for subscribe.
    pub subscribe_op: String,
    /// Operation value for unsubscribe.
    pub unsubscribe_op: String,
}

impl Default for RequestLayout {
    fn default() -> Self {
        Self {
            op_field: "op".to_string(),
            channel_field: "channel".to_string(),
            params_field: "params".to_string(),
            signature_field: "signature".to_string(),
            time_field: "time".to_string(),
            subscribe_op: SubscriptionOp::Subscribe.as_str().to_string(),
            unsubscribe_op: SubscriptionOp::Unsubscribe.as_str().to_string(),
        }
    }
}

impl RequestLayout {
    /// Layout using `event` for the operation and `payload` for params.
    #[must_use]
    pub fn event_payload() -> Self {
        Self {
            op_field: "event".to_string(),
            params_field: "payload".to_string(),
            ..Self::default()
        }
    }

    fn op_value(&self, op: SubscriptionOp) -> &str {
        match op {
            SubscriptionOp::Subscribe => &self.subscribe_op,
            SubscriptionOp::Unsubscribe => &self.unsubscribe_op,
        }
    }
}

// =============================================================================
// Protocol
// =============================================================================

/// Strategy bundle for one endpoint.
#[derive(Clone, Default)]
pub struct Protocol {
    codec: JsonCodec,
    layout: RequestLayout,
    heartbeat: HeartbeatStyle,
    auth: Option<HmacAuth>,
    router: Option<RouteFn>,
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("codec", &self.codec)
            .field("layout", &self.layout)
            .field("heartbeat", &self.heartbeat)
            .field("auth", &self.auth)
            .field("router", &self.router.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Protocol {
    /// Default protocol: JSON codec, default layout, control pings, no auth.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the frame codec.
    #[must_use]
    pub fn with_codec(mut self, codec: JsonCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Set the request layout.
    #[must_use]
    pub fn with_layout(mut self, layout: RequestLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the heartbeat style.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatStyle) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set the authentication scheme.
    #[must_use]
    pub const fn with_auth(mut self, auth: HmacAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Override the subscription-to-routing-key mapping.
    #[must_use]
    pub fn with_router<F>(mut self, router: F) -> Self
    where
        F: Fn(&SubscriptionKey) -> RoutingKey + Send + Sync + 'static,
    {
        self.router = Some(Arc::new(router));
        self
    }

    /// Frame codec.
    #[must_use]
    pub const fn codec(&self) -> &JsonCodec {
        &self.codec
    }

    /// Heartbeat style.
    #[must_use]
    pub const fn heartbeat(&self) -> &HeartbeatStyle {
        &self.heartbeat
    }

    /// Authentication scheme, if any.
    #[must_use]
    pub const fn auth(&self) -> Option<&HmacAuth> {
        self.auth.as_ref()
    }

    /// Routing key that frames for `key` arrive under.
    #[must_use]
    pub fn routing_key(&self, key: &SubscriptionKey) -> RoutingKey {
        self.router
            .as_ref()
            .map_or_else(|| RoutingKey::from(key), |router| router(key))
    }

    /// Encode a subscribe or unsubscribe request.
    ///
    /// Private subscriptions are signed when the scheme signs per request.
    ///
    /// # Errors
    ///
    /// Returns an error if a private request needs credentials that are not
    /// configured, or signing fails.
    pub fn encode_request(
        &self,
        op: SubscriptionOp,
        subscription: &Subscription,
        credentials: Option<&Credentials>,
        timestamp: i64,
    ) -> Result<String, AuthError> {
        let channel = subscription.key().channel();
        let mut body = Map::new();
        body.insert(
            self.layout.op_field.clone(),
            Value::from(self.layout.op_value(op)),
        );
        body.insert(self.layout.channel_field.clone(), Value::from(channel));
        if !subscription.payload().is_null() {
            body.insert(
                self.layout.params_field.clone(),
                subscription.payload().clone(),
            );
        }

        if subscription.is_private()
            && let Some(auth) = &self.auth
        {
            let credentials = credentials.ok_or(AuthError::MissingCredentials)?;
            if let Some(signature) = auth.request_signature(credentials, channel, op, timestamp)? {
                body.insert(self.layout.signature_field.clone(), Value::from(signature));
                body.insert(self.layout.time_field.clone(), Value::from(timestamp));
            }
        }

        Ok(Value::Object(body).to_string())
    }

    /// Login frame for a new connection, if the scheme uses one.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheme needs credentials that are not
    /// configured, or signing fails.
    pub fn login_request(
        &self,
        credentials: Option<&Credentials>,
        timestamp: i64,
    ) -> Result<Option<String>, AuthError> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };

        if auth.mode() == AuthMode::PerRequest {
            return Ok(None);
        }

        let credentials = credentials.ok_or(AuthError::MissingCredentials)?;
        auth.login_request(credentials, timestamp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::infrastructure::stream::auth::{HashAlgorithm, SignatureEncoding};

    fn ticker() -> Subscription {
        Subscription::new(
            SubscriptionKey::new("ticker").with_instrument("BTCUSD"),
            json!(["BTCUSD"]),
        )
    }

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).unwrap()
    }

    #[test]
    fn default_layout_request() {
        let protocol = Protocol::new();
        let request = protocol
            .encode_request(SubscriptionOp::Subscribe, &ticker(), None, 0)
            .unwrap();

        assert_eq!(
            parse(&request),
            json!({"op": "subscribe", "channel": "ticker", "params": ["BTCUSD"]})
        );
    }

    #[test]
    fn event_payload_layout() {
        let protocol = Protocol::new().with_layout(RequestLayout::event_payload());
        let request = protocol
            .encode_request(SubscriptionOp::Unsubscribe, &ticker(), None, 0)
            .unwrap();

        assert_eq!(
            parse(&request),
            json!({"event": "unsubscribe", "channel": "ticker", "payload": ["BTCUSD"]})
        );
    }

    #[test]
    fn null_payload_is_omitted() {
        let sub = Subscription::new(SubscriptionKey::new("heartbeat"), Value::Null);
        let request = Protocol::new()
            .encode_request(SubscriptionOp::Subscribe, &sub, None, 0)
            .unwrap();
        assert_eq!(parse(&request), json!({"op": "subscribe", "channel": "heartbeat"}));
    }

    #[test]
    fn private_request_is_signed() {
        let auth = HmacAuth::per_request(HashAlgorithm::Sha512, SignatureEncoding::Hex);
        let protocol = Protocol::new().with_auth(auth);
        let creds = Credentials::new("k", "s");
        let sub = Subscription::new(SubscriptionKey::new("spot.orders"), json!(["BTC_USDT"])).private();

        let request = parse(
            &protocol
                .encode_request(SubscriptionOp::Subscribe, &sub, Some(&creds), 42)
                .unwrap(),
        );

        let expected = auth
            .sign("s", "channel=spot.orders&event=subscribe&time=42")
            .unwrap();
        assert_eq!(request["signature"], json!(expected));
        assert_eq!(request["time"], json!(42));
    }

    #[test]
    fn private_request_without_credentials_fails() {
        let auth = HmacAuth::per_request(HashAlgorithm::Sha256, SignatureEncoding::Hex);
        let protocol = Protocol::new().with_auth(auth);
        let sub = Subscription::new(SubscriptionKey::new("orders"), json!({})).private();

        assert!(matches!(
            protocol.encode_request(SubscriptionOp::Subscribe, &sub, None, 0),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn public_request_is_never_signed() {
        let auth = HmacAuth::per_request(HashAlgorithm::Sha256, SignatureEncoding::Hex);
        let protocol = Protocol::new().with_auth(auth);
        let request = parse(
            &protocol
                .encode_request(SubscriptionOp::Subscribe, &ticker(), None, 0)
                .unwrap(),
        );
        assert!(request.get("signature").is_none());
    }

    #[test]
    fn login_request_by_scheme() {
        let creds = Credentials::new("k", "s");

        assert!(Protocol::new().login_request(Some(&creds), 1).unwrap().is_none());

        let per_request = Protocol::new().with_auth(HmacAuth::per_request(
            HashAlgorithm::Sha256,
            SignatureEncoding::Hex,
        ));
        assert!(per_request.login_request(None, 1).unwrap().is_none());

        let login = Protocol::new().with_auth(HmacAuth::login_frame(
            HashAlgorithm::Sha256,
            SignatureEncoding::Base64,
            true,
        ));
        assert!(login.login_request(Some(&creds), 1).unwrap().is_some());
        assert!(matches!(
            login.login_request(None, 1),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn custom_router() {
        let protocol = Protocol::new().with_router(|key| {
            RoutingKey::new(format!(
                "{}-{}.{}",
                key.channel(),
                key.mode().unwrap_or_default(),
                key.instrument().unwrap_or_default()
            ))
        });
        let key = SubscriptionKey::new("book")
            .with_instrument("XBT/USD")
            .with_mode("10");

        assert_eq!(protocol.routing_key(&key).as_str(), "book-10.XBT/USD");
        assert_eq!(
            Protocol::new().routing_key(&key).as_str(),
            "book.XBT/USD"
        );
    }
}
