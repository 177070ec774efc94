//! HTTP proxies for services registered on a service server.
//!
//! Calls are `POST {base_url}/{workspace}/services/{service_id}/{method}` with
//! the keyword arguments as a JSON body. A reply of the form
//! `{"success": false, "message": ...}` is treated as a rejection.
//!
//! Timeouts are per request: physical moves get the move timeout, everything
//! else the call timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use super::{
    CallResult, Incubator, Microscope, ProxyRef, RoboticArm, ScanRequest, ScanStatus,
    ServiceCallError, ServiceConnector, ServiceProxy, PONG,
};
use crate::domain::{SampleLocation, ServiceKind, SlotReport};

/// JSON client for one remote service
#[derive(Clone)]
pub struct HttpServiceClient {
    client: reqwest::Client,
    base_url: String,
    workspace: String,
    service_id: String,
    token: Option<String>,
    call_timeout: Duration,
    move_timeout: Duration,
}

impl HttpServiceClient {
    pub fn new(
        base_url: impl Into<String>,
        workspace: impl Into<String>,
        service_id: impl Into<String>,
        token: Option<String>,
        call_timeout: Duration,
        move_timeout: Duration,
    ) -> CallResult<Self> {
        let service_id = service_id.into();
        let client = reqwest::Client::builder()
            .connect_timeout(call_timeout)
            .build()
            .map_err(|e| ServiceCallError::Transport {
                service: service_id.clone(),
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            workspace: workspace.into(),
            service_id,
            token,
            call_timeout,
            move_timeout,
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/{}/services/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.workspace,
            self.service_id,
            method
        )
    }

    /// Call a service method and decode its reply
    async fn call<T: DeserializeOwned>(&self, method: &str, args: Value) -> CallResult<T> {
        self.call_within(method, args, self.call_timeout).await
    }

    async fn call_within<T: DeserializeOwned>(
        &self,
        method: &str,
        args: Value,
        limit: Duration,
    ) -> CallResult<T> {
        let mut request = self
            .client
            .post(self.method_url(method))
            .timeout(limit)
            .json(&args);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_reqwest(method, e, limit))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ServiceCallError::Rejected {
                service: self.service_id.clone(),
                message: format!("{} returned {}: {}", method, status, text.trim()),
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| self.map_reqwest(method, e, limit))?;
        self.check_reply(method, &value)?;

        serde_json::from_value(value).map_err(|e| ServiceCallError::Rejected {
            service: self.service_id.clone(),
            message: format!("{} returned an unexpected reply: {}", method, e),
        })
    }

    /// Call a method that physically moves a sample; its reply carries no data
    async fn call_move(&self, method: &str, args: Value) -> CallResult<()> {
        let _: Value = self.call_within(method, args, self.move_timeout).await?;
        Ok(())
    }

    /// Call a method whose reply carries no data
    async fn call_unit(&self, method: &str, args: Value) -> CallResult<()> {
        let _: Value = self.call(method, args).await?;
        Ok(())
    }

    fn check_reply(&self, method: &str, value: &Value) -> CallResult<()> {
        if value.get("success").and_then(Value::as_bool) == Some(false) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no message");
            return Err(ServiceCallError::Rejected {
                service: self.service_id.clone(),
                message: format!("{} failed: {}", method, message),
            });
        }
        Ok(())
    }

    fn map_reqwest(&self, method: &str, error: reqwest::Error, limit: Duration) -> ServiceCallError {
        if error.is_timeout() {
            ServiceCallError::Timeout {
                service: self.service_id.clone(),
                after: limit,
            }
        } else if error.is_decode() {
            ServiceCallError::Rejected {
                service: self.service_id.clone(),
                message: format!("{} reply is not JSON: {}", method, error),
            }
        } else {
            ServiceCallError::Transport {
                service: self.service_id.clone(),
                message: format!("{}: {}", method, error),
            }
        }
    }
}

#[async_trait]
impl ServiceProxy for HttpServiceClient {
    fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn ping(&self) -> CallResult<String> {
        self.call("ping", json!({})).await
    }

    async fn get_status(&self) -> CallResult<Value> {
        self.call("get_status", json!({})).await
    }
}

#[async_trait]
impl Incubator for HttpServiceClient {
    async fn get_sample_from_slot_to_transfer_station(&self, slot: u8) -> CallResult<()> {
        self.call_move("get_sample_from_slot_to_transfer_station", json!({ "slot": slot }))
            .await
    }

    async fn put_sample_from_transfer_station_to_slot(&self, slot: u8) -> CallResult<()> {
        self.call_move("put_sample_from_transfer_station_to_slot", json!({ "slot": slot }))
            .await
    }

    async fn update_sample_location(&self, slot: u8, location: SampleLocation) -> CallResult<()> {
        self.call_unit(
            "update_sample_location",
            json!({ "slot": slot, "location": location.to_string() }),
        )
        .await
    }

    async fn get_sample_location(&self, slot: u8) -> CallResult<SampleLocation> {
        let raw: String = self.call("get_sample_location", json!({ "slot": slot })).await?;
        Ok(raw.parse().unwrap_or(SampleLocation::Unknown))
    }

    async fn get_well_plate_type(&self, slot: u8) -> CallResult<String> {
        let value: Value = self.call("get_well_plate_type", json!({ "slot": slot })).await?;
        Ok(match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    async fn get_slot_information(&self) -> CallResult<Vec<SlotReport>> {
        self.call("get_slot_information", json!({})).await
    }
}

#[async_trait]
impl RoboticArm for HttpServiceClient {
    async fn incubator_to_microscope(&self, station: u8) -> CallResult<()> {
        self.call_move("incubator_to_microscope", json!({ "microscope_id": station }))
            .await
    }

    async fn microscope_to_incubator(&self, station: u8) -> CallResult<()> {
        self.call_move("microscope_to_incubator", json!({ "microscope_id": station }))
            .await
    }
}

#[async_trait]
impl Microscope for HttpServiceClient {
    async fn home_stage(&self) -> CallResult<()> {
        self.call_unit("home_stage", json!({})).await
    }

    async fn return_stage(&self) -> CallResult<()> {
        self.call_unit("return_stage", json!({})).await
    }

    async fn scan_start(&self, request: &ScanRequest) -> CallResult<Value> {
        self.call("scan_start", json!({ "config": request })).await
    }

    async fn scan_get_status(&self) -> CallResult<ScanStatus> {
        self.call("scan_get_status", json!({})).await
    }
}

/// Connects to services on one server/workspace
#[derive(Debug, Clone)]
pub struct HttpConnector {
    base_url: String,
    workspace: String,
    token: Option<String>,
    call_timeout: Duration,
    move_timeout: Duration,
}

impl HttpConnector {
    /// `move_timeout` bounds the incubator and arm moves; the transport worker
    /// applies its own load/unload limit on top
    pub fn new(
        base_url: impl Into<String>,
        workspace: impl Into<String>,
        token: Option<String>,
        call_timeout: Duration,
        move_timeout: Duration,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            workspace: workspace.into(),
            token,
            call_timeout,
            move_timeout,
        }
    }
}

#[async_trait]
impl ServiceConnector for HttpConnector {
    async fn connect(&self, kind: ServiceKind, service_id: &str) -> CallResult<ProxyRef> {
        let client = HttpServiceClient::new(
            self.base_url.clone(),
            self.workspace.clone(),
            service_id,
            self.token.clone(),
            self.call_timeout,
            self.move_timeout,
        )?;

        let reply = client.ping().await?;
        if reply != PONG {
            return Err(ServiceCallError::Rejected {
                service: service_id.to_string(),
                message: format!("unexpected ping reply '{}'", reply),
            });
        }

        tracing::debug!(service = service_id, %kind, "Service proxy established");

        let client = Arc::new(client);
        Ok(match kind {
            ServiceKind::Incubator => ProxyRef::Incubator(client),
            ServiceKind::RoboticArm => ProxyRef::RoboticArm(client),
            ServiceKind::Microscope => ProxyRef::Microscope(client),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpServiceClient {
        HttpServiceClient::new(
            "http://localhost:9527/",
            "reef-imaging",
            "incubator-control",
            None,
            Duration::from_secs(5),
            Duration::from_secs(120),
        )
        .unwrap()
    }

    #[test]
    fn test_method_url() {
        assert_eq!(
            client().method_url("ping"),
            "http://localhost:9527/reef-imaging/services/incubator-control/ping"
        );
    }

    #[test]
    fn test_failure_reply_is_rejected() {
        let client = client();
        let reply = json!({"success": false, "message": "slot empty"});
        let err = client.check_reply("get_sample_from_slot_to_transfer_station", &reply);
        assert!(matches!(err, Err(ServiceCallError::Rejected { .. })));

        assert!(client.check_reply("ping", &json!("pong")).is_ok());
        assert!(client.check_reply("x", &json!({"success": true})).is_ok());
    }

    /// Local server that answers every request with `body` after `delay`
    async fn slow_server(delay: Duration, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_moves_outlast_the_call_timeout() {
        let url = slow_server(Duration::from_millis(500), r#"{"success": true}"#).await;
        let arm = HttpServiceClient::new(
            url,
            "reef-imaging",
            "robotic-arm-control",
            None,
            Duration::from_millis(200),
            Duration::from_secs(5),
        )
        .unwrap();

        arm.incubator_to_microscope(1).await.unwrap();

        let err = arm.get_status().await.unwrap_err();
        assert!(matches!(
            err,
            ServiceCallError::Timeout { after, .. } if after == Duration::from_millis(200)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let connector = HttpConnector::new(
            "http://127.0.0.1:9",
            "reef-imaging",
            None,
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let err = connector
            .connect(ServiceKind::Incubator, "incubator-control")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceCallError::Transport { .. } | ServiceCallError::Timeout { .. }
        ));
    }
}
