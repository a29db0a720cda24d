//! Collector transport
//!
//! Sync hands one batch at a time to a [`Transport`]. The default
//! [`HttpTransport`] posts it as JSON with a bearer key; timeouts are the
//! client's concern.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::config::TelemetryConfig;

/// Request to the collector
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub url: String,
    pub body: Value,
}

/// Collector response
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Collector clock reading, if the response carries one
    pub fn server_ets(&self) -> Option<i64> {
        self.body.get("ets").and_then(Value::as_i64)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a request; `Err` means it never got an answer
    async fn fetch(&self, request: ApiRequest) -> anyhow::Result<ApiResponse>;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &TelemetryConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: ApiRequest) -> anyhow::Result<ApiResponse> {
        let mut builder = self.client.post(&request.url).json(&request.body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        // Collectors may answer with an empty or non-JSON body
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        tracing::debug!(url = %request.url, status, "collector responded");
        Ok(ApiResponse { status, body })
    }
}

/// Remote device registration
#[async_trait]
pub trait DeviceRegister: Send + Sync {
    async fn register_device(&self) -> anyhow::Result<()>;
}

/// Registers the device by posting its id through a [`Transport`]
pub struct HttpDeviceRegister<T> {
    transport: T,
    url: String,
    device_id: String,
    producer_id: String,
}

impl<T: Transport> HttpDeviceRegister<T> {
    pub fn new(transport: T, config: &TelemetryConfig, device_id: impl Into<String>) -> Self {
        let device_id = device_id.into();
        Self {
            transport,
            url: config.device_register_url(&device_id),
            device_id,
            producer_id: config.producer_id.clone(),
        }
    }
}

#[async_trait]
impl<T: Transport> DeviceRegister for HttpDeviceRegister<T> {
    async fn register_device(&self) -> anyhow::Result<()> {
        let request = ApiRequest {
            url: self.url.clone(),
            body: serde_json::json!({
                "id": "api.device.register",
                "request": {
                    "did": self.device_id,
                    "producer": self.producer_id,
                }
            }),
        };

        let response = self.transport.fetch(request).await?;
        if !response.is_success() {
            anyhow::bail!("device registration rejected with status {}", response.status);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        requests: Mutex<Vec<ApiRequest>>,
        status: u16,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn fetch(&self, request: ApiRequest) -> anyhow::Result<ApiResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(ApiResponse {
                status: self.status,
                body: Value::Null,
            })
        }
    }

    #[test]
    fn test_response_helpers() {
        let response = ApiResponse::ok(json!({"ets": 1700000000000i64}));
        assert!(response.is_success());
        assert_eq!(response.server_ets(), Some(1700000000000));

        let rejected = ApiResponse {
            status: 503,
            body: Value::Null,
        };
        assert!(!rejected.is_success());
        assert_eq!(rejected.server_ets(), None);
    }

    #[test]
    fn test_http_transport_builds() {
        let transport = HttpTransport::new(&TelemetryConfig::default());
        assert!(transport.is_ok());
    }

    #[tokio::test]
    async fn test_device_register_posts_device_id() {
        let config = TelemetryConfig {
            host: "https://collector.example".to_string(),
            ..Default::default()
        };
        let register = HttpDeviceRegister::new(
            Recorder {
                requests: Mutex::new(Vec::new()),
                status: 200,
            },
            &config,
            "device-1",
        );

        register.register_device().await.unwrap();

        let requests = register.transport.requests.lock().unwrap();
        assert_eq!(
            requests[0].url,
            "https://collector.example/api/v3/device/register/device-1"
        );
        assert_eq!(requests[0].body["request"]["did"], "device-1");
    }

    #[tokio::test]
    async fn test_device_register_rejection_is_error() {
        let register = HttpDeviceRegister::new(
            Recorder {
                requests: Mutex::new(Vec::new()),
                status: 401,
            },
            &TelemetryConfig::default(),
            "device-1",
        );

        assert!(register.register_device().await.is_err());
    }
}
