use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;

use crate::codec::{decode_response, EncodedRequest, InferResponse, ServerTimes};
use crate::error::{BenchError, Result};

pub type SendFuture<'a> = Pin<Box<dyn Future<Output = Result<InferResponse>> + Send + 'a>>;

/// Which endpoint route a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Untimed warm-up traffic, sent to the bare predict route
    Warmup,
    /// Timed traffic, sent to the task-specific predict route
    Measured,
}

/// Transport adapter for the serving endpoint.
pub trait InferenceSender: Send + Sync {
    fn name(&self) -> &'static str;

    fn send<'a>(&'a self, request: &'a EncodedRequest, route: Route) -> SendFuture<'a>;
}

/// Sender that answers after a fixed delay with a consistent breakdown.
pub struct MockSender {
    delay: Duration,
}

impl MockSender {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Breakdown attributed to a request served in `delay`.
    pub fn server_times(delay: Duration) -> ServerTimes {
        let total = delay.as_secs_f64();
        ServerTimes {
            preprocessing_time: total * 0.10,
            batching_time: total * 0.20,
            inference_time: total * 0.50,
            postprocessing_time: total * 0.10,
            server_end2end_time: total * 0.95,
        }
    }
}

impl InferenceSender for MockSender {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn send<'a>(&'a self, _request: &'a EncodedRequest, _route: Route) -> SendFuture<'a> {
        Box::pin(async move {
            sleep(self.delay).await;
            Ok(InferResponse {
                response: serde_json::Value::Null,
                times: Self::server_times(self.delay),
            })
        })
    }
}

/// Multipart HTTP sender for the predict endpoint.
pub struct HttpSender {
    client: reqwest::Client,
    warmup_url: String,
    predict_url: String,
    timeout: Duration,
}

impl HttpSender {
    pub fn new(base_url: &str, task: &str, timeout_ms: u64) -> Result<Self> {
        let timeout = Duration::from_millis(timeout_ms.max(1));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .map_err(|e| BenchError::Setup(format!("failed to build HTTP client: {e}")))?;

        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            warmup_url: format!("{base}/predict"),
            predict_url: format!("{base}/predict/{}", task.trim_matches('/')),
            timeout,
        })
    }

    pub fn url_for(&self, route: Route) -> &str {
        match route {
            Route::Warmup => &self.warmup_url,
            Route::Measured => &self.predict_url,
        }
    }
}

impl InferenceSender for HttpSender {
    fn name(&self) -> &'static str {
        "http"
    }

    fn send<'a>(&'a self, request: &'a EncodedRequest, route: Route) -> SendFuture<'a> {
        Box::pin(async move {
            let part = reqwest::multipart::Part::bytes(request.body().to_vec())
                .file_name(EncodedRequest::FIELD_NAME);
            let form = reqwest::multipart::Form::new().part(EncodedRequest::FIELD_NAME, part);

            let response = match self.client.post(self.url_for(route)).multipart(form).send().await {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    return Err(BenchError::transport(format!(
                        "request timed out after {}ms",
                        self.timeout.as_millis()
                    )))
                }
                Err(e) => return Err(BenchError::transport(e.to_string())),
            };

            let status = response.status();
            if !status.is_success() {
                return Err(BenchError::transport(format!("endpoint returned {status}")));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| BenchError::transport(format!("failed to read response: {e}")))?;
            decode_response(&body)
        })
    }
}
