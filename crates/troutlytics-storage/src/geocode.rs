use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use troutlytics_core::Coordinates;

pub const GOOGLE_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Resolves a free-text place name to coordinates. `Ok(None)` means the provider had no result.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocoding request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from geocoder")]
    HttpStatus { status: u16 },
    #[error("geocoder rate limit exceeded")]
    RateLimited,
    #[error("geocoder returned {status}: {message}")]
    Provider { status: String, message: String },
    #[error("no geocoder configured")]
    Unconfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// The geocoding API signals quota pressure with 429 and transient faults with 408 or 5xx.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        other if other.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Doubles from `base_delay` per attempt, never past `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(2u32.saturating_pow(exponent))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl GeocoderConfig {
    pub fn google(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: GOOGLE_GEOCODE_ENDPOINT.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: Geometry,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

enum Reply {
    Done(Option<Coordinates>),
    RetryLater,
}

fn interpret(response: GeocodeResponse) -> Result<Reply, GeocodeError> {
    match response.status.as_str() {
        "OK" => Ok(Reply::Done(response.results.first().map(|r| Coordinates {
            latitude: r.geometry.location.lat,
            longitude: r.geometry.location.lng,
        }))),
        "ZERO_RESULTS" => Ok(Reply::Done(None)),
        "OVER_QUERY_LIMIT" => Ok(Reply::RetryLater),
        other => Err(GeocodeError::Provider {
            status: other.to_string(),
            message: response.error_message.unwrap_or_default(),
        }),
    }
}

/// Google Geocoding API client with bounded retries.
#[derive(Debug)]
pub struct HttpGeocoder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    backoff: BackoffPolicy,
}

impl HttpGeocoder {
    pub fn new(config: GeocoderConfig) -> Result<Self, GeocodeError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        Ok(Self {
            client: builder.build()?,
            endpoint: config.endpoint,
            api_key: config.api_key,
            backoff: config.backoff,
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let span = info_span!("geocode", query);
        async move {
            for attempt in 0..=self.backoff.max_retries {
                let last_attempt = attempt == self.backoff.max_retries;
                let sent = self
                    .client
                    .get(&self.endpoint)
                    .query(&[("address", query), ("key", self.api_key.as_str())])
                    .send()
                    .await;

                let resp = match sent {
                    Ok(resp) => resp,
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable && !last_attempt {
                            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        return Err(GeocodeError::Request(err));
                    }
                };

                let status = resp.status();
                if !status.is_success() {
                    if classify_status(status) == RetryDisposition::Retryable && !last_attempt {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        return Err(GeocodeError::RateLimited);
                    }
                    return Err(GeocodeError::HttpStatus {
                        status: status.as_u16(),
                    });
                }

                match interpret(resp.json::<GeocodeResponse>().await?)? {
                    Reply::Done(coordinates) => {
                        debug!(found = coordinates.is_some(), "geocoder replied");
                        return Ok(coordinates);
                    }
                    Reply::RetryLater if !last_attempt => {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    }
                    Reply::RetryLater => return Err(GeocodeError::RateLimited),
                }
            }
            Err(GeocodeError::RateLimited)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: serde_json::Value) -> GeocodeResponse {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn ok_reply_takes_first_result() {
        let reply = interpret(parse(serde_json::json!({
            "status": "OK",
            "results": [
                {"geometry": {"location": {"lat": 45.8, "lng": -122.5}}},
                {"geometry": {"location": {"lat": 0.0, "lng": 0.0}}}
            ]
        })))
        .unwrap();
        match reply {
            Reply::Done(Some(c)) => {
                assert_eq!(c.latitude, 45.8);
                assert_eq!(c.longitude, -122.5);
            }
            _ => panic!("expected coordinates"),
        }
    }

    #[test]
    fn zero_results_is_not_an_error() {
        let reply = interpret(parse(serde_json::json!({"status": "ZERO_RESULTS"}))).unwrap();
        assert!(matches!(reply, Reply::Done(None)));
    }

    #[test]
    fn quota_replies_are_retried_and_denials_are_errors() {
        let reply = interpret(parse(serde_json::json!({"status": "OVER_QUERY_LIMIT"}))).unwrap();
        assert!(matches!(reply, Reply::RetryLater));

        let err = interpret(parse(serde_json::json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        })))
        .err()
        .unwrap();
        assert!(matches!(err, GeocodeError::Provider { ref status, .. } if status == "REQUEST_DENIED"));
    }

    #[test]
    fn geocoder_backoff_doubles_up_to_five_seconds() {
        let policy = GeocoderConfig::google("key").backoff;
        assert_eq!(policy.max_retries, 3);

        let delays: Vec<_> = (0..5).map(|attempt| policy.delay_for_attempt(attempt)).collect();
        assert_eq!(
            delays,
            [250, 500, 1000, 2000, 4000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[test]
    fn quota_and_transient_statuses_are_retried() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::REQUEST_TIMEOUT), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }
}
