//! # Geocoding
//!
//! Address → coordinate resolution is a black box behind the [`Geocoder`]
//! trait. Three implementations ship with the crate:
//!
//! - [`HttpGeocoder`]: a Google-style JSON geocoding API over blocking HTTP,
//!   with a per-request timeout and a bounded number of attempts
//! - [`CachingGeocoder`]: an LRU cache in front of another geocoder
//! - [`NoopGeocoder`]: never resolves anything (the default without an
//!   endpoint)
//!
//! ## Response Shape
//!
//! ```json
//! { "status": "OK",
//!   "results": [ { "geometry": { "location": { "lat": 40.42, "lng": -3.70 } } } ] }
//! ```
//!
//! `ZERO_RESULTS` is a successful "no match". Any other non-`OK` status is an
//! error. Only transient failures are retried: timeouts, connection errors,
//! 5xx answers and the `OVER_QUERY_LIMIT` / `UNKNOWN_ERROR` statuses.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::GeocoderSettings;
use crate::error::{Error, Result};
use crate::geometry::GeoPoint;

// =============================================================================
// Trait
// =============================================================================

/// Resolves a free-text address to a point.
///
/// `Ok(None)` means the service found nothing. Implementations are called
/// from worker threads without any engine lock held.
pub trait Geocoder: Send + Sync {
    fn geocode(&self, address: &str) -> Result<Option<GeoPoint>>;
}

impl<G: Geocoder + ?Sized> Geocoder for Arc<G> {
    fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        (**self).geocode(address)
    }
}

/// A geocoder that never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGeocoder;

impl Geocoder for NoopGeocoder {
    fn geocode(&self, _address: &str) -> Result<Option<GeoPoint>> {
        Ok(None)
    }
}

// =============================================================================
// HTTP
// =============================================================================

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: GeocodeLocation,
}

#[derive(Debug, Deserialize)]
struct GeocodeLocation {
    lat: f64,
    lng: f64,
}

/// Statuses the service documents as worth another attempt.
const RETRYABLE_STATUSES: &[&str] = &["OVER_QUERY_LIMIT", "UNKNOWN_ERROR"];

/// A failed lookup, split by whether another attempt may succeed.
#[derive(Debug)]
enum Failure {
    /// Timeouts, connection errors, 5xx answers, rate limiting.
    Transient(Error),
    /// Rejected requests (4xx, denied keys) and malformed bodies.
    Permanent(Error),
}

impl Failure {
    fn into_error(self) -> Error {
        match self {
            Failure::Transient(e) | Failure::Permanent(e) => e,
        }
    }
}

impl From<reqwest::Error> for Failure {
    fn from(error: reqwest::Error) -> Self {
        let transient = error.is_timeout()
            || error.is_connect()
            || error.status().is_some_and(|s| s.is_server_error());
        if transient {
            Failure::Transient(error.into())
        } else {
            Failure::Permanent(error.into())
        }
    }
}

fn decode(body: &str) -> std::result::Result<Option<GeoPoint>, Failure> {
    let response: GeocodeResponse = serde_json::from_str(body).map_err(|e| {
        Failure::Permanent(Error::Geocoding(format!("malformed response: {e}")))
    })?;

    match response.status.as_str() {
        "OK" => Ok(response
            .results
            .first()
            .and_then(|r| GeoPoint::new(r.geometry.location.lat, r.geometry.location.lng))),
        "ZERO_RESULTS" => Ok(None),
        other => {
            let error = Error::Geocoding(format!("service returned status {other}"));
            Err(if RETRYABLE_STATUSES.contains(&other) {
                Failure::Transient(error)
            } else {
                Failure::Permanent(error)
            })
        }
    }
}

/// Interprets a geocoding response body. The first result wins.
pub fn parse_response(body: &str) -> Result<Option<GeoPoint>> {
    decode(body).map_err(Failure::into_error)
}

/// Runs `attempt` until it succeeds, fails permanently, or `max_attempts`
/// are used up, sleeping `backoff` between tries.
fn with_retries<T>(
    max_attempts: u32,
    backoff: Duration,
    mut attempt: impl FnMut() -> std::result::Result<T, Failure>,
) -> Result<T> {
    let mut tries = 1;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(Failure::Transient(e)) if tries < max_attempts => {
                debug!(attempt = tries, error = %e, "geocoding attempt failed, retrying");
                thread::sleep(backoff);
                tries += 1;
            }
            Err(failure) => return Err(failure.into_error()),
        }
    }
}

/// Geocoder backed by an HTTP JSON API.
#[derive(Debug, Clone)]
pub struct HttpGeocoder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpGeocoder {
    /// Builds a geocoder for `endpoint` using the timeout and retry policy
    /// of `settings`.
    pub fn new(endpoint: impl Into<String>, settings: &GeocoderSettings) -> Result<Self> {
        let client = Client::builder().timeout(settings.timeout()).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: settings.api_key.clone(),
            max_attempts: settings.max_attempts.max(1),
            backoff: settings.backoff(),
        })
    }

    fn request(&self, address: &str) -> std::result::Result<Option<GeoPoint>, Failure> {
        let mut query: Vec<(&str, &str)> = vec![("address", address)];
        if let Some(key) = &self.api_key {
            query.push(("key", key.as_str()));
        }
        let body = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()?
            .error_for_status()?
            .text()?;
        decode(&body)
    }
}

impl Geocoder for HttpGeocoder {
    fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        with_retries(self.max_attempts, self.backoff, || self.request(address))
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Caches successful lookups (misses included) of another geocoder.
pub struct CachingGeocoder<G> {
    inner: G,
    cache: Mutex<LruCache<String, Option<GeoPoint>>>,
}

impl<G: Geocoder> CachingGeocoder<G> {
    pub fn new(inner: G, capacity: NonZeroUsize) -> Self {
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

impl<G: Geocoder> Geocoder for CachingGeocoder<G> {
    fn geocode(&self, address: &str) -> Result<Option<GeoPoint>> {
        let key = address.trim().to_lowercase();
        if let Some(hit) = self.cache.lock().get(&key) {
            return Ok(*hit);
        }
        // Not held across the call: lookups of other addresses proceed.
        let point = self.inner.geocode(address)?;
        self.cache.lock().put(key, point);
        Ok(point)
    }
}

/// Builds the geocoder described by `settings`.
pub fn from_settings(settings: &GeocoderSettings) -> Result<Arc<dyn Geocoder>> {
    let Some(endpoint) = &settings.endpoint else {
        return Ok(Arc::new(NoopGeocoder));
    };
    let http = HttpGeocoder::new(endpoint.clone(), settings)?;
    Ok(match NonZeroUsize::new(settings.cache_capacity) {
        Some(capacity) => Arc::new(CachingGeocoder::new(http, capacity)),
        None => Arc::new(http),
    })
}
