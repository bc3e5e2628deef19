#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use dyntable::{Attributes, Engine, EngineConfig, Error, GeoPoint, Geocoder, OwnerId, Value};
use tracing_subscriber::EnvFilter;

pub const OWNER: OwnerId = OwnerId::from_raw(1);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn engine() -> Engine {
    init_tracing();
    Engine::open_in_memory().expect("open in-memory engine")
}

pub fn engine_with_geocoder(geocoder: Arc<StubGeocoder>) -> Engine {
    engine().with_geocoder(geocoder)
}

pub fn create_temp_engine(name: &str) -> (tempfile::TempDir, PathBuf, Engine) {
    init_tracing();
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let engine = open_file_engine(&path);
    (dir, path, engine)
}

pub fn open_file_engine(path: &std::path::Path) -> Engine {
    let mut config = EngineConfig::default();
    config.database.path = Some(path.to_path_buf());
    Engine::open(config).expect("open file engine")
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

pub fn attrs(pairs: &[(&str, Value)]) -> Attributes {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// Geocoder answering from a fixed address book. The address `"fail"`
/// produces an error.
#[derive(Default)]
pub struct StubGeocoder {
    points: HashMap<String, GeoPoint>,
    calls: AtomicUsize,
}

impl StubGeocoder {
    pub fn new(entries: &[(&str, f64, f64)]) -> Arc<Self> {
        let points = entries
            .iter()
            .map(|(address, lat, lon)| {
                (address.to_string(), GeoPoint::new(*lat, *lon).expect("valid point"))
            })
            .collect();
        Arc::new(Self { points, calls: AtomicUsize::new(0) })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Geocoder for StubGeocoder {
    fn geocode(&self, address: &str) -> dyntable::Result<Option<GeoPoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if address == "fail" {
            return Err(Error::Geocoding("stub failure".into()));
        }
        Ok(self.points.get(address).copied())
    }
}

/// Rounds to `places` decimals.
pub fn round(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}
