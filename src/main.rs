use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::middleware::Compress;
use actix_web::{web, App, HttpResponse, HttpServer, Result};
use log::{debug, error, info};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::Registry;
use tokio::time::interval;

use apcsense::nis::StatusRecord;
use apcsense::sensor::{power_usage, UpsPoller};
use apcsense::units;

/// Identity fields folded into the info metric rather than exported as gauges.
const INFO_KEYS: &[&str] = &[
    "APC", "HOSTNAME", "UPSNAME", "VERSION", "CABLE", "MODEL", "UPSMODE", "DRIVER", "APCMODEL",
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UpsInfoLabels {
    pub apc: String,
    pub hostname: String,
    pub upsname: String,
    pub version: String,
    pub cable: String,
    pub model: String,
    pub upsmode: String,
    pub driver: String,
    pub apcmodel: String,
}

pub struct AppState {
    pub registry: Registry,
}

pub async fn metrics_handler(state: web::Data<Arc<Mutex<AppState>>>) -> Result<HttpResponse> {
    let state = state.lock().unwrap();
    let mut body = String::new();
    encode(&mut body, &state.registry).unwrap();
    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(body))
}

fn label(record: &StatusRecord, key: &str) -> String {
    record.get(key).unwrap_or_default().to_string()
}

/// Rebuild the registry from one poll. `stats` is `None` when the poll
/// failed; the `up` gauge carries the availability signal either way.
fn build_registry(stats: Option<&StatusRecord>, poller: &UpsPoller) -> Registry {
    let mut registry = Registry::default();

    let up: Gauge<f64, AtomicU64> = Gauge::default();
    up.set(if stats.is_some() { 1.0 } else { 0.0 });
    registry.register("apcupsd_up", "Whether the last status poll succeeded", up);

    let Some(record) = stats else {
        return registry;
    };

    let info_labels = UpsInfoLabels {
        apc: label(record, "APC"),
        hostname: label(record, "HOSTNAME"),
        upsname: label(record, "UPSNAME"),
        version: label(record, "VERSION"),
        cable: label(record, "CABLE"),
        model: label(record, "MODEL"),
        upsmode: label(record, "UPSMODE"),
        driver: label(record, "DRIVER"),
        apcmodel: label(record, "APCMODEL"),
    };
    registry.register(
        "apcupsd",
        "APC UPS daemon information",
        Info::new(info_labels),
    );

    for spec in poller.sensors() {
        if INFO_KEYS.contains(&spec.key.as_str()) {
            continue;
        }
        let Some(value) = record.get(&spec.key) else {
            continue;
        };
        let Ok(numeric) = value.parse::<f64>() else {
            continue;
        };

        let gauge: Gauge<f64, AtomicU64> = Gauge::default();
        gauge.set(numeric);
        let name = format!("apcupsd_{}", spec.key.to_lowercase());
        let help = match spec.unit {
            Some(unit) => format!(
                "APC UPS {} ({})",
                spec.key,
                units::symbol(unit).unwrap_or(unit)
            ),
            None => format!("APC UPS {}", spec.key),
        };
        registry.register(name, help, gauge);
    }

    if let Some(watts) = power_usage(record) {
        let gauge: Gauge<f64, AtomicU64> = Gauge::default();
        gauge.set(watts);
        registry.register(
            "apcupsd_power_watts",
            "Derived load in watts (LOADPCT * NOMPOWER / 100)",
            gauge,
        );
    }

    registry
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let apcupsd_host = std::env::var("APCUPSD_HOST").unwrap_or_else(|_| "localhost".to_string());
    let apcupsd_port: u16 = env_or("APCUPSD_PORT", 3551);
    let port_bind: u16 = env_or("METRICS_PORT", 8080);
    let fetch_interval: u64 = env_or("INTERVAL", 10);
    let timeout = Duration::from_secs(env_or("TIMEOUT", 15));

    debug!("running sensor discovery against {apcupsd_host}:{apcupsd_port}");
    let poller = match UpsPoller::discover(&apcupsd_host, apcupsd_port, timeout) {
        Ok(poller) => poller,
        Err(err) => {
            error!("sensor discovery against {apcupsd_host}:{apcupsd_port} failed: {err}");
            std::process::exit(1);
        }
    };
    info!(
        "discovered {} sensors from {apcupsd_host}:{apcupsd_port}",
        poller.sensors().len()
    );
    for spec in poller.sensors() {
        debug!(
            "sensor {}: unit {:?}, device class {:?}",
            spec.key, spec.unit, spec.device_class
        );
    }

    let initial = poller.poll().ok();
    let state = Arc::new(Mutex::new(AppState {
        registry: build_registry(initial.as_ref(), &poller),
    }));

    // Background task polling the daemon on the configured interval
    let state_clone = Arc::clone(&state);
    let poller_clone = poller.clone();

    debug!("starting background poll every {fetch_interval} seconds");
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(fetch_interval));
        loop {
            interval_timer.tick().await;

            let registry = match poller_clone.poll() {
                Ok(record) => build_registry(Some(&record), &poller_clone),
                Err(err) => {
                    error!("status poll failed: {err}");
                    build_registry(None, &poller_clone)
                }
            };
            state_clone.lock().unwrap().registry = registry;
        }
    });
    info!("started background poll every {fetch_interval} seconds");

    let state = web::Data::new(state);

    debug!("starting HTTP server on 0.0.0.0:{port_bind}");
    HttpServer::new(move || {
        App::new()
            .wrap(Compress::default())
            .app_data(state.clone())
            .service(web::resource("/metrics").route(web::get().to(metrics_handler)))
    })
    .bind(("0.0.0.0", port_bind))?
    .run()
    .await
}
