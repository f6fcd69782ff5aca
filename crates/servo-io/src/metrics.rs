//! Prometheus metrics for the servo dispatcher.

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Dispatcher Metrics
// ============================================================================

/// Batched lines written to the sink
pub static FLUSHES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("servo_flushes_total", "Batched command lines written").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Failed sink writes
pub static FAILED_FLUSHES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_failed_flushes_total",
        "Sink writes that failed and were retried",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Values staged by the sampler
pub static SAMPLES_STAGED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "servo_samples_staged_total",
        "Servo outputs staged for the next flush",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Registered servos
pub static REGISTERED: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("servo_registered", "Servos currently registered").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Sink status (1 = writing, 0 = discarding)
pub static SINK_ENABLED: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new(
        "servo_sink_enabled",
        "Output sink status (1=writing, 0=discarding)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Motion Metrics
// ============================================================================

/// Time from move request to settle, in milliseconds
pub static MOVE_DURATION_MS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "servo_move_duration_ms",
            "Time from move request to settled in milliseconds",
        )
        .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 600.0, 1000.0, 5000.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

/// Last settled position per run
pub static LAST_POSITION: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new("servo_last_position", "Last settled servo position").unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Renders the registry in the Prometheus text format.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let buffer = match render() {
                        Ok(buffer) => buffer,
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            let _ = request.respond(
                                Response::from_string("Internal Server Error")
                                    .with_status_code(500),
                            );
                            continue;
                        }
                    };
                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once at least one servo is registered
                    if REGISTERED.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = FLUSHES.get();
    let _ = FAILED_FLUSHES.get();
    let _ = SAMPLES_STAGED.get();
    let _ = REGISTERED.get();
    let _ = SINK_ENABLED.get();
    let _ = MOVE_DURATION_MS.get_sample_count();
    let _ = LAST_POSITION.get();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_servo_metrics() {
        init_metrics();
        FLUSHES.inc();
        let text = String::from_utf8(render().unwrap()).unwrap();
        assert!(text.contains("servo_flushes_total"));
        assert!(text.contains("servo_registered"));
        assert!(text.contains("servo_move_duration_ms_bucket"));
    }
}
