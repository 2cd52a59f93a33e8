use cadence::{Counted, Gauged, MetricBuilder, StatsdClient, Timed, UdpMetricSink};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

enum MetricsBackend {
    Statsd(StatsdClient),
    Noop,
}

/// Cheap-to-clone metrics handle. With no StatsD target configured every
/// observation is a no-op, so callers never need to branch.
#[derive(Clone)]
pub struct Metrics {
    backend: Arc<MetricsBackend>,
}

pub type Tags<'a> = &'a [(&'a str, &'a str)];

impl Metrics {
    pub fn statsd(host: &str, port: u16, prefix: &str) -> Result<Self, cadence::MetricError> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;

        let sink = UdpMetricSink::from((host, port), socket)?;
        let client = StatsdClient::from_sink(prefix, sink);

        Ok(Metrics {
            backend: Arc::new(MetricsBackend::Statsd(client)),
        })
    }

    pub fn noop() -> Self {
        Metrics {
            backend: Arc::new(MetricsBackend::Noop),
        }
    }

    /// Increment a counter by 1.
    pub fn incr(&self, metric: &str, tags: Tags<'_>) {
        if let MetricsBackend::Statsd(client) = self.backend.as_ref() {
            send(client.count_with_tags(metric, 1), tags);
        }
    }

    /// Record an elapsed duration, in milliseconds.
    pub fn timing(&self, metric: &str, elapsed: Duration, tags: Tags<'_>) {
        if let MetricsBackend::Statsd(client) = self.backend.as_ref() {
            send(
                client.time_with_tags(metric, elapsed.as_millis() as u64),
                tags,
            );
        }
    }

    /// Set a gauge to an absolute value.
    pub fn gauge(&self, metric: &str, value: u64, tags: Tags<'_>) {
        if let MetricsBackend::Statsd(client) = self.backend.as_ref() {
            send(client.gauge_with_tags(metric, value), tags);
        }
    }
}

fn send<'a, T: cadence::Metric + From<String>>(mut builder: MetricBuilder<'a, 'a, T>, tags: Tags<'a>) {
    for (key, value) in tags {
        builder = builder.with_tag(key, value);
    }
    if let Err(e) = builder.try_send() {
        tracing::debug!(error = %e, "Failed to send metric");
    }
}
