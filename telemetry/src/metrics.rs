use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port the Prometheus scrape endpoint listens on.
const METRICS_PORT: u16 = 9000;

/// Installs the global metrics recorder with an HTTP listener on `[::]:9000/metrics`.
///
/// Every metric carries a `pipeline` label with the given name. Must be called from within a
/// tokio runtime since the listener runs as a task.
pub fn init_metrics(pipeline_name: Option<&str>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        METRICS_PORT,
    ));

    if let Some(pipeline_name) = pipeline_name {
        builder = builder.add_global_label("pipeline", pipeline_name);
    }

    builder.install()
}
