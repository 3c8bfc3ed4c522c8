//! Server counters exported in Prometheus text format.

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Prefix of every exported series.
const NAMESPACE: &str = "quokka";

/// Counters shared by every listener of a process.
pub struct Metrics {
    registry: Registry,
    pub sessions_total: IntCounter,
    pub sessions_active: IntGauge,
    pub commands_total: IntCounter,
    pub messages_accepted_total: IntCounter,
    pub messages_rejected_total: IntCounter,
    pub auth_success_total: IntCounter,
    pub auth_failure_total: IntCounter,
    pub tls_handshakes_total: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Creates the counters and registers them in a private registry.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let sessions_active = IntGauge::with_opts(
            Opts::new("sessions_active", "SMTP sessions currently open").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self {
            sessions_total: counter(&registry, "sessions_total", "SMTP sessions accepted")?,
            sessions_active,
            commands_total: counter(&registry, "commands_total", "SMTP commands received")?,
            messages_accepted_total: counter(
                &registry,
                "messages_accepted_total",
                "Messages accepted for delivery",
            )?,
            messages_rejected_total: counter(
                &registry,
                "messages_rejected_total",
                "Messages rejected at end of DATA",
            )?,
            auth_success_total: counter(
                &registry,
                "auth_success_total",
                "Successful AUTH exchanges",
            )?,
            auth_failure_total: counter(&registry, "auth_failure_total", "Failed AUTH exchanges")?,
            tls_handshakes_total: counter(
                &registry,
                "tls_handshakes_total",
                "Completed TLS handshakes",
            )?,
            registry,
        })
    }

    pub(crate) fn session_opened(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub(crate) fn session_closed(&self) {
        self.sessions_active.dec();
    }

    /// Renders all series in the Prometheus text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
