use prometheus::{
    opts, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, Registry,
    TextEncoder,
};

pub struct ObservabilityRepository {
    registry: Registry,
    operations_total: CounterVec,
    policy_decisions_total: CounterVec,
    running_instances: Gauge,
    health_probe_failures_total: IntCounter,
    api_request_total: CounterVec,
    api_request_latency_seconds: HistogramVec,
}

impl ObservabilityRepository {
    pub fn new() -> Result<Self, String> {
        let registry = Registry::new();

        let operations_total = CounterVec::new(
            opts!(
                "conduit_operations_total",
                "Lifecycle operations by type and terminal status"
            ),
            &["type", "status"],
        )
        .map_err(|e| e.to_string())?;
        let policy_decisions_total = CounterVec::new(
            opts!(
                "conduit_policy_decisions_total",
                "Policy evaluations by verdict"
            ),
            &["decision"],
        )
        .map_err(|e| e.to_string())?;
        let running_instances = Gauge::with_opts(opts!(
            "conduit_running_instances",
            "Instances currently in the running state"
        ))
        .map_err(|e| e.to_string())?;
        let health_probe_failures_total = IntCounter::with_opts(opts!(
            "conduit_health_probe_failures_total",
            "Health probes that reported unhealthy or errored"
        ))
        .map_err(|e| e.to_string())?;
        let api_request_total = CounterVec::new(
            opts!("conduit_api_request_total", "Daemon API request total"),
            &["endpoint", "status"],
        )
        .map_err(|e| e.to_string())?;
        let api_request_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "conduit_api_request_latency_seconds",
                "Daemon API request latency (seconds)",
            ),
            &["endpoint"],
        )
        .map_err(|e| e.to_string())?;

        registry
            .register(Box::new(operations_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(policy_decisions_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(running_instances.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(health_probe_failures_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(api_request_total.clone()))
            .map_err(|e| e.to_string())?;
        registry
            .register(Box::new(api_request_latency_seconds.clone()))
            .map_err(|e| e.to_string())?;

        Ok(Self {
            registry,
            operations_total,
            policy_decisions_total,
            running_instances,
            health_probe_failures_total,
            api_request_total,
            api_request_latency_seconds,
        })
    }

    pub fn inc_operation(&self, operation_type: &str, status: &str) {
        self.operations_total
            .with_label_values(&[operation_type, status])
            .inc();
    }

    pub fn inc_policy_decision(&self, decision: &str) {
        self.policy_decisions_total
            .with_label_values(&[decision])
            .inc();
    }

    pub fn set_running_instances(&self, count: f64) {
        self.running_instances.set(count);
    }

    pub fn inc_health_probe_failures(&self) {
        self.health_probe_failures_total.inc();
    }

    pub fn observe_api_request(&self, endpoint: &str, status: &str, seconds: f64) {
        self.api_request_total
            .with_label_values(&[endpoint, status])
            .inc();
        self.api_request_latency_seconds
            .with_label_values(&[endpoint])
            .observe(seconds);
    }

    pub fn render_metrics(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buffer).map_err(|e| e.to_string())
    }
}
