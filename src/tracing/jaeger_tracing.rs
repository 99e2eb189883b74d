use opentelemetry::runtime::Tokio;
use opentelemetry::sdk::trace::config;
use opentelemetry::sdk::trace::Sampler;
use opentelemetry::sdk::trace::Tracer;

use super::TracerBuilder;
use crate::errors::StageError;
use crate::errors::StageResult;

/// Send traces to a Jaeger agent.
///
/// Without an endpoint, the agent is found through
///
///   OTEL_EXPORTER_JAEGER_AGENT_HOST="127.0.0.1"
///   OTEL_EXPORTER_JAEGER_AGENT_PORT="6831"
///
/// and defaults to "127.0.0.1:6831".
#[derive(Debug, Clone)]
pub struct JaegerConfig {
    /// Identifies the stages of this process.
    pub service_name: String,
    pub endpoint: Option<String>,
    /// 1.0 or more samples every trace, 0.0 or less almost none.
    pub sampling_ratio: f64,
}

impl JaegerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            endpoint: None,
            sampling_ratio: 1.0,
        }
    }
}

impl TracerBuilder for JaegerConfig {
    fn build(&self) -> StageResult<Tracer> {
        opentelemetry::global::set_text_map_propagator(opentelemetry_jaeger::Propagator::new());
        let mut pipeline = opentelemetry_jaeger::new_agent_pipeline()
            .with_trace_config(config().with_sampler(Sampler::TraceIdRatioBased(self.sampling_ratio)))
            .with_service_name(self.service_name.clone());
        if let Some(endpoint) = self.endpoint.as_ref() {
            pipeline = pipeline.with_endpoint(endpoint);
        }
        pipeline
            .install_batch(Tokio)
            .map_err(|err| StageError::config(format!("error installing jaeger tracer: {err}")))
    }
}
