//! Logging and tracing setup.
//!
//! Logs always go to stdout, by default only at the "ERROR" level.
//! Setting `FUNCTIONAL_STAGE_LOG` to a `tracing-subscriber` filter
//! directive (e.g. `functional_stage=debug,error`) overrides the
//! level passed to [`TracingSetup::setup`].
//!
//! Traces are only exported when a [`TracingConfig`] is given. Each
//! backend implements [`TracerBuilder`].

use opentelemetry::sdk::trace::Tracer;
use tokio::runtime::EnterGuard;
use tokio::runtime::Runtime;
use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::StageError;
use crate::errors::StageException;
use crate::errors::StageResult;

pub mod jaeger_tracing;
pub mod otlp_tracing;

pub use jaeger_tracing::JaegerConfig;
pub use otlp_tracing::OtlpTracingConfig;

/// Environment variable with a filter directive for logs.
pub const LOG_FILTER_VAR: &str = "FUNCTIONAL_STAGE_LOG";

const TARGET: &str = "functional_stage";

/// Where traces go.
#[derive(Debug, Clone)]
pub enum TracingConfig {
    Jaeger(JaegerConfig),
    Otlp(OtlpTracingConfig),
}

impl TracingConfig {
    fn builder(&self) -> &dyn TracerBuilder {
        match self {
            Self::Jaeger(conf) => conf,
            Self::Otlp(conf) => conf,
        }
    }
}

/// Every tracing backend builds the [`Tracer`] its traces go through.
pub trait TracerBuilder {
    fn build(&self) -> StageResult<Tracer>;
}

/// Parse a log level name, "ERROR" if absent.
pub fn log_level(level: Option<&str>) -> StageResult<LevelFilter> {
    let Some(level) = level else {
        return Ok(LevelFilter::ERROR);
    };
    match level.to_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" => Ok(LevelFilter::WARN),
        "error" => Ok(LevelFilter::ERROR),
        level => Err(StageError::config(format!("Wrong log level: {level}"))),
    }
}

/// Keeps alive the tokio runtime trace exporters run on.
pub struct TracingSetup {
    rt: Runtime,
}

impl TracingSetup {
    pub fn new() -> StageResult<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tracing")
            .build()
            .reraise("error starting tracing runtime")?;
        Ok(Self { rt })
    }

    /// Install the global subscriber.
    ///
    /// Keep the returned guard for as long as traces should be
    /// exported.
    pub fn setup(
        &self,
        conf: Option<TracingConfig>,
        log_level: Option<&str>,
    ) -> StageResult<EnterGuard<'_>> {
        let level = self::log_level(log_level)?;
        let env_filter = match std::env::var(LOG_FILTER_VAR) {
            Ok(directives) => Some(EnvFilter::try_new(&directives).map_err(|err| {
                StageError::config(format!("invalid {LOG_FILTER_VAR} value {directives:?}: {err}"))
            })?),
            Err(_) => None,
        };
        let guard = self.rt.enter();

        // Exporters have to be built from within the runtime.
        let initializer = async move {
            let logs = tracing_subscriber::fmt::Layer::default()
                .compact()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true);
            let logs = match env_filter {
                Some(filter) => logs.with_filter(filter).boxed(),
                None => logs
                    .with_filter(Targets::new().with_target(TARGET, level))
                    .boxed(),
            };

            match conf {
                Some(conf) => {
                    let tracer = conf.builder().build()?;
                    let telemetry = tracing_opentelemetry::layer()
                        .with_tracer(tracer)
                        .with_filter(Targets::new().with_target(TARGET, LevelFilter::TRACE));
                    set_global_subscriber(Registry::default().with(logs).with(telemetry));
                }
                None => set_global_subscriber(Registry::default().with(logs)),
            }
            Ok::<(), StageError>(())
        };
        self.rt
            .block_on(self.rt.spawn(initializer))
            .map_err(|err| StageError::config(format!("tracing setup panicked: {err}")))??;
        Ok(guard)
    }
}

/// Set the global default subscriber, only warning if one was
/// already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // Happens when more than one stage in a process, or more than one
    // test, sets up tracing.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn parses_log_levels() {
    assert_eq!(log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(log_level(Some("Debug")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        log_level(Some("loud")),
        Err(StageError::Config(_))
    ));
}

#[test]
fn setup_without_exporter() {
    let tracing = TracingSetup::new().unwrap();
    let _guard = tracing.setup(None, Some("warn")).unwrap();
    tracing::warn!("logging is set up");
}
