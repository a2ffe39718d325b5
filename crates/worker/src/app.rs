//! Wiring of the production pipeline: Postgres checkpoints, Redis change
//! streams and a Redis dead-letter stream, driven by the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{info, warn};

use changefeed_core::{JobName, StreamName};
use changefeed_infra::{
    BuildError, JobKind, Pipeline, PipelineFactory, PostgresCheckpointStore, RedisChangeStream,
    RedisDeadLetterSink, RedisStreamOptions, ShutdownTrigger, Supervisor, SupervisorExit,
    WorkerConfig, shutdown_channel,
};

use crate::cli::CliArgs;

/// A validated job/stream pair together with its configuration.
#[derive(Debug, Clone)]
pub struct Worker {
    pub stream: StreamName,
    pub job_name: JobName,
    pub kind: JobKind,
    pub config: WorkerConfig,
}

impl Worker {
    /// Validate the command line against the configuration. No I/O.
    pub fn prepare(args: &CliArgs, config: WorkerConfig) -> anyhow::Result<Self> {
        let stream = args.stream_name().context("invalid stream name")?;
        let job_name = args.job_name().context("invalid job name")?;
        let kind = JobKind::try_from(&job_name)?;
        kind.validate_stream(&stream)?;
        if kind == JobKind::AuditLogs {
            config.require_auditlog_endpoint()?;
        }

        Ok(Self {
            stream,
            job_name,
            kind,
            config,
        })
    }
}

/// Builds pipelines against Postgres and Redis.
///
/// Each build opens a fresh pool and fresh Redis clients so a restarted
/// consumer never reuses a broken connection. The change stream must exist
/// when the worker starts; later rebuilds skip that check.
#[derive(Debug)]
pub struct ServiceFactory {
    config: WorkerConfig,
    stream_key: String,
    require_stream: AtomicBool,
}

impl ServiceFactory {
    pub fn new(config: WorkerConfig, stream: &StreamName) -> Self {
        Self {
            stream_key: config.stream_key(stream),
            config,
            require_stream: AtomicBool::new(true),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    fn stream_options(&self) -> RedisStreamOptions {
        RedisStreamOptions {
            block: self.config.stream_block,
            batch_size: self.config.stream_batch_size,
        }
    }

    async fn checkpoint_store(&self) -> Result<PostgresCheckpointStore, BuildError> {
        let pool = PgPool::connect(&self.config.database_url)
            .await
            .map_err(|e| match e {
                sqlx::Error::Configuration(_) => BuildError::Fatal(format!("DATABASE_URL: {e}")),
                other => BuildError::Transient(format!("connecting to Postgres failed: {other}")),
            })?;

        let store = PostgresCheckpointStore::new(pool)
            .with_table(self.config.checkpoint_table.as_str())
            .map_err(|e| BuildError::Fatal(e.to_string()))?;
        store
            .ensure_schema()
            .await
            .map_err(|e| BuildError::Transient(e.to_string()))?;
        Ok(store)
    }

    async fn change_stream(&self) -> Result<RedisChangeStream, BuildError> {
        let source = RedisChangeStream::new(
            &self.config.redis_url,
            self.stream_key.as_str(),
            self.stream_options(),
        )
        .map_err(|e| BuildError::Fatal(format!("REDIS_URL: {e}")))?;

        if self.require_stream.load(Ordering::Acquire) {
            let exists = source
                .exists()
                .await
                .map_err(|e| BuildError::Transient(e.to_string()))?;
            if !exists {
                return Err(BuildError::Fatal(format!(
                    "change stream {} does not exist",
                    self.stream_key
                )));
            }
            self.require_stream.store(false, Ordering::Release);
        }
        Ok(source)
    }
}

#[async_trait]
impl PipelineFactory for ServiceFactory {
    async fn build(&self) -> Result<Pipeline, BuildError> {
        let checkpoints = self.checkpoint_store().await?;
        let source = self.change_stream().await?;
        let dead_letters = RedisDeadLetterSink::new(
            &self.config.redis_url,
            self.config.dead_letter_stream.as_str(),
        )
        .map_err(|e| BuildError::Fatal(e.to_string()))?;

        Ok(Pipeline {
            source: Arc::new(source),
            checkpoints: Arc::new(checkpoints),
            dead_letters: Arc::new(dead_letters),
        })
    }
}

/// Run the worker until shutdown, a fatal setup failure or a halting poison event.
pub async fn run(worker: Worker, trigger: ShutdownTrigger) -> anyhow::Result<SupervisorExit> {
    let job = worker.kind.build(&worker.config)?;
    let factory = ServiceFactory::new(worker.config.clone(), &worker.stream);

    info!(
        stream_key = %factory.stream_key(),
        poison_policy = worker.config.poison_policy.as_str(),
        "starting worker"
    );

    let supervisor = Supervisor::new(factory, worker.stream, worker.job_name, job)
        .with_poison_policy(worker.config.poison_policy);

    let exit = supervisor.run(trigger.subscribe()).await?;
    Ok(exit)
}

/// Load configuration, validate arguments and run with OS signal handling.
pub async fn run_from_args(args: CliArgs) -> anyhow::Result<SupervisorExit> {
    let config = WorkerConfig::from_env(args.env.as_deref())?;
    let worker = Worker::prepare(&args, config)?;

    let (trigger, _signal) = shutdown_channel();
    let on_signal = trigger.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("shutdown requested");
        on_signal.trigger();
    });

    run(worker, trigger).await
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_termination() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
