use clap::Parser;

use changefeed_core::{CoreError, JobName, StreamName};

/// Consume a change stream and run a job for every change event.
#[derive(Debug, Clone, PartialEq, Eq, Parser)]
#[command(name = "changefeed-worker", version, about)]
pub struct CliArgs {
    /// Job to run for every event: `auditlogs` or `publish`.
    pub job: String,

    /// Stream (collection) to watch.
    pub stream: String,

    /// Environment label; `<LABEL>_<KEY>` settings take precedence over `<KEY>`.
    #[arg(long = "env", value_name = "LABEL")]
    pub env: Option<String>,
}

impl CliArgs {
    pub fn job_name(&self) -> Result<JobName, CoreError> {
        JobName::new(self.job.as_str())
    }

    pub fn stream_name(&self) -> Result<StreamName, CoreError> {
        StreamName::new(self.stream.as_str())
    }
}
