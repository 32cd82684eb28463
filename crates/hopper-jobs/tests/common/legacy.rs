//! Jobs left over from an older module layout.

use async_trait::async_trait;
use hopper_jobs::{Job, JobContext, JobResult};

use super::Input;

/// Still registered under the name of the job that replaced it.
#[derive(Default)]
pub struct LegacyJobA;

#[async_trait]
impl Job for LegacyJobA {
    type Data = Input;
    type Output = ();
    hopper_jobs::job_file!();

    fn name() -> String {
        "JobA".to_string()
    }

    async fn process(&self, _ctx: &JobContext<Input>) -> JobResult<()> {
        Ok(())
    }
}
