//! The scheduler's fan-out: enumerates every active mailbox across all
//! tenants and enqueues one per-account job for the worker to pick up.

use cuenly_queue::{JobQueue, QueueName};
use cuenly_scheduler::FanOut;
use cuenly_storage::EmailConfigStore;
use tracing::{info, instrument};

use crate::backends::MongoEmailConfigBackend;

pub const PROCESS_ACCOUNT_JOB: &str = "process_account_job";

pub struct QueueFanOut {
    pub email_configs: EmailConfigStore<MongoEmailConfigBackend>,
    pub queue: JobQueue,
}

#[async_trait::async_trait]
impl FanOut for QueueFanOut {
    #[instrument(skip(self))]
    async fn enqueue_due_jobs(&self) -> anyhow::Result<()> {
        let configs = self.email_configs.list_all_active_configs().await?;
        info!(mailbox_count = configs.len(), "fanning out due mailboxes");

        for config in configs {
            let mut kwargs = serde_json::Map::new();
            kwargs.insert("tenant".to_string(), serde_json::Value::String(config.tenant.0.clone()));
            kwargs.insert("username".to_string(), serde_json::Value::String(config.username.clone()));
            self.queue
                .enqueue(QueueName::Default, PROCESS_ACCOUNT_JOB, Vec::new(), kwargs)
                .await?;
        }

        Ok(())
    }
}
