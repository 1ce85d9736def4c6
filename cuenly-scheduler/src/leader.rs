//! C11: leader election and fan-out scheduling for the periodic
//! email-ingestion sweep. Exactly one pod holds `job_owner_key` at a
//! time; the owner refreshes its TTL every local tick and enqueues the
//! fan-out jobs when the configured interval has elapsed. A zombie
//! watchdog clears stuck state if a run drifts too far past its
//! expected completion.

use std::time::Duration;

use async_trait::async_trait;
use cuenly_common::time::TimestampMillis;
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{info, instrument, warn};

const JOB_ENABLED_KEY: &str = "cuenly:scheduler:enabled";
const JOB_OWNER_KEY: &str = "cuenly:scheduler:owner";
const JOB_STATE_KEY: &str = "cuenly:scheduler:state";

const DEFAULT_OWNER_TTL_SECONDS: u64 = 120;
const LOCAL_TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct LeaderConfig {
    pub pod_id: String,
    pub interval_minutes: u32,
    pub owner_ttl_seconds: u64,
    pub restore_on_boot: bool,
}

impl LeaderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.interval_minutes) * 60)
    }

    pub fn owner_ttl(&self) -> Duration {
        Duration::from_secs(self.owner_ttl_seconds)
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            pod_id: String::new(),
            interval_minutes: 15,
            owner_ttl_seconds: DEFAULT_OWNER_TTL_SECONDS,
            restore_on_boot: false,
        }
    }
}

/// Persisted scheduler run state, used to detect a zombie run whose
/// `next_run_ts` has drifted too far while `running` is still true.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct RunState {
    next_run_ts: i64,
    running: bool,
}

/// The fan-out side-effect the leader performs once per interval.
/// Implemented against the Redis job queue in the binary; an in-memory
/// fake backs the unit tests below.
#[async_trait]
pub trait FanOut: Send + Sync {
    async fn enqueue_due_jobs(&self) -> anyhow::Result<()>;
}

pub struct LeaderScheduler<F> {
    client: redis::Client,
    config: LeaderConfig,
    fan_out: F,
}

impl<F: FanOut> LeaderScheduler<F> {
    pub fn new(client: redis::Client, config: LeaderConfig, fan_out: F) -> Self {
        Self {
            client,
            config,
            fan_out,
        }
    }

    /// Runs the startup algorithm that decides whether this pod claims
    /// ownership, then returns whether it is the leader.
    #[instrument(skip(self))]
    pub async fn claim_on_boot(&self) -> Result<bool, SchedulerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let enabled: Option<String> = conn.get(JOB_ENABLED_KEY).await?;
        match enabled.as_deref() {
            None => {
                conn.set::<_, _, ()>(JOB_ENABLED_KEY, "false").await?;
                conn.del::<_, ()>(JOB_OWNER_KEY).await?;
                return Ok(false);
            }
            Some("true") if !self.config.restore_on_boot => {
                conn.set::<_, _, ()>(JOB_ENABLED_KEY, "false").await?;
                conn.del::<_, ()>(JOB_OWNER_KEY).await?;
                return Ok(false);
            }
            Some("true") => {
                let claimed: bool = redis::cmd("SET")
                    .arg(JOB_OWNER_KEY)
                    .arg(&self.config.pod_id)
                    .arg("NX")
                    .arg("EX")
                    .arg(self.config.owner_ttl_seconds)
                    .query_async::<Option<String>>(&mut conn)
                    .await?
                    .is_some();
                if claimed {
                    info!(pod = %self.config.pod_id, "claimed scheduler ownership on boot");
                }
                return Ok(claimed);
            }
            _ => return Ok(false),
        }
    }

    /// Enables the scheduler and claims ownership unconditionally,
    /// matching an operator-initiated `--start-job`.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(JOB_ENABLED_KEY, "true").await?;
        let _: bool = redis::cmd("SET")
            .arg(JOB_OWNER_KEY)
            .arg(&self.config.pod_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.owner_ttl_seconds)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(())
    }

    /// Persists `enabled=false` and deletes the owner key globally so
    /// every pod converges to the stopped state.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.set::<_, _, ()>(JOB_ENABLED_KEY, "false").await?;
        conn.del::<_, ()>(JOB_OWNER_KEY).await?;
        conn.del::<_, ()>(JOB_STATE_KEY).await?;
        Ok(())
    }

    /// The leader's local 1-second loop. Runs until `enabled` becomes
    /// false or ownership is lost to another pod. A passive pod may
    /// auto-heal by calling this once it notices `enabled=true` but no
    /// owner holds the key.
    #[instrument(skip(self))]
    pub async fn run_while_leader(&self) -> Result<(), SchedulerError> {
        loop {
            tokio::time::sleep(LOCAL_TICK).await;

            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let enabled: Option<String> = conn.get(JOB_ENABLED_KEY).await?;
            if enabled.as_deref() != Some("true") {
                return Ok(());
            }

            let owner: Option<String> = conn.get(JOB_OWNER_KEY).await?;
            match owner {
                Some(ref o) if o == &self.config.pod_id => {
                    conn.expire::<_, ()>(JOB_OWNER_KEY, self.config.owner_ttl_seconds as i64)
                        .await?;
                }
                None => {
                    // Auto-heal: owner key lapsed but scheduler is still
                    // enabled. Try to reclaim.
                    let claimed: bool = redis::cmd("SET")
                        .arg(JOB_OWNER_KEY)
                        .arg(&self.config.pod_id)
                        .arg("NX")
                        .arg("EX")
                        .arg(self.config.owner_ttl_seconds)
                        .query_async::<Option<String>>(&mut conn)
                        .await?
                        .is_some();
                    if !claimed {
                        continue;
                    }
                    warn!(pod = %self.config.pod_id, "auto-healed scheduler ownership");
                }
                Some(_) => {
                    // Another pod owns it now; step down.
                    return Ok(());
                }
            }

            self.check_watchdog_and_maybe_run(&mut conn).await?;
        }
    }

    async fn check_watchdog_and_maybe_run(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
    ) -> Result<(), SchedulerError> {
        let raw: Option<String> = conn.get(JOB_STATE_KEY).await?;
        let now = TimestampMillis::now().as_i64();
        let interval_ms = self.config.interval().as_millis() as i64;

        let mut state = match raw {
            Some(raw) => serde_json::from_str::<RunState>(&raw)?,
            None => RunState {
                next_run_ts: now,
                running: false,
            },
        };

        if state.running && now.saturating_sub(state.next_run_ts) > 2 * interval_ms {
            warn!("scheduler run looks like a zombie, clearing state");
            state.running = false;
            state.next_run_ts = now + interval_ms;
            conn.set::<_, _, ()>(JOB_STATE_KEY, serde_json::to_string(&state)?)
                .await?;
            return Ok(());
        }

        if now < state.next_run_ts {
            return Ok(());
        }

        state.running = true;
        conn.set::<_, _, ()>(JOB_STATE_KEY, serde_json::to_string(&state)?)
            .await?;

        if let Err(e) = self.fan_out.enqueue_due_jobs().await {
            warn!(error = %e, "fan-out enqueue failed, will retry next tick");
        }

        state.running = false;
        state.next_run_ts = now + interval_ms;
        conn.set::<_, _, ()>(JOB_STATE_KEY, serde_json::to_string(&state)?)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFanOut(AtomicUsize);

    #[async_trait]
    impl FanOut for CountingFanOut {
        async fn enqueue_due_jobs(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn interval_and_ttl_convert_correctly() {
        let config = LeaderConfig {
            pod_id: "pod-1".to_string(),
            interval_minutes: 15,
            owner_ttl_seconds: 120,
            restore_on_boot: false,
        };
        assert_eq!(config.interval(), Duration::from_secs(900));
        assert_eq!(config.owner_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = LeaderConfig::default();
        assert_eq!(config.owner_ttl_seconds, 120);
        assert!(!config.restore_on_boot);
    }

    #[tokio::test]
    async fn fan_out_trait_is_invoked() {
        let fan_out = CountingFanOut(AtomicUsize::new(0));
        fan_out.enqueue_due_jobs().await.unwrap();
        assert_eq!(fan_out.0.load(Ordering::SeqCst), 1);
    }
}
