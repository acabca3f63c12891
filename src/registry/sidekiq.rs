//! Sidekiq bookkeeping read straight from Redis
//!
//! Key layout (written by Sidekiq itself and by the worker's liveness loop):
//! - `processes` - SET of process identities
//! - `<identity>` - HASH whose `info` field is JSON with `hostname` and `identity`
//! - `<identity>:work` - HASH of thread id -> JSON `{queue, payload, run_at}`
//! - `<liveness_key>::<hostname>` - freshness token, expires when the loop stalls

use super::{InFlightJob, JobPayload, LivenessStore, ProcessInfo, RegistryError, WorkRegistry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, AsyncConnectionConfig, RedisResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const PROCESSES_KEY: &str = "processes";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Used when the hostname variable is unset, so the token lookup fails
/// instead of matching some other host's key
pub const HOSTNAME_NOT_SET: &str = "HOSTNAME_NOT_SET";

/// Redis-backed `LivenessStore` and `WorkRegistry`
///
/// The connection is opened on first use and dropped after any command error,
/// so an unreachable Redis shows up as a failed probe request rather than a
/// probe that never starts, and the next request reconnects.
pub struct SidekiqRedis {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    liveness_key: String,
}

impl SidekiqRedis {
    /// Validate the URL and bind the freshness token to `hostname`
    pub fn new(
        redis_url: &str,
        liveness_key_prefix: &str,
        hostname: Option<&str>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            connection: Mutex::new(None),
            liveness_key: liveness_key(liveness_key_prefix, hostname),
        })
    }

    pub fn liveness_key(&self) -> &str {
        &self.liveness_key
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RegistryError> {
        let mut guard = self.connection.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(CONNECT_TIMEOUT)
            .set_response_timeout(COMMAND_TIMEOUT);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    /// Pass a command result through, forgetting the connection on failure
    async fn checked<T>(&self, result: RedisResult<T>) -> Result<T, RegistryError> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(error = %e, "Redis command failed; reconnecting on next request");
                *self.connection.lock().await = None;
                Err(e.into())
            }
        }
    }
}

/// Full key of this host's freshness token
pub fn liveness_key(prefix: &str, hostname: Option<&str>) -> String {
    format!("{}::{}", prefix, hostname.unwrap_or(HOSTNAME_NOT_SET))
}

#[async_trait]
impl LivenessStore for SidekiqRedis {
    async fn is_alive(&self) -> Result<bool, RegistryError> {
        let mut conn = self.connection().await?;
        let exists: RedisResult<bool> = conn.exists(&self.liveness_key).await;
        self.checked(exists).await
    }
}

#[async_trait]
impl WorkRegistry for SidekiqRedis {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, RegistryError> {
        let mut conn = self.connection().await?;
        let identities: RedisResult<Vec<String>> = conn.smembers(PROCESSES_KEY).await;
        let identities = self.checked(identities).await?;

        let mut processes = Vec::with_capacity(identities.len());
        for identity in identities {
            let info: RedisResult<Option<String>> = conn.hget(&identity, "info").await;
            match self.checked(info).await? {
                Some(raw) => processes.push(decode_process_info(&raw)?),
                // Process heartbeat expired between SMEMBERS and HGET
                None => debug!(identity = %identity, "Skipping process without info"),
            }
        }

        Ok(processes)
    }

    async fn list_in_flight_jobs(&self) -> Result<Vec<InFlightJob>, RegistryError> {
        let mut conn = self.connection().await?;
        let identities: RedisResult<Vec<String>> = conn.smembers(PROCESSES_KEY).await;
        let identities = self.checked(identities).await?;

        let mut jobs = Vec::new();
        for identity in identities {
            let work: RedisResult<HashMap<String, String>> =
                conn.hgetall(format!("{}:work", identity)).await;
            let work = self.checked(work).await?;
            jobs.extend(collect_work(&identity, &work));
        }

        Ok(jobs)
    }
}

/// Decode the work hash of one process, skipping entries that cannot be read
///
/// Empty values are in-progress writes. Other undecodable entries are logged
/// and dropped so one bad entry anywhere in the cluster cannot fail every probe.
pub fn collect_work(identity: &str, work: &HashMap<String, String>) -> Vec<InFlightJob> {
    let mut jobs = Vec::with_capacity(work.len());
    for (tid, raw) in work {
        if raw.trim().is_empty() {
            debug!(identity = %identity, tid = %tid, "Skipping empty work entry");
            continue;
        }

        match decode_work(identity, raw) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!(
                identity = %identity,
                tid = %tid,
                error = %e,
                "Skipping unreadable work entry"
            ),
        }
    }
    jobs
}

/// Decode the `info` field of a process hash
pub fn decode_process_info(raw: &str) -> Result<ProcessInfo, RegistryError> {
    serde_json::from_str(raw).map_err(|e| RegistryError::Decode {
        what: "process info".to_string(),
        message: e.to_string(),
    })
}

#[derive(Debug, Deserialize)]
struct WorkEntry {
    payload: serde_json::Value,
    run_at: f64,
}

/// Decode one entry of a `<identity>:work` hash
///
/// Newer Sidekiq versions store `payload` as an embedded JSON string,
/// older ones as an object. `run_at` is epoch seconds.
pub fn decode_work(identity: &str, raw: &str) -> Result<InFlightJob, RegistryError> {
    let decode_err = |e: serde_json::Error| RegistryError::Decode {
        what: format!("work entry for {}", identity),
        message: e.to_string(),
    };

    let entry: WorkEntry = serde_json::from_str(raw).map_err(decode_err)?;

    let payload: JobPayload = match entry.payload {
        serde_json::Value::String(embedded) => {
            serde_json::from_str(&embedded).map_err(decode_err)?
        }
        other => serde_json::from_value(other).map_err(decode_err)?,
    };

    let started_at = DateTime::<Utc>::from_timestamp_millis((entry.run_at * 1000.0) as i64)
        .ok_or_else(|| RegistryError::Decode {
            what: format!("work entry for {}", identity),
            message: format!("run_at out of range: {}", entry.run_at),
        })?;

    Ok(InFlightJob {
        process_identity: identity.to_string(),
        payload,
        started_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_liveness_key_uses_hostname() {
        assert_eq!(
            liveness_key("SIDEKIQ::LIVENESS_PROBE_TIMESTAMP", Some("web-1")),
            "SIDEKIQ::LIVENESS_PROBE_TIMESTAMP::web-1"
        );
    }

    #[test]
    fn test_liveness_key_without_hostname() {
        assert_eq!(liveness_key("alive", None), "alive::HOSTNAME_NOT_SET");
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let result = SidekiqRedis::new("not a redis url", "alive", Some("web-1"));
        assert!(matches!(result, Err(RegistryError::Redis(_))));
    }

    #[test]
    fn test_new_does_not_connect() {
        // Nothing listens on port 1; construction must still succeed
        let store = SidekiqRedis::new("redis://127.0.0.1:1", "alive", Some("web-1")).unwrap();
        assert_eq!(store.liveness_key(), "alive::web-1");
    }

    #[test]
    fn test_decode_process_info() {
        let raw = r#"{"hostname":"worker-host","started_at":1700000000.5,"pid":42,
            "tag":"app","concurrency":10,"queues":["default"],"identity":"worker-host:42:abc"}"#;

        let info = decode_process_info(raw).unwrap();

        assert_eq!(info.hostname, "worker-host");
        assert_eq!(info.identity, "worker-host:42:abc");
    }

    #[test]
    fn test_decode_process_info_missing_identity() {
        let result = decode_process_info(r#"{"hostname":"worker-host"}"#);
        assert!(matches!(result, Err(RegistryError::Decode { .. })));
    }

    #[test]
    fn test_decode_work_with_embedded_payload() {
        let payload = json!({"class": "HardJob", "args": [1, "two"], "jid": "j1"}).to_string();
        let raw = json!({"queue": "default", "payload": payload, "run_at": 1_700_000_000}).to_string();

        let job = decode_work("worker-1", &raw).unwrap();

        assert_eq!(job.process_identity, "worker-1");
        assert_eq!(job.payload.class, "HardJob");
        assert_eq!(job.payload.args, json!([1, "two"]));
        assert_eq!(job.started_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_decode_work_with_object_payload_and_fractional_run_at() {
        let raw = json!({
            "queue": "low",
            "payload": {"class": "ReportJob", "args": []},
            "run_at": 1_700_000_000.25
        })
        .to_string();

        let job = decode_work("worker-2", &raw).unwrap();

        assert_eq!(job.payload.class, "ReportJob");
        assert_eq!(job.started_at.timestamp_millis(), 1_700_000_000_250);
    }

    #[test]
    fn test_decode_work_rejects_garbage() {
        let result = decode_work("worker-1", "not json");
        assert!(matches!(result, Err(RegistryError::Decode { .. })));
    }

    #[test]
    fn test_decode_work_without_class() {
        let payload = json!({"args": [], "jid": "j2"}).to_string();
        let raw = json!({"queue": "default", "payload": payload, "run_at": 1_700_000_000}).to_string();

        let job = decode_work("other-proc", &raw).unwrap();

        assert_eq!(job.payload.class, "");
        assert_eq!(job.started_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_collect_work_skips_empty_and_unreadable_entries() {
        let good = json!({
            "queue": "default",
            "payload": {"class": "HardJob", "args": []},
            "run_at": 1_700_000_000
        })
        .to_string();
        let work = HashMap::from([
            ("tid-1".to_string(), good),
            ("tid-2".to_string(), String::new()),
            ("tid-3".to_string(), "not json".to_string()),
            ("tid-4".to_string(), json!({"queue": "default"}).to_string()),
        ]);

        let jobs = collect_work("other-proc", &work);

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload.class, "HardJob");
        assert_eq!(jobs[0].process_identity, "other-proc");
    }
}
