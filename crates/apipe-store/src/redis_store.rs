//! Redis-backed job store.
//!
//! Layout under `{prefix}`:
//! - `{prefix}:job:{id}`: job JSON
//! - `{prefix}:result:{id}`: result JSON, written once
//! - `{prefix}:idem:{key}`: id of the job owning an idempotency key
//! - `{prefix}:state:{state}`: set of job ids per state
//!
//! Scripts read `state` and `version` out of the stored JSON and only write
//! when both match what the caller read. Every key a script touches is
//! passed in `KEYS`; on Redis Cluster give the prefix a hash tag (for
//! example `{apipe}`) so they share a slot.

use apipe_models::{Job, JobId, JobState, ProcessingResult};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::store::{InsertOutcome, JobStore};

// KEYS: idem key, new job key, new state set, job key of the current owner
//       (the new job key when there is none)
// ARGV: job id, job json, owner id read by the caller ('' for none)
const INSERT_LUA: &str = r#"
local existing = redis.call('GET', KEYS[1])
if (existing or '') ~= ARGV[3] then return {'moved', ''} end
if existing then
  local raw = redis.call('GET', KEYS[4])
  if raw then
    local job = cjson.decode(raw)
    if job.state ~= 'dead_lettered' and job.state ~= 'cancelled' then
      return {'existing', raw}
    end
  end
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SADD', KEYS[3], ARGV[1])
return {'created', ARGV[2]}
"#;

// KEYS: job key, result key, expected state set, new state set, idem key
// ARGV: job id, expected state, expected version, new json, new state,
//       result json ('' for none)
const CAS_LUA: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {'missing'} end
local job = cjson.decode(raw)
if job.state ~= ARGV[2] or tostring(job.version) ~= ARGV[3] then
  return {'conflict', job.state, tostring(job.version)}
end
if ARGV[6] ~= '' then
  if redis.call('EXISTS', KEYS[2]) == 1 then return {'result_exists'} end
  redis.call('SET', KEYS[2], ARGV[6])
end
redis.call('SET', KEYS[1], ARGV[4])
if ARGV[2] ~= ARGV[5] then
  redis.call('SREM', KEYS[3], ARGV[1])
  redis.call('SADD', KEYS[4], ARGV[1])
end
if ARGV[5] == 'dead_lettered' or ARGV[5] == 'cancelled' then
  if redis.call('GET', KEYS[5]) == ARGV[1] then
    redis.call('DEL', KEYS[5])
  end
end
return {'ok'}
"#;

/// Attempts at an insert whose idempotency key changed owner mid-call.
const INSERT_RETRIES: usize = 5;

fn parse_state(s: &str) -> Option<JobState> {
    JobState::ALL.into_iter().find(|state| state.as_str() == s)
}

/// Job store backed by Redis JSON documents and Lua compare-and-set.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    prefix: String,
    insert_script: Script,
    cas_script: Script,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "Connected Redis job store");

        Ok(Self {
            conn,
            prefix,
            insert_script: Script::new(INSERT_LUA),
            cas_script: Script::new(CAS_LUA),
        })
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn result_key(&self, id: &JobId) -> String {
        format!("{}:result:{}", self.prefix, id)
    }

    fn idem_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.prefix, key)
    }

    fn state_key(&self, state: JobState) -> String {
        format!("{}:state:{}", self.prefix, state.as_str())
    }

    fn versioned(job: &Job) -> Job {
        let mut written = job.clone();
        written.version = job.version + 1;
        written.updated_at = Utc::now();
        written
    }

    async fn cas(
        &self,
        job: &Job,
        expected_state: JobState,
        result: Option<&ProcessingResult>,
    ) -> StoreResult<Job> {
        let mut conn = self.conn.clone();
        let written = Self::versioned(job);
        let result_json = match result {
            Some(r) => serde_json::to_string(r)?,
            None => String::new(),
        };

        let reply: Vec<String> = self
            .cas_script
            .key(self.job_key(&job.id))
            .key(self.result_key(&job.id))
            .key(self.state_key(expected_state))
            .key(self.state_key(written.state))
            .key(self.idem_key(&job.idempotency_key))
            .arg(job.id.as_str())
            .arg(expected_state.as_str())
            .arg(job.version)
            .arg(serde_json::to_string(&written)?)
            .arg(written.state.as_str())
            .arg(result_json)
            .invoke_async(&mut conn)
            .await?;

        match reply.first().map(String::as_str) {
            Some("ok") => {
                debug!(job_id = %job.id, state = %written.state, version = written.version, "Job written");
                Ok(written)
            }
            Some("missing") => Err(StoreError::not_found(job.id.as_str())),
            Some("result_exists") => Err(StoreError::ResultExists(job.id.to_string())),
            Some("conflict") => {
                let actual = reply
                    .get(1)
                    .and_then(|s| parse_state(s))
                    .ok_or_else(|| StoreError::invalid_response("conflict without state"))?;
                let actual_version = reply
                    .get(2)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| StoreError::invalid_response("conflict without version"))?;
                Err(StoreError::Conflict {
                    job_id: job.id.to_string(),
                    expected: expected_state,
                    expected_version: job.version,
                    actual,
                    actual_version,
                })
            }
            _ => Err(StoreError::invalid_response(format!("{:?}", reply))),
        }
    }

    async fn load_many(&self, ids: Vec<String>) -> StoreResult<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}:job:{}", self.prefix, id))
            .collect();
        let raws: Vec<Option<String>> = conn.mget(keys).await?;

        let mut jobs = Vec::with_capacity(raws.len());
        for raw in raws.into_iter().flatten() {
            jobs.push(serde_json::from_str::<Job>(&raw)?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert_or_get(&self, job: Job) -> StoreResult<InsertOutcome> {
        let mut conn = self.conn.clone();
        let written = Self::versioned(&job);
        let json = serde_json::to_string(&written)?;
        let idem_key = self.idem_key(&job.idempotency_key);

        for _ in 0..INSERT_RETRIES {
            // The owner's job key has to be named up front; the script
            // refuses to act if the key moved in between
            let owner: Option<String> = conn.get(&idem_key).await?;
            let owner_key = match &owner {
                Some(id) => self.job_key(&JobId::from_string(id.clone())),
                None => self.job_key(&job.id),
            };

            let (outcome, raw): (String, String) = self
                .insert_script
                .key(&idem_key)
                .key(self.job_key(&job.id))
                .key(self.state_key(written.state))
                .key(owner_key)
                .arg(job.id.as_str())
                .arg(&json)
                .arg(owner.unwrap_or_default())
                .invoke_async(&mut conn)
                .await?;

            match outcome.as_str() {
                "created" => return Ok(InsertOutcome::Created(serde_json::from_str(&raw)?)),
                "existing" => return Ok(InsertOutcome::Existing(serde_json::from_str(&raw)?)),
                "moved" => debug!(key = %job.idempotency_key, "Idempotency key changed owner, retrying insert"),
                other => return Err(StoreError::invalid_response(other)),
            }
        }

        Err(StoreError::invalid_response(format!(
            "idempotency key {} kept changing owner",
            job.idempotency_key
        )))
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.job_key(job_id)).await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(self.idem_key(key)).await?;
        match id {
            Some(id) => self.get(&JobId::from_string(id)).await,
            None => Ok(None),
        }
    }

    async fn list_by_state(&self, state: JobState) -> StoreResult<Vec<Job>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.state_key(state)).await?;
        let mut jobs = self.load_many(ids).await?;
        // The set may briefly lag a concurrent write
        jobs.retain(|j| j.state == state);
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn compare_and_set(&self, job: &Job, expected_state: JobState) -> StoreResult<Job> {
        self.cas(job, expected_state, None).await
    }

    async fn publish_result(&self, job: &Job, result: ProcessingResult) -> StoreResult<Job> {
        self.cas(job, JobState::Processing, Some(&result)).await
    }

    async fn get_result(&self, job_id: &JobId) -> StoreResult<Option<ProcessingResult>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.result_key(job_id)).await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }
}
