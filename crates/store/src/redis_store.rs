//! Redis-backed sequence store and member directory.
//!
//! Layout (all keys under the configured prefix):
//! - `seq:{id}` JSON definition, `seq:{id}:counters` hash with sent/opens/clicks
//! - `sequences` set of sequence ids
//! - `enr:{id}` JSON enrollment, `enr:pair:{member}:{sequence}` uniqueness key,
//!   `enrollments` set of enrollment ids
//! - `dlv:{tracking_id}` JSON delivery, `dlv:key:{sequence}:{member}:{step}`
//!   uniqueness key, `seq:{id}:deliveries` set of tracking ids
//! - `member:{id}` JSON member profile
//!
//! Counters use `HINCRBY`; flag and progress updates run as Lua scripts so
//! the compare and the write happen in one server-side step.

use crate::{Engagement, MarkOutcome, MemberDirectory, ProgressUpdate, SequenceStore};
use async_trait::async_trait;
use cadence_core::config::RedisConfig;
use cadence_core::error::{CadenceError, CadenceResult};
use cadence_core::types::{
    DeliveryKey, DeliveryRecord, Enrollment, EnrollmentStatus, Member, Sequence, SequenceCounter,
};
use chrono::{DateTime, SecondsFormat, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MGET_CHUNK: usize = 500;

const MARK_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return {0, ''} end
local rec = cjson.decode(raw)
if rec[ARGV[1]] == true then return {1, rec['sequence_id']} end
rec[ARGV[1]] = true
rec[ARGV[2]] = ARGV[3]
redis.call('SET', KEYS[1], cjson.encode(rec))
return {2, rec['sequence_id']}
"#;

const PROGRESS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return -1 end
local e = cjson.decode(raw)
if e['status'] == 'completed' or e['status'] ~= ARGV[4] then return 0 end
if tonumber(e['current_step']) ~= tonumber(ARGV[1]) then return 0 end
e['current_step'] = tonumber(ARGV[2])
if ARGV[3] ~= '' then
  e['status'] = 'completed'
  e['completed_at'] = ARGV[3]
end
redis.call('SET', KEYS[1], cjson.encode(e))
return 1
"#;

const STATUS_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return -1 end
local e = cjson.decode(raw)
if e['status'] ~= ARGV[1] then return 0 end
e['status'] = ARGV[2]
redis.call('SET', KEYS[1], cjson.encode(e))
return 1
"#;

fn store_err(e: RedisError) -> CadenceError {
    CadenceError::Store(e.to_string())
}

fn status_str(status: EnrollmentStatus) -> &'static str {
    match status {
        EnrollmentStatus::Active => "active",
        EnrollmentStatus::Paused => "paused",
        EnrollmentStatus::Completed => "completed",
    }
}

fn counter_field(counter: SequenceCounter) -> &'static str {
    match counter {
        SequenceCounter::Sent => "sent",
        SequenceCounter::Opens => "opens",
        SequenceCounter::Clicks => "clicks",
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Redis-backed store. Cheap to clone; all clones share one multiplexed
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    mark_script: Script,
    progress_script: Script,
    status_script: Script,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: &RedisConfig) -> CadenceResult<Self> {
        info!(url = %config.url, prefix = %config.key_prefix, "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str()).map_err(store_err)?;
        let mut conn = ConnectionManager::new(client).await.map_err(store_err)?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        info!(response = %pong, "Redis connection established");

        Ok(Self {
            conn,
            prefix: config.key_prefix.clone(),
            mark_script: Script::new(MARK_SCRIPT),
            progress_script: Script::new(PROGRESS_SCRIPT),
            status_script: Script::new(STATUS_SCRIPT),
        })
    }

    fn key(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn delivery_key(&self, key: &DeliveryKey) -> String {
        self.key(format!(
            "dlv:key:{}:{}:{}",
            key.sequence_id, key.member_id, key.step_index
        ))
    }

    /// Store a member profile for the directory.
    pub async fn put_member(&self, member: &Member) -> CadenceResult<()> {
        let json = serde_json::to_string(member)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.key(format!("member:{}", member.id)), json)
            .await
            .map_err(store_err)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: String) -> CadenceResult<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await.map_err(store_err)?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Fetch many JSON values, skipping missing keys and unparseable ones.
    async fn mget_json<T: serde::de::DeserializeOwned>(&self, keys: Vec<String>) -> CadenceResult<Vec<T>> {
        let mut conn = self.conn.clone();
        let mut out = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MGET_CHUNK) {
            let values: Vec<Option<String>> = redis::cmd("MGET")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(store_err)?;
            for (key, value) in chunk.iter().zip(values) {
                let Some(json) = value else { continue };
                match serde_json::from_str(&json) {
                    Ok(v) => out.push(v),
                    Err(e) => warn!(key = %key, error = %e, "Skipping malformed record"),
                }
            }
        }
        Ok(out)
    }

    async fn counters(&self, sequence_id: Uuid) -> CadenceResult<HashMap<String, u64>> {
        let mut conn = self.conn.clone();
        conn.hgetall(self.key(format!("seq:{sequence_id}:counters")))
            .await
            .map_err(store_err)
    }
}

#[async_trait]
impl SequenceStore for RedisStore {
    async fn put_sequence(&self, sequence: &Sequence) -> CadenceResult<()> {
        // Counters live in their own hash so definition writes never race them.
        let mut definition = sequence.clone();
        definition.total_sent = 0;
        definition.total_opens = 0;
        definition.total_clicks = 0;
        let json = serde_json::to_string(&definition)?;

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(self.key(format!("seq:{}", sequence.id)), json)
            .await
            .map_err(store_err)?;
        conn.sadd::<_, _, ()>(self.key("sequences"), sequence.id.to_string())
            .await
            .map_err(store_err)?;
        debug!(sequence_id = %sequence.id, "Sequence stored in Redis");
        Ok(())
    }

    async fn get_sequence(&self, id: Uuid) -> CadenceResult<Option<Sequence>> {
        let Some(mut sequence) = self
            .get_json::<Sequence>(self.key(format!("seq:{id}")))
            .await?
        else {
            return Ok(None);
        };
        let counters = self.counters(id).await?;
        sequence.total_sent = counters.get("sent").copied().unwrap_or(0);
        sequence.total_opens = counters.get("opens").copied().unwrap_or(0);
        sequence.total_clicks = counters.get("clicks").copied().unwrap_or(0);
        Ok(Some(sequence))
    }

    async fn list_sequences(&self) -> CadenceResult<Vec<Sequence>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.key("sequences")).await.map_err(store_err)?;
        let mut sequences = Vec::with_capacity(ids.len());
        for id in ids {
            let Ok(id) = Uuid::parse_str(&id) else { continue };
            if let Some(sequence) = self.get_sequence(id).await? {
                sequences.push(sequence);
            }
        }
        sequences.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(sequences)
    }

    async fn increment_counter(
        &self,
        sequence_id: Uuid,
        counter: SequenceCounter,
    ) -> CadenceResult<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn
            .hincr(
                self.key(format!("seq:{sequence_id}:counters")),
                counter_field(counter),
                1,
            )
            .await
            .map_err(store_err)?;
        Ok(value.max(0) as u64)
    }

    async fn insert_enrollment(&self, enrollment: &Enrollment) -> CadenceResult<()> {
        let json = serde_json::to_string(enrollment)?;
        let record_key = self.key(format!("enr:{}", enrollment.id));
        let pair_key = self.key(format!(
            "enr:pair:{}:{}",
            enrollment.member_id, enrollment.sequence_id
        ));

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(&record_key, json)
            .await
            .map_err(store_err)?;
        let claimed: bool = conn
            .set_nx(&pair_key, enrollment.id.to_string())
            .await
            .map_err(store_err)?;
        if !claimed {
            conn.del::<_, ()>(&record_key).await.map_err(store_err)?;
            return Err(CadenceError::Conflict(format!(
                "member {} already enrolled in sequence {}",
                enrollment.member_id, enrollment.sequence_id
            )));
        }
        conn.sadd::<_, _, ()>(self.key("enrollments"), enrollment.id.to_string())
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_enrollment(&self, id: Uuid) -> CadenceResult<Option<Enrollment>> {
        self.get_json(self.key(format!("enr:{id}"))).await
    }

    async fn find_enrollment(
        &self,
        member_id: Uuid,
        sequence_id: Uuid,
    ) -> CadenceResult<Option<Enrollment>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .get(self.key(format!("enr:pair:{member_id}:{sequence_id}")))
            .await
            .map_err(store_err)?;
        match id.and_then(|id| Uuid::parse_str(&id).ok()) {
            Some(id) => self.get_enrollment(id).await,
            None => Ok(None),
        }
    }

    async fn list_active_enrollments(&self) -> CadenceResult<Vec<Enrollment>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.key("enrollments"))
            .await
            .map_err(store_err)?;
        let keys = ids
            .iter()
            .map(|id| self.key(format!("enr:{id}")))
            .collect();
        let mut active: Vec<Enrollment> = self
            .mget_json::<Enrollment>(keys)
            .await?
            .into_iter()
            .filter(|e| e.status == EnrollmentStatus::Active)
            .collect();
        active.sort_by(|a, b| a.enrolled_at.cmp(&b.enrolled_at));
        Ok(active)
    }

    async fn update_progress(&self, id: Uuid, update: ProgressUpdate) -> CadenceResult<bool> {
        let mut conn = self.conn.clone();
        let completed_at = update.completed_at.map(timestamp).unwrap_or_default();
        let result: i64 = self
            .progress_script
            .key(self.key(format!("enr:{id}")))
            .arg(update.expected_step)
            .arg(update.new_step)
            .arg(completed_at)
            .arg(status_str(update.expected_status))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        match result {
            -1 => Err(CadenceError::NotFound(format!("enrollment {id}"))),
            n => Ok(n == 1),
        }
    }

    async fn transition_status(
        &self,
        id: Uuid,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> CadenceResult<bool> {
        let mut conn = self.conn.clone();
        let result: i64 = self
            .status_script
            .key(self.key(format!("enr:{id}")))
            .arg(status_str(from))
            .arg(status_str(to))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;
        match result {
            -1 => Err(CadenceError::NotFound(format!("enrollment {id}"))),
            n => Ok(n == 1),
        }
    }

    async fn delivery_exists(&self, key: DeliveryKey) -> CadenceResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(self.delivery_key(&key))
            .await
            .map_err(store_err)
    }

    async fn insert_delivery(&self, record: &DeliveryRecord) -> CadenceResult<bool> {
        let mut conn = self.conn.clone();
        let claimed: bool = conn
            .set_nx(self.delivery_key(&record.key()), &record.tracking_id)
            .await
            .map_err(store_err)?;
        if !claimed {
            return Ok(false);
        }
        let json = serde_json::to_string(record)?;
        conn.set::<_, _, ()>(self.key(format!("dlv:{}", record.tracking_id)), json)
            .await
            .map_err(store_err)?;
        conn.sadd::<_, _, ()>(
            self.key(format!("seq:{}:deliveries", record.sequence_id)),
            &record.tracking_id,
        )
        .await
        .map_err(store_err)?;
        Ok(true)
    }

    async fn get_delivery(&self, tracking_id: &str) -> CadenceResult<Option<DeliveryRecord>> {
        self.get_json(self.key(format!("dlv:{tracking_id}")))
            .await
    }

    async fn list_deliveries(&self, sequence_id: Uuid) -> CadenceResult<Vec<DeliveryRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.key(format!("seq:{sequence_id}:deliveries")))
            .await
            .map_err(store_err)?;
        let keys = ids
            .iter()
            .map(|id| self.key(format!("dlv:{id}")))
            .collect();
        let mut records: Vec<DeliveryRecord> = self.mget_json(keys).await?;
        records.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        Ok(records)
    }

    async fn mark_engagement(
        &self,
        tracking_id: &str,
        engagement: Engagement,
        at: DateTime<Utc>,
    ) -> CadenceResult<MarkOutcome> {
        let (flag, stamp) = match engagement {
            Engagement::Open => ("opened", "opened_at"),
            Engagement::Click => ("clicked", "clicked_at"),
        };
        let mut conn = self.conn.clone();
        let (code, sequence_id): (i64, String) = self
            .mark_script
            .key(self.key(format!("dlv:{tracking_id}")))
            .arg(flag)
            .arg(stamp)
            .arg(timestamp(at))
            .invoke_async(&mut conn)
            .await
            .map_err(store_err)?;

        if code == 0 {
            return Ok(MarkOutcome::Unknown);
        }
        let sequence_id = Uuid::parse_str(&sequence_id)
            .map_err(|e| CadenceError::Store(format!("corrupt delivery {tracking_id}: {e}")))?;
        Ok(if code == 1 {
            MarkOutcome::AlreadySet { sequence_id }
        } else {
            MarkOutcome::Marked { sequence_id }
        })
    }
}

#[async_trait]
impl MemberDirectory for RedisStore {
    async fn get_member(&self, id: Uuid) -> CadenceResult<Option<Member>> {
        self.get_json(self.key(format!("member:{id}"))).await
    }
}
