//! Redis-backed store
//!
//! Records are JSON strings under `payment:{id}` and `escrow:{id}`. Sorted sets
//! keyed by timestamp (millis) index the escrows each job scans, so a pass never
//! walks the whole keyspace. A conditional update moves the record and its
//! index entries in one script.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Pipeline, Script, aio::ConnectionManager};

use crate::error::StoreError;
use crate::models::{EscrowStatus, EscrowTransaction, Payment};
use crate::ports::Store;

const AWAITING_RELEASE: &str = "escrows:awaiting_release";
const AWAITING_RATING: &str = "escrows:awaiting_rating";
const OPEN_DISPUTES: &str = "escrows:disputed";

/// Overwrites KEYS[1] with ARGV[2] only if its `status` equals ARGV[1], and
/// moves ARGV[3] in the index sets KEYS[2..4] in the same step. ARGV[4..6]
/// hold one score per index; an empty score removes the member.
static UPDATE_IF_STATUS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if not current then
            return 0
        end
        if cjson.decode(current)['status'] ~= ARGV[1] then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[2])
        for i = 2, 4 do
            local score = ARGV[i + 2]
            if score == '' then
                redis.call('ZREM', KEYS[i], ARGV[3])
            else
                redis.call('ZADD', KEYS[i], score, ARGV[3])
            end
        end
        return 1
        ",
    )
});

/// Where an escrow belongs in each scan index. `None` keeps it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexScores {
    release: Option<i64>,
    rating: Option<i64>,
    dispute: Option<i64>,
}

impl IndexScores {
    fn of(escrow: &EscrowTransaction) -> Self {
        let unrated = !escrow.rating_received
            && matches!(escrow.status, EscrowStatus::Held | EscrowStatus::PendingRating);
        let disputed = escrow.status == EscrowStatus::Disputed;

        Self {
            release: escrow
                .status
                .awaits_release()
                .then(|| escrow.release_eligible_at.timestamp_millis()),
            rating: unrated.then(|| escrow.held_at.timestamp_millis()),
            dispute: disputed.then(|| escrow.disputed_at.map_or(0, |at| at.timestamp_millis())),
        }
    }

    fn by_set(self) -> [(&'static str, Option<i64>); 3] {
        [
            (AWAITING_RELEASE, self.release),
            (AWAITING_RATING, self.rating),
            (OPEN_DISPUTES, self.dispute),
        ]
    }
}

fn payment_key(id: &str) -> String {
    format!("payment:{}", id)
}

fn escrow_key(id: &str) -> String {
    format!("escrow:{}", id)
}

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Keeps the scan indexes in line with the escrow's current status.
    fn index(pipe: &mut Pipeline, escrow: &EscrowTransaction) {
        let id = escrow.id.as_str();
        for (set, score) in IndexScores::of(escrow).by_set() {
            match score {
                Some(score) => pipe.zadd(set, id, score).ignore(),
                None => pipe.zrem(set, id).ignore(),
            };
        }
    }

    async fn load_escrows(&self, ids: Vec<String>) -> Result<Vec<EscrowTransaction>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut con = self.conn.clone();
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.get(escrow_key(id));
        }
        let values: Vec<Option<String>> = pipe.query_async(&mut con).await?;

        values
            .into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get_payment(&self, id: &str) -> Result<Option<Payment>, StoreError> {
        let mut con = self.conn.clone();
        let value: Option<String> = con.get(payment_key(id)).await?;
        Ok(value.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn put_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(payment)?;
        let _: () = con.set(payment_key(&payment.id), value).await?;
        Ok(())
    }

    async fn get_escrow(&self, id: &str) -> Result<Option<EscrowTransaction>, StoreError> {
        let mut con = self.conn.clone();
        let value: Option<String> = con.get(escrow_key(id)).await?;
        Ok(value.map(|json| serde_json::from_str(&json)).transpose()?)
    }

    async fn put_escrow(&self, escrow: &EscrowTransaction) -> Result<(), StoreError> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(escrow)?;

        let mut pipe = redis::pipe();
        pipe.atomic().set(escrow_key(&escrow.id), value).ignore();
        Self::index(&mut pipe, escrow);
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn update_escrow_if(
        &self,
        escrow: &EscrowTransaction,
        expected: EscrowStatus,
    ) -> Result<bool, StoreError> {
        let mut con = self.conn.clone();
        let value = serde_json::to_string(escrow)?;

        let mut invocation = UPDATE_IF_STATUS.key(escrow_key(&escrow.id));
        invocation.arg(expected.as_str()).arg(value).arg(escrow.id.as_str());
        for (set, score) in IndexScores::of(escrow).by_set() {
            invocation
                .key(set)
                .arg(score.map(|s| s.to_string()).unwrap_or_default());
        }

        let swapped: i64 = invocation.invoke_async(&mut con).await?;
        Ok(swapped == 1)
    }

    async fn escrows_awaiting_release(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>, StoreError> {
        let mut con = self.conn.clone();
        let ids: Vec<String> = con
            .zrangebyscore(AWAITING_RELEASE, "-inf", now.timestamp_millis())
            .await?;
        let escrows = self.load_escrows(ids).await?;
        Ok(escrows
            .into_iter()
            .filter(|e| e.status.awaits_release() && e.release_eligible_at <= now)
            .collect())
    }

    async fn escrows_awaiting_rating(
        &self,
        held_from: DateTime<Utc>,
        held_to: DateTime<Utc>,
    ) -> Result<Vec<EscrowTransaction>, StoreError> {
        let mut con = self.conn.clone();
        let ids: Vec<String> = con
            .zrangebyscore(
                AWAITING_RATING,
                held_from.timestamp_millis(),
                held_to.timestamp_millis(),
            )
            .await?;
        let escrows = self.load_escrows(ids).await?;
        Ok(escrows
            .into_iter()
            .filter(|e| !e.rating_received)
            .collect())
    }

    async fn open_disputes(&self) -> Result<Vec<EscrowTransaction>, StoreError> {
        let mut con = self.conn.clone();
        let ids: Vec<String> = con.zrange(OPEN_DISPUTES, 0, -1).await?;
        let escrows = self.load_escrows(ids).await?;
        Ok(escrows
            .into_iter()
            .filter(|e| e.status == EscrowStatus::Disputed)
            .collect())
    }
}
