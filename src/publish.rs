//! Best-effort publication of gate verdicts to a Redis stream.

use std::time::Duration;

use redis::AsyncCommands;
use tracing::{info, warn};

use crate::gate::GateVerdict;

pub const VERDICT_STREAM: &str = "ingest.verdicts";

#[derive(Clone)]
pub struct VerdictPublisher {
    conn: redis::aio::ConnectionManager,
}

impl VerdictPublisher {
    pub async fn connect_with_retry(url: &str, max_retries: u32) -> redis::RedisResult<Self> {
        let mut attempt = 0;
        loop {
            let result = match redis::Client::open(url) {
                Ok(client) => redis::aio::ConnectionManager::new(client).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(conn) => {
                    info!("Connected to Redis");
                    return Ok(Self { conn });
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        return Err(e);
                    }
                    warn!("Redis connection attempt {} failed: {}. Retrying...", attempt, e);
                    tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
                }
            }
        }
    }

    pub async fn publish(&self, verdict: &GateVerdict) -> anyhow::Result<String> {
        let payload = serde_json::to_string(verdict)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(
                VERDICT_STREAM,
                "*",
                &[
                    ("run_id", verdict.run_id.to_string()),
                    ("decision", verdict.decision.as_str().to_string()),
                    ("safe_to_predict", verdict.safe_to_predict.to_string()),
                    ("data", payload),
                ],
            )
            .await?;
        info!("Published verdict for run {} to {}", verdict.run_id, VERDICT_STREAM);
        Ok(id)
    }
}
