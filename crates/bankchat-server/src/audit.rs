use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only, hash-chained JSONL trail of routing decisions.
pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TurnAuditRecord {
    pub audit_id: String,
    pub user_id: i64,
    pub code: String,
    pub channel: String,
    pub branch: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl TurnAuditRecord {
    pub fn new(user_id: i64, code: &str, channel: &str, branch: &str, reason_code: &str) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            user_id,
            code: code.to_string(),
            channel: channel.to_string(),
            branch: branch.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            message_id: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    pub fn with_message_id(mut self, message_id: Option<i64>) -> Self {
        self.message_id = message_id;
        self
    }
}

impl AuditJsonl {
    pub async fn new(path: &str) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Write failures are logged and swallowed; the trail never fails a turn.
    pub async fn append(&self, mut rec: TurnAuditRecord) {
        let mut file = self.file.lock().await;
        let mut last_hash = self.last_hash.lock().await;
        rec.prev_hash = last_hash.clone();
        rec.record_hash = match record_hash(&rec) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "audit record hash failed");
                return;
            }
        };

        let line = match serde_json::to_string(&rec) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "audit record serialize failed");
                return;
            }
        };
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        match written {
            Ok(()) => *last_hash = Some(rec.record_hash),
            Err(e) => tracing::warn!(error = %e, "audit append failed"),
        }
    }
}

fn record_hash(rec: &TurnAuditRecord) -> Result<String, String> {
    let mut seeded = rec.clone();
    seeded.record_hash.clear();
    let canonical = serde_jcs::to_string(&seeded)
        .map_err(|e| format!("failed to canonicalize audit record: {e}"))?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: TurnAuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = record_hash(&rec).map_err(|e| format!("line {}: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("bankchat-audit-unit-{nanos}.jsonl"))
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn chain_survives_reopen_and_detects_edits() {
        let path = temp_path();
        {
            let audit = AuditJsonl::new(&path).await.unwrap();
            audit
                .append(TurnAuditRecord::new(1, "111", "text", "guided_prompt", "prompt"))
                .await;
        }
        let audit = AuditJsonl::new(&path).await.unwrap();
        audit
            .append(
                TurnAuditRecord::new(1, "000", "text", "free_form", "completion_ok")
                    .with_message_id(Some(4)),
            )
            .await;
        assert_eq!(
            verify_audit_chain(&path).unwrap(),
            "audit chain verified: 2 records"
        );

        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"111\"", "\"112\"")).unwrap();
        assert!(verify_audit_chain(&path).is_err());
    }
}
