use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::types::TransactionRecord;

/// 종료 상태 트랜잭션 기록 저장소
#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn record(&self, record: &TransactionRecord) -> Result<()>;
}

pub fn from_config(config: &StorageConfig) -> Arc<dyn TransactionStore> {
    if config.enabled {
        info!("📦 트랜잭션 기록 저장: {}", config.path);
        Arc::new(JsonlStore::new(&config.path))
    } else {
        Arc::new(NullStore)
    }
}

/// 한 줄에 한 건씩 JSON으로 추가 기록
pub struct JsonlStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load_all(&self) -> Result<Vec<TransactionRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("line {} of {}", i + 1, self.path.display()))
            })
            .collect()
    }
}

#[async_trait]
impl TransactionStore for JsonlStore {
    async fn record(&self, record: &TransactionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!("📦 기록 저장 {:?} ({:?})", record.tx_hash, record.status);
        Ok(())
    }
}

/// 기록하지 않음
#[derive(Debug, Default)]
pub struct NullStore;

#[async_trait]
impl TransactionStore for NullStore {
    async fn record(&self, _record: &TransactionRecord) -> Result<()> {
        Ok(())
    }
}

/// 메모리에 보관 (테스트, mock 모드)
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TransactionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<TransactionRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn record(&self, record: &TransactionRecord) -> Result<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxStatus;
    use chrono::Utc;
    use ethers::types::{Address, H256, U256};

    fn record(status: TxStatus) -> TransactionRecord {
        TransactionRecord {
            tx_hash: H256::random(),
            chain_id: 1,
            from: Address::random(),
            to: Address::random(),
            value: U256::from(1_000u64),
            gas_price: U256::from(20_000_000_000u64),
            gas_used: Some(U256::from(21_000u64)),
            block_number: Some(18_000_000),
            status,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_jsonl_store_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir.path().join("nested").join("tx.jsonl"));

        assert!(store.load_all().await.unwrap().is_empty());

        let first = record(TxStatus::Success);
        let second = record(TxStatus::Dropped);
        store.record(&first).await.unwrap();
        store.record(&second).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded, vec![first, second]);

        let raw = tokio::fs::read_to_string(store.path()).await.unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"dropped\""));
    }

    #[tokio::test]
    async fn test_store_selection() {
        let disabled = StorageConfig {
            enabled: false,
            ..Default::default()
        };
        from_config(&disabled).record(&record(TxStatus::Success)).await.unwrap();

        let memory = MemoryStore::new();
        memory.record(&record(TxStatus::Reverted)).await.unwrap();
        assert_eq!(memory.records().await[0].status, TxStatus::Reverted);
    }
}
