//! JSONL 轮次存储
//!
//! 每个会话两个文件：`<id>.session.json`（会话头）与 `<id>.rounds.jsonl`（每行一轮）。
//! 追加后 fsync；读取时忽略崩溃留下的不完整末行，首次追加前把它截掉。
//! 会话写入终局轮后释放其尾部缓存。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::history::store::{validate_id, Tail};
use crate::history::{Round, RoundStore, SessionMeta, StoreError};

pub struct JsonlRoundStore {
    dir: PathBuf,
    /// 已读取过的会话尾部缓存；每个会话一把锁
    tails: RwLock<HashMap<String, Arc<Mutex<Option<Tail>>>>>,
}

impl JsonlRoundStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            tails: RwLock::new(HashMap::new()),
        }
    }

    fn meta_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.session.json"))
    }

    fn rounds_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.rounds.jsonl"))
    }

    async fn tail_slot(&self, session_id: &str) -> Arc<Mutex<Option<Tail>>> {
        if let Some(slot) = self.tails.read().await.get(session_id) {
            return slot.clone();
        }
        self.tails
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    async fn read_rounds(&self, session_id: &str) -> Result<Vec<Round>, StoreError> {
        let path = self.rounds_path(session_id);
        let data = match fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = data.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut rounds = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<Round>(line) {
                Ok(r) => rounds.push(r),
                // 只容忍最后一行损坏（写入中途崩溃）
                Err(e) if i + 1 == lines.len() => {
                    tracing::warn!(session_id = %session_id, error = %e, "ignoring torn trailing round record");
                }
                Err(e) => return Err(e.into()),
            }
        }
        rounds.sort_by_key(|r| r.round_index);
        Ok(rounds)
    }

    /// 崩溃恢复：截掉不完整的末行，并保证文件以换行结尾，下一条记录从新行开始
    async fn recover_tail(&self, session_id: &str) -> Result<Tail, StoreError> {
        let path = self.rounds_path(session_id);
        let data = match fs::read(&path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Tail::default()),
            Err(e) => return Err(e.into()),
        };

        let mut rounds = Vec::new();
        // 最后一条完整记录之后的字节偏移
        let mut good_end = 0usize;
        let mut start = 0usize;
        while start < data.len() {
            let line_end = data[start..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|p| start + p + 1)
                .unwrap_or(data.len());
            let line = data[start..line_end].trim_ascii();
            if line.is_empty() {
                good_end = line_end;
            } else {
                match serde_json::from_slice::<Round>(line) {
                    Ok(r) => {
                        rounds.push(r);
                        good_end = line_end;
                    }
                    Err(_) if line_end == data.len() => break,
                    Err(e) => return Err(e.into()),
                }
            }
            start = line_end;
        }

        if good_end < data.len() {
            tracing::warn!(
                session_id = %session_id,
                dropped_bytes = data.len() - good_end,
                "truncating torn trailing round record"
            );
            let file = fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(good_end as u64).await?;
            file.sync_all().await?;
        }
        if good_end > 0 && data[good_end - 1] != b'\n' {
            let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
            file.write_all(b"\n").await?;
            file.sync_data().await?;
        }

        rounds.sort_by_key(|r| r.round_index);
        Ok(Tail::of(&rounds))
    }

    async fn write_line(&self, session_id: &str, round: &Round) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(round)?;
        line.push('\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.rounds_path(session_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl RoundStore for JsonlRoundStore {
    async fn create_session(&self, meta: &SessionMeta) -> Result<(), StoreError> {
        validate_id(&meta.id)?;
        fs::create_dir_all(&self.dir).await?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.meta_path(&meta.id))
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(meta.id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(serde_json::to_string_pretty(meta)?.as_bytes())
            .await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<SessionMeta, StoreError> {
        validate_id(session_id)?;
        match fs::read_to_string(self.meta_path(session_id)).await {
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(session_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, session_id: &str, round: &Round) -> Result<(), StoreError> {
        // 会话必须存在
        self.session(session_id).await?;

        let slot = self.tail_slot(session_id).await;
        let mut guard = slot.lock().await;
        let cached = *guard;
        let mut tail = match cached {
            Some(t) => t,
            None => {
                let t = self.recover_tail(session_id).await?;
                *guard = Some(t);
                t
            }
        };
        tail.check(session_id, round)?;

        if let Err(e) = self.write_line(session_id, round).await {
            // 写入可能只完成了一部分：下次追加重新从磁盘恢复
            *guard = None;
            return Err(e);
        }

        tail.advance(round);
        *guard = Some(tail);
        if tail.closed {
            drop(guard);
            self.tails.write().await.remove(session_id);
        }
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<Round>, StoreError> {
        self.session(session_id).await?;
        self.read_rounds(session_id).await
    }
}
