//! 会话租约：同一会话同一时刻只允许一个写者（单作业或批次）
//!
//! 租约随 SessionLease 的生命周期释放；单作业控制器与批量调度器共用同一份 SessionLeases。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::history::SessionId;

#[derive(Debug, Default)]
pub struct SessionLeases {
    /// session_id → 持有者（job_id / batch_id）
    owners: Mutex<HashMap<SessionId, String>>,
}

impl SessionLeases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<SessionId, String>> {
        self.owners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 占用会话；已被占用时返回当前持有者
    pub fn acquire(self: &Arc<Self>, session_id: &str, owner: &str) -> Result<SessionLease, String> {
        let mut owners = self.owners();
        if let Some(current) = owners.get(session_id) {
            return Err(current.clone());
        }
        owners.insert(session_id.to_string(), owner.to_string());
        Ok(SessionLease {
            leases: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    pub fn owner(&self, session_id: &str) -> Option<String> {
        self.owners().get(session_id).cloned()
    }
}

/// 持有期间独占会话的写入权
#[derive(Debug)]
pub struct SessionLease {
    leases: Arc<SessionLeases>,
    session_id: SessionId,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.leases.owners().remove(&self.session_id);
    }
}
