//! 活跃会话登记表
//!
//! 一把互斥锁只保护成员关系。表中存放的是 IO 任务的 [`AbortHandle`]，
//! 它不拥有会话，只用于关闭时强制回收。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::task::AbortHandle;

use crate::server::{SessionId, lock_unpoisoned};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<SessionId, AbortHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在持锁状态下启动任务并登记
    ///
    /// 任务结束时会调用 [`remove`](Self::remove)，持锁启动保证移除一定发生在登记之后。
    /// `spawn` 只应启动任务，不能执行应用代码。
    pub fn register(&self, id: SessionId, spawn: impl FnOnce() -> AbortHandle) {
        let mut sessions = lock_unpoisoned(&self.sessions);
        let handle = spawn();
        sessions.insert(id, handle);
    }

    /// 移除会话，重复移除是安全的
    pub fn remove(&self, id: SessionId) -> bool {
        lock_unpoisoned(&self.sessions).remove(&id).is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        lock_unpoisoned(&self.sessions).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空登记表并中止所有 IO 任务，返回被驱逐的数量
    pub fn evict_all(&self) -> usize {
        let evicted: Vec<AbortHandle> = lock_unpoisoned(&self.sessions).drain().map(|(_, handle)| handle).collect();
        for handle in &evicted {
            handle.abort();
        }
        evicted.len()
    }
}
