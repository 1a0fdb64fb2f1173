//! 能力资源池：按资源名限制并发
//!
//! 能力可声明自己占用的资源（如 filesystem、network）；调用前从对应 Semaphore 取得许可，
//! 许可随 ResourcePermit 析构自动归还，无论处理函数正常返回、出错、panic、超时还是被取消。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 未显式配置的资源默认并发数
const DEFAULT_RESOURCE_PERMITS: usize = 1;

/// 资源许可：持有期间占用一个名额，析构时释放
#[derive(Debug)]
pub struct ResourcePermit {
    resource: String,
    _permit: OwnedSemaphorePermit,
}

impl ResourcePermit {
    pub fn resource(&self) -> &str {
        &self.resource
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        tracing::trace!(resource = %self.resource, "resource released");
    }
}

/// 资源池：资源名 -> Semaphore，首次使用时按配置的上限懒创建
#[derive(Debug, Default)]
pub struct ResourcePool {
    limits: HashMap<String, usize>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ResourcePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置某个资源的最大并发数（至少为 1）
    pub fn with_limit(mut self, resource: &str, permits: usize) -> Self {
        self.limits.insert(resource.to_string(), permits.max(1));
        self
    }

    fn semaphore(&self, resource: &str) -> Arc<Semaphore> {
        let mut map = self.semaphores.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(resource.to_string())
            .or_insert_with(|| {
                let permits = self
                    .limits
                    .get(resource)
                    .copied()
                    .unwrap_or(DEFAULT_RESOURCE_PERMITS);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }

    /// 获取资源许可；Semaphore 被关闭时返回 None
    pub async fn acquire(&self, resource: &str) -> Option<ResourcePermit> {
        let permit = self.semaphore(resource).acquire_owned().await.ok()?;
        Some(ResourcePermit {
            resource: resource.to_string(),
            _permit: permit,
        })
    }

    /// 当前剩余名额（测试与诊断用）
    pub fn available(&self, resource: &str) -> usize {
        self.semaphore(resource).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let pool = ResourcePool::new().with_limit("filesystem", 2);
        let a = pool.acquire("filesystem").await.unwrap();
        assert_eq!(pool.available("filesystem"), 1);
        drop(a);
        assert_eq!(pool.available("filesystem"), 2);
    }

    #[tokio::test]
    async fn test_default_limit_is_exclusive() {
        let pool = ResourcePool::new();
        let held = pool.acquire("screen").await.unwrap();
        assert_eq!(held.resource(), "screen");
        assert_eq!(pool.available("screen"), 0);
        let waiter = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            pool.acquire("screen"),
        )
        .await;
        assert!(waiter.is_err(), "second acquire should wait");
    }
}
