//! 主机端口分配
//!
//! 每次分配都重新读取运行时中已绑定的端口，不做缓存。
//! 读取与绑定之间存在竞争，撞端口会在实例启动时以 InstanceStart 失败体现。

use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use crate::error::DeployError;
use crate::infra::runtime::ContainerRuntime;

/// 端口分配器
pub struct PortAllocator {
    runtime: Arc<dyn ContainerRuntime>,
    range: Range<u16>,
}

impl PortAllocator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, range: Range<u16>) -> Self {
        Self { runtime, range }
    }

    /// 从范围内均匀随机取一个未被占用的端口
    pub async fn allocate(&self) -> Result<u16, DeployError> {
        self.allocate_excluding(&[]).await
    }

    /// 同 `allocate`，额外避开调用方本次请求中已经拿到的端口
    pub async fn allocate_excluding(&self, taken: &[u16]) -> Result<u16, DeployError> {
        let mut used: HashSet<u16> = self
            .runtime
            .used_host_ports()
            .await
            .map_err(|e| DeployError::upstream(format!("failed to list used ports: {}", e)))?
            .into_iter()
            .collect();
        used.extend(taken);

        if self.range.clone().all(|port| used.contains(&port)) {
            return Err(DeployError::internal(format!(
                "port range exhausted ({}-{})",
                self.range.start, self.range.end
            )));
        }

        let port = {
            let mut rng = rand::thread_rng();
            loop {
                let candidate = rng.gen_range(self.range.clone());
                if !used.contains(&candidate) {
                    break candidate;
                }
            }
        };

        debug!(port, used = used.len(), "Allocated host port");
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;

    #[tokio::test]
    async fn test_allocation_stays_in_range() {
        let runtime = FakeRuntime::new();
        let allocator = PortAllocator::new(runtime, 30000..30010);

        for _ in 0..50 {
            let port = allocator.allocate().await.unwrap();
            assert!((30000..30010).contains(&port));
        }
    }

    #[tokio::test]
    async fn test_allocation_avoids_used_ports() {
        let runtime = FakeRuntime::new();
        runtime.state().foreign_ports = (30000..30009).collect();
        runtime.seed_container("other", vec![30009]);
        let allocator = PortAllocator::new(runtime.clone(), 30000..30011);

        for _ in 0..20 {
            assert_eq!(allocator.allocate().await.unwrap(), 30010);
        }
    }

    #[tokio::test]
    async fn test_allocation_excludes_taken() {
        let runtime = FakeRuntime::new();
        let allocator = PortAllocator::new(runtime, 30000..30002);

        for _ in 0..20 {
            assert_eq!(allocator.allocate_excluding(&[30000]).await.unwrap(), 30001);
        }
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let runtime = FakeRuntime::new();
        runtime.state().foreign_ports = vec![30000, 30001];
        let allocator = PortAllocator::new(runtime, 30000..30002);

        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, DeployError::Internal(_)));
    }

    #[tokio::test]
    async fn test_enumeration_failure_is_upstream() {
        let runtime = FakeRuntime::new();
        runtime.state().fail_list_ports = true;
        let allocator = PortAllocator::new(runtime, 30000..30100);

        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, DeployError::UpstreamProvisioning(_)));
    }
}
