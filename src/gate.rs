//! 模型并发闸门。
//!
//! 同一块设备上最多允许 `capacity` 个生成任务同时运行，多出来的请求排队等待，
//! 不拒绝、不超时。计数器全部公开并原子更新，`queue_length` 只用于观测。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::GenerationError;

#[derive(Debug, Default)]
struct GateCounters {
    in_use: AtomicUsize,
    waiting: AtomicUsize,
    peak_in_use: AtomicUsize,
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    counters: Arc<GateCounters>,
    capacity: usize,
}

/// 闸门状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateStatus {
    pub capacity: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub available: usize,
    pub queue_length: usize,
}

impl ConcurrencyGate {
    /// # Panics
    ///
    /// `capacity` 为 0 时 panic；配置层已保证不会出现。
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "gate capacity must be > 0");

        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            counters: Arc::new(GateCounters::default()),
            capacity,
        }
    }

    /// 等待直到拿到一个许可。返回的 [`GatePermit`] 被 drop 时归还许可。
    pub async fn acquire(&self) -> Result<GatePermit, GenerationError> {
        // 等待期间计入 waiting；future 被取消时 guard 负责减回去
        let waiting = WaitingGuard::enter(&self.counters);

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GenerationError::Unclassified(anyhow::anyhow!("concurrency gate closed")))?;

        let current = self.counters.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_use.fetch_max(current, Ordering::SeqCst);
        drop(waiting);

        Ok(GatePermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.counters.in_use.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.counters.waiting.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 启动以来同时持有许可的最大数量
    pub fn peak_in_use(&self) -> usize {
        self.counters.peak_in_use.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> GateStatus {
        let in_use = self.in_use();
        let waiting = self.waiting();
        GateStatus {
            capacity: self.capacity,
            in_use,
            waiting,
            available: self.available(),
            queue_length: in_use + waiting,
        }
    }
}

struct WaitingGuard<'a> {
    counters: &'a GateCounters,
}

impl<'a> WaitingGuard<'a> {
    fn enter(counters: &'a GateCounters) -> Self {
        counters.waiting.fetch_add(1, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counters.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 持有期间占用一个设备名额。
/// `in_use` 先于信号量许可归还，所以 `in_use` 不会超过真正被占用的许可数。
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<GateCounters>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.counters.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn new_gate_is_idle() {
        let gate = ConcurrencyGate::new(3);
        let status = gate.status();
        assert_eq!(status.capacity, 3);
        assert_eq!(status.in_use, 0);
        assert_eq!(status.waiting, 0);
        assert_eq!(status.available, 3);
        assert_eq!(status.queue_length, 0);
    }

    #[test]
    #[should_panic(expected = "gate capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = ConcurrencyGate::new(0);
    }

    #[tokio::test]
    async fn permit_drop_restores_baseline() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.acquire().await.unwrap();
        let b = gate.acquire().await.unwrap();
        assert_eq!(gate.in_use(), 2);
        assert_eq!(gate.available(), 0);

        drop(a);
        assert_eq!(gate.in_use(), 1);
        drop(b);
        assert_eq!(gate.status().queue_length, 0);
        assert_eq!(gate.available(), 2);
        assert_eq!(gate.peak_in_use(), 2);
    }

    #[tokio::test]
    async fn blocked_acquire_counts_as_waiting() {
        let gate = Arc::new(ConcurrencyGate::new(1));
        let held = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await.map(|_| ()) })
        };

        for _ in 0..100 {
            if gate.waiting() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(gate.waiting(), 1);
        assert_eq!(gate.status().queue_length, 2);

        drop(held);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.waiting(), 0);
        assert_eq!(gate.in_use(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_stops_waiting() {
        let gate = ConcurrencyGate::new(1);
        let _held = gate.acquire().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(20), gate.acquire()).await;
        assert!(attempt.is_err());
        assert_eq!(gate.waiting(), 0);
        assert_eq!(gate.in_use(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn burst_never_exceeds_capacity() {
        let gate = Arc::new(ConcurrencyGate::new(3));
        let live = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..24 {
            let gate = gate.clone();
            let live = live.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire().await.unwrap();
                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                live.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert!(gate.peak_in_use() <= 3);
        assert_eq!(gate.available(), 3);
    }
}
