//! Leader election loop.
//!
//! Polls a named non-blocking lock; on gaining leadership it starts the
//! singleton tasks (queue processor, orphan monitor, retention scanner) and
//! on losing it stops them. Engines without multi-master support grant the
//! lock unconditionally, collapsing to the single-master assumption.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crucible_core::store::LeaderLock;

/// Factory producing the singleton tasks each time leadership is gained.
/// Tasks receive a shutdown signal that fires on leadership loss.
pub type SingletonFactory =
    Arc<dyn Fn(watch::Receiver<bool>) -> Vec<JoinHandle<()>> + Send + Sync>;

pub struct LeaderLoop {
    lock: Arc<dyn LeaderLock>,
    role: String,
    poll: Duration,
    factory: SingletonFactory,
}

impl LeaderLoop {
    pub fn new(
        lock: Arc<dyn LeaderLock>,
        role: impl Into<String>,
        poll: Duration,
        factory: SingletonFactory,
    ) -> Self {
        Self {
            lock,
            role: role.into(),
            poll,
            factory,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut is_leader = false;
        let mut singleton_stop: Option<watch::Sender<bool>> = None;
        let mut singletons: Vec<JoinHandle<()>> = Vec::new();

        loop {
            let acquired = match self.lock.try_acquire(&self.role).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    error!(role = %self.role, error = %e, "leader lock attempt failed");
                    false
                }
            };

            match (is_leader, acquired) {
                (false, true) => {
                    info!(role = %self.role, "gained leadership");
                    let (stop_tx, stop_rx) = watch::channel(false);
                    singletons = (self.factory)(stop_rx);
                    singleton_stop = Some(stop_tx);
                    is_leader = true;
                }
                (true, false) => {
                    info!(role = %self.role, "lost leadership");
                    Self::stop_singletons(&mut singleton_stop, &mut singletons).await;
                    is_leader = false;
                }
                _ => {}
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.poll) => {}
            }
        }

        if is_leader {
            Self::stop_singletons(&mut singleton_stop, &mut singletons).await;
            if let Err(e) = self.lock.release(&self.role).await {
                error!(role = %self.role, error = %e, "leader lock release failed");
            }
        }
        info!(role = %self.role, "leader loop stopped");
    }

    async fn stop_singletons(
        stop: &mut Option<watch::Sender<bool>>,
        singletons: &mut Vec<JoinHandle<()>>,
    ) {
        if let Some(stop) = stop.take() {
            let _ = stop.send(true);
        }
        for handle in singletons.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A lock that only one holder can own, flippable from the test.
    struct TestLock {
        holder: Mutex<Option<String>>,
        allow: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LeaderLock for TestLock {
        async fn try_acquire(&self, name: &str) -> crucible_core::Result<bool> {
            if !self.allow.load(Ordering::SeqCst) {
                let mut holder = self.holder.lock().unwrap();
                if holder.as_deref() == Some(name) {
                    *holder = None;
                }
                return Ok(false);
            }
            let mut holder = self.holder.lock().unwrap();
            match holder.as_deref() {
                None => {
                    *holder = Some(name.to_string());
                    Ok(true)
                }
                Some(existing) => Ok(existing == name),
            }
        }

        async fn release(&self, name: &str) -> crucible_core::Result<()> {
            let mut holder = self.holder.lock().unwrap();
            if holder.as_deref() == Some(name) {
                *holder = None;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn starts_and_stops_singletons_on_leadership_transitions() {
        let lock = Arc::new(TestLock {
            holder: Mutex::new(None),
            allow: std::sync::atomic::AtomicBool::new(true),
        });
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));

        let factory: SingletonFactory = {
            let started = started.clone();
            let stopped = stopped.clone();
            Arc::new(move |mut stop: watch::Receiver<bool>| {
                started.fetch_add(1, Ordering::SeqCst);
                let stopped = stopped.clone();
                vec![tokio::spawn(async move {
                    let _ = stop.changed().await;
                    stopped.fetch_add(1, Ordering::SeqCst);
                })]
            })
        };

        let leader_loop = LeaderLoop::new(lock.clone(), "queue-processor", Duration::from_millis(20), factory);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(leader_loop.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        // Lose the lock: singletons stop.
        lock.allow.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);

        // Regain it: a fresh set starts.
        lock.allow.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn only_one_instance_leads_at_a_time() {
        let lock = Arc::new(TestLock {
            holder: Mutex::new(None),
            allow: std::sync::atomic::AtomicBool::new(true),
        });

        // Two competing loops share one named lock; the counter tracks how
        // many believe they lead simultaneously.
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        for _ in 0..2 {
            let factory: SingletonFactory = {
                let concurrent = concurrent.clone();
                let max_seen = max_seen.clone();
                Arc::new(move |mut stop: watch::Receiver<bool>| {
                    let concurrent = concurrent.clone();
                    let max_seen = max_seen.clone();
                    vec![tokio::spawn(async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        let _ = stop.changed().await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })]
                })
            };
            let leader_loop =
                LeaderLoop::new(lock.clone(), "orphan-monitor", Duration::from_millis(10), factory);
            handles.push(tokio::spawn(leader_loop.run(shutdown_rx.clone())));
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
