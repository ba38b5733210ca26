//! Idle-session detection for draining backends.
//!
//! When a backend pod enters the DRAINING state its address is armed and
//! new sessions to it are wrapped so that a period of total inactivity
//! closes them, nudging clients to reconnect elsewhere. Connections to
//! addresses that are not armed at wrap time are returned untouched and
//! are never subject to the timeout. Disarming an address cancels
//! enforcement on its existing wrappers.

use std::collections::{HashMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::admit::Conn;

/// One-shot notification that a wrapped connection went idle.
pub type FireCallback = Box<dyn FnOnce() + Send>;

struct TrackedConn {
    /// Milliseconds since the monitor's epoch of the last observed byte.
    last_active_ms: AtomicU64,
    /// Taken when the timeout fires; at most one call per wrapper.
    on_fire: Mutex<Option<FireCallback>>,
}

#[derive(Default)]
struct State {
    armed: HashSet<String>,
    conns: HashMap<String, Vec<Weak<TrackedConn>>>,
}

/// Tracks wrapped connections per backend address and fires their
/// callbacks after `timeout` of silence while the address is armed.
pub struct IdleMonitor {
    timeout: Duration,
    epoch: Instant,
    state: Mutex<State>,
}

impl IdleMonitor {
    pub fn new(timeout: Duration, mut quiesce: watch::Receiver<bool>) -> Arc<Self> {
        let monitor = Arc::new(Self {
            timeout,
            epoch: Instant::now(),
            state: Mutex::new(State::default()),
        });

        let scanner = Arc::clone(&monitor);
        tokio::spawn(async move {
            let tick = (timeout / 2).max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => scanner.scan(),
                    _ = quiesce.changed() => return,
                }
            }
        });

        monitor
    }

    /// Arm idle enforcement for `addr`, both for wrappers created from now
    /// on and for existing ones.
    pub fn set_idle_checks(&self, addr: &str) {
        debug!(addr, "arming idle checks");
        self.state.lock().unwrap().armed.insert(addr.to_string());
    }

    /// Disarm `addr`; pending enforcement on its wrappers is cancelled.
    pub fn clear_idle_checks(&self, addr: &str) {
        debug!(addr, "clearing idle checks");
        self.state.lock().unwrap().armed.remove(addr);
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn scan(&self) {
        let now = self.now_ms();
        let timeout_ms = self.timeout.as_millis() as u64;
        let mut fired: Vec<FireCallback> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let State { armed, conns } = &mut *state;
            conns.retain(|addr, tracked| {
                tracked.retain(|weak| {
                    let Some(conn) = weak.upgrade() else {
                        return false;
                    };
                    if armed.contains(addr)
                        && now.saturating_sub(conn.last_active_ms.load(Ordering::Relaxed))
                            >= timeout_ms
                    {
                        if let Some(callback) = conn.on_fire.lock().unwrap().take() {
                            fired.push(callback);
                        }
                        return false;
                    }
                    true
                });
                !tracked.is_empty()
            });
        }
        for callback in fired {
            callback();
        }
    }

    /// Wrap `conn` so `on_fire` runs once after the configured period of
    /// inactivity. Returns `conn` untouched when `addr` is not currently
    /// armed.
    pub fn detect_idle(self: &Arc<Self>, conn: Conn, addr: &str, on_fire: FireCallback) -> Conn {
        let mut state = self.state.lock().unwrap();
        if !state.armed.contains(addr) {
            return conn;
        }
        let tracked = Arc::new(TrackedConn {
            last_active_ms: AtomicU64::new(self.now_ms()),
            on_fire: Mutex::new(Some(on_fire)),
        });
        state
            .conns
            .entry(addr.to_string())
            .or_default()
            .push(Arc::downgrade(&tracked));
        drop(state);

        Box::new(IdleDisconnectConn {
            inner: conn,
            tracked,
            monitor: Arc::clone(self),
        })
    }
}

/// Stream wrapper that stamps every observed byte.
struct IdleDisconnectConn {
    inner: Conn,
    tracked: Arc<TrackedConn>,
    monitor: Arc<IdleMonitor>,
}

impl IdleDisconnectConn {
    fn touch(&self) {
        self.tracked
            .last_active_ms
            .store(self.monitor.now_ms(), Ordering::Relaxed);
    }
}

impl AsyncRead for IdleDisconnectConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            if buf.filled().len() > before {
                this.touch();
            }
        }
        result
    }
}

impl AsyncWrite for IdleDisconnectConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            if *n > 0 {
                this.touch();
            }
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    fn fire_counter() -> (Arc<AtomicUsize>, FireCallback) {
        let counter = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&counter);
        (
            counter,
            Box::new(move || {
                clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    fn test_conn() -> (Conn, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        (Box::new(a), b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_when_armed_at_wrap_time() {
        let (_tx, quiesce) = watch::channel(false);
        let monitor = IdleMonitor::new(Duration::from_millis(100), quiesce);
        monitor.set_idle_checks("10.0.0.1:26257");

        let (conn, _peer) = test_conn();
        let (fired, callback) = fire_counter();
        let _wrapped = monitor.detect_idle(conn, "10.0.0.1:26257", callback);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // The callback is one-shot even if the scan keeps running.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_address_is_never_wrapped() {
        let (_tx, quiesce) = watch::channel(false);
        let monitor = IdleMonitor::new(Duration::from_millis(100), quiesce);

        let (conn, _peer) = test_conn();
        let (fired, callback) = fire_counter();
        let _conn = monitor.detect_idle(conn, "10.0.0.1:26257", callback);

        // Arming after the fact does not retroactively monitor it.
        monitor.set_idle_checks("10.0.0.1:26257");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarming_cancels_enforcement() {
        let (_tx, quiesce) = watch::channel(false);
        let monitor = IdleMonitor::new(Duration::from_millis(100), quiesce);
        monitor.set_idle_checks("10.0.0.1:26257");

        let (conn, _peer) = test_conn();
        let (fired, callback) = fire_counter();
        let _wrapped = monitor.detect_idle(conn, "10.0.0.1:26257", callback);

        monitor.clear_idle_checks("10.0.0.1:26257");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_resets_the_timer() {
        let (_tx, quiesce) = watch::channel(false);
        let monitor = IdleMonitor::new(Duration::from_millis(100), quiesce);
        monitor.set_idle_checks("10.0.0.1:26257");

        let (conn, _peer) = test_conn();
        let (fired, callback) = fire_counter();
        let mut wrapped = monitor.detect_idle(conn, "10.0.0.1:26257", callback);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            wrapped.write_all(b"x").await.unwrap();
        }
        // 300ms of wall time has passed, but never 100ms of silence.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
