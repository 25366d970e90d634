//! The peripheral node-health watchdog (spec §5; `select_linear.c:215`
//! `xcpu_agent`, `:262` `_init_status_pthread`, `:282` `_fini_status_pthread`).
//!
//! Explicitly outside the core's invariants: this thread only stats a
//! filesystem path per node on an interval and asks a collaborator to
//! drain a node it thinks is unhealthy. It never touches `CRState`
//! directly — any action it takes goes through the same public
//! `SelectCore` entry points a normal caller would use.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long shutdown waits for the watchdog thread to notice the stop
/// signal and exit before giving up on it (`_fini_status_pthread`'s
/// 4-second poll in the original).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(4);

/// Something that can be told "this node looks unhealthy, drain it" —
/// the collaborator `select_linear.c` calls into from `xcpu_agent`.
pub trait NodeDrainRequester: Send + Sync {
    fn request_drain(&self, node_index: usize, reason: &str);
}

/// A per-node health artifact path the watchdog stats on each poll.
#[derive(Clone, Debug)]
pub struct NodeHealthPath {
    pub node_index: usize,
    pub path: PathBuf,
}

/// A detached health-polling thread plus the handle needed to stop it.
pub struct Watchdog {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Spawns the watchdog thread: every `interval`, stats each
    /// `NodeHealthPath`; a path that fails to stat (missing, permission
    /// denied — any `Err`) is reported via `requester.request_drain`.
    pub fn spawn(
        paths: Vec<NodeHealthPath>,
        interval: Duration,
        requester: impl NodeDrainRequester + 'static,
    ) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = std::thread::spawn(move || loop {
            select! {
                recv(stop_rx) -> _ => return,
                recv(ticker) -> _ => {
                    for p in &paths {
                        if std::fs::metadata(&p.path).is_err() {
                            requester.request_drain(p.node_index, "health artifact unreadable");
                        }
                    }
                }
            }
        });

        Watchdog {
            stop: stop_tx,
            handle: Some(handle),
        }
    }

    /// Signals the watchdog to stop and waits up to [`SHUTDOWN_GRACE`]
    /// for it to exit. A thread that hasn't exited by then is abandoned
    /// (detached, matching the original's bounded-poll-then-move-on
    /// shutdown), since there is no portable `JoinHandle::join_timeout`.
    pub fn shutdown(mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let start = std::time::Instant::now();
            while !handle.is_finished() && start.elapsed() < SHUTDOWN_GRACE {
                std::thread::sleep(Duration::from_millis(50));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                log::warn!("watchdog did not exit within the shutdown grace period; abandoning it");
            }
        }
    }
}
