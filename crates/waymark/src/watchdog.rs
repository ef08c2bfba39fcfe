use crate::events::{EngineEvent, EventKind, EventSink};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct ActiveNode {
    started_at: Instant,
    warned: bool,
}

/// Periodically checks how long active nodes have been running and emits a
/// single `stage.stalled` event per node once it exceeds the stall timeout.
/// A zero stall timeout disables the watchdog entirely.
#[derive(Clone)]
pub struct Watchdog {
    active: Arc<Mutex<BTreeMap<String, ActiveNode>>>,
    enabled: bool,
}

impl Watchdog {
    pub fn start(config: WatchdogConfig, sink: EventSink, cancel: CancellationToken) -> Self {
        let watchdog = Self {
            active: Arc::new(Mutex::new(BTreeMap::new())),
            enabled: !config.stall_timeout.is_zero(),
        };
        if !watchdog.enabled {
            return watchdog;
        }

        let active = Arc::clone(&watchdog.active);
        let interval = config.check_interval.max(Duration::from_millis(10));
        let stall_timeout = config.stall_timeout;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        scan(&active, stall_timeout, &sink);
                    }
                }
            }
        });

        watchdog
    }

    pub fn node_started(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                node_id.to_string(),
                ActiveNode {
                    started_at: Instant::now(),
                    warned: false,
                },
            );
        }
    }

    pub fn node_finished(&self, node_id: &str) {
        if !self.enabled {
            return;
        }
        if let Ok(mut active) = self.active.lock() {
            active.remove(node_id);
        }
    }
}

fn scan(active: &Mutex<BTreeMap<String, ActiveNode>>, stall_timeout: Duration, sink: &EventSink) {
    let mut stalled = Vec::new();
    {
        let Ok(mut active) = active.lock() else {
            return;
        };
        for (node_id, entry) in active.iter_mut() {
            if entry.warned {
                continue;
            }
            let elapsed = entry.started_at.elapsed();
            if elapsed >= stall_timeout {
                entry.warned = true;
                stalled.push((node_id.clone(), elapsed));
            }
        }
    }
    for (node_id, elapsed) in stalled {
        sink.emit(
            EngineEvent::for_node(EventKind::StageStalled, node_id)
                .with("elapsed_ms", json!(elapsed.as_millis() as u64)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRecorder;

    #[tokio::test(flavor = "current_thread")]
    async fn stalled_node_warned_exactly_once() {
        let recorder = EventRecorder::new();
        let sink = EventSink::with_observer(Arc::new(recorder.clone()));
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(
            WatchdogConfig {
                check_interval: Duration::from_millis(20),
                stall_timeout: Duration::from_millis(50),
            },
            sink,
            cancel.clone(),
        );

        watchdog.node_started("slow");
        tokio::time::sleep(Duration::from_millis(200)).await;
        watchdog.node_finished("slow");
        cancel.cancel();

        let stalled: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|event| event.kind == EventKind::StageStalled)
            .collect();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].node_id.as_deref(), Some("slow"));
        assert!(stalled[0].data.contains_key("elapsed_ms"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_stall_timeout_disables_watchdog() {
        let recorder = EventRecorder::new();
        let sink = EventSink::with_observer(Arc::new(recorder.clone()));
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(
            WatchdogConfig {
                check_interval: Duration::from_millis(10),
                stall_timeout: Duration::ZERO,
            },
            sink,
            cancel.clone(),
        );

        watchdog.node_started("node");
        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();

        assert!(recorder.events().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn finished_node_is_not_warned() {
        let recorder = EventRecorder::new();
        let sink = EventSink::with_observer(Arc::new(recorder.clone()));
        let cancel = CancellationToken::new();
        let watchdog = Watchdog::start(
            WatchdogConfig {
                check_interval: Duration::from_millis(20),
                stall_timeout: Duration::from_millis(80),
            },
            sink,
            cancel.clone(),
        );

        watchdog.node_started("quick");
        tokio::time::sleep(Duration::from_millis(30)).await;
        watchdog.node_finished("quick");
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();

        assert!(recorder.events().is_empty());
    }
}
