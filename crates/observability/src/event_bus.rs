//! 统一事件总线
//!
//! 汇总三个引擎的事件：按类型计数、保留最近事件、向外部订阅者广播。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use orchestrator_domain::{EngineEvent, EventKind};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::metrics_collector::MetricsCollector;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct EventStats {
    pub total: u64,
    pub by_kind: HashMap<String, u64>,
    pub history_len: usize,
}

struct BusState {
    counts: HashMap<EventKind, u64>,
    total: u64,
    history: VecDeque<EngineEvent>,
}

#[derive(Clone)]
pub struct EventBus {
    state: Arc<Mutex<BusState>>,
    history_size: usize,
    sender: broadcast::Sender<EngineEvent>,
    metrics: Arc<MetricsCollector>,
}

impl EventBus {
    pub fn new(history_size: usize, metrics: Arc<MetricsCollector>) -> Self {
        let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(BusState {
                counts: HashMap::new(),
                total: 0,
                history: VecDeque::with_capacity(history_size.min(1024)),
            })),
            history_size,
            sender,
            metrics,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn publish(&self, event: &EngineEvent) {
        {
            let mut state = self.lock();
            *state.counts.entry(event.kind).or_insert(0) += 1;
            state.total += 1;
            if self.history_size > 0 {
                if state.history.len() >= self.history_size {
                    state.history.pop_front();
                }
                state.history.push_back(event.clone());
            }
        }

        self.metrics.record_event(event.kind.as_str());

        // 没有订阅者时发送失败是正常情况
        if self.sender.send(event.clone()).is_err() {
            trace!(event = event.kind.as_str(), "没有事件订阅者");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.lock().counts.get(&kind).copied().unwrap_or(0)
    }

    /// 最近的事件，按发生顺序排列，最多 `limit` 条
    pub fn recent(&self, limit: usize) -> Vec<EngineEvent> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> EventStats {
        let state = self.lock();
        EventStats {
            total: state.total,
            by_kind: state
                .counts
                .iter()
                .map(|(kind, count)| (kind.as_str().to_string(), *count))
                .collect(),
            history_len: state.history.len(),
        }
    }
}
