use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use hive_core::AgentType;
use uuid::Uuid;

/// Sliding-window request counter per (instance, agent).
#[derive(Debug)]
pub struct UsageLimiter {
    window: Duration,
    hits: Mutex<HashMap<(Uuid, AgentType), VecDeque<Instant>>>,
}

impl UsageLimiter {
    pub fn per_minute() -> Self {
        Self::with_window(Duration::from_secs(60))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Admit `n` requests if the window has room for all of them. `max == 0`
    /// means unlimited.
    pub fn allow(&self, instance_id: Uuid, agent: AgentType, max: u32, n: u32) -> bool {
        if max == 0 {
            return true;
        }
        let now = Instant::now();
        let mut map = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let q = map.entry((instance_id, agent)).or_default();
        while q
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            q.pop_front();
        }
        if q.len().saturating_add(n as usize) > max as usize {
            return false;
        }
        q.extend(std::iter::repeat_n(now, n as usize));
        true
    }

    /// Drop history for an instance (after delete).
    pub fn forget(&self, instance_id: Uuid) {
        let mut map = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|(id, _), _| *id != instance_id);
    }
}
