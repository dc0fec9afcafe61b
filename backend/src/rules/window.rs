//! Bounded in-memory ring of recent events backing `rate()` and
//! `distinct_over()` when no external metrics provider is configured.

use chrono::{DateTime, Duration, Utc};
use gatekeeper_shared::Event;
use std::collections::HashSet;
use std::sync::RwLock;

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
struct TimedEvent {
    ts: DateTime<Utc>,
    fields: Event,
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<TimedEvent>>,
    head: usize,
    size: usize,
}

/// Sliding window of events. Safe for concurrent use; snapshots observe a
/// prefix of appends but are not point-in-time atomic with concurrent writers.
#[derive(Debug)]
pub struct WindowStore {
    inner: RwLock<Ring>,
    capacity: usize,
}

impl WindowStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: RwLock::new(Ring {
                slots: vec![None; capacity],
                head: 0,
                size: 0,
            }),
            capacity,
        }
    }

    /// Record an event at the provided timestamp. The field map is cloned so
    /// callers cannot mutate stored events; the oldest slot is overwritten
    /// when the ring is full.
    pub fn append(&self, ts: DateTime<Utc>, fields: &Event) {
        let mut ring = self.inner.write().expect("window store lock poisoned");
        let head = ring.head;
        ring.slots[head] = Some(TimedEvent {
            ts,
            fields: fields.clone(),
        });
        ring.head = (head + 1) % self.capacity;
        if ring.size < self.capacity {
            ring.size += 1;
        }
    }

    /// Events with `ts > now - window`, in chronological order, cloned.
    pub fn snapshot(&self, window: Duration, now: DateTime<Utc>) -> Vec<Event> {
        let cutoff = now - window.max(Duration::zero());

        let ring = self.inner.read().expect("window store lock poisoned");
        if ring.size == 0 {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(ring.size);
        for i in 0..ring.size {
            let idx = (ring.head + self.capacity - 1 - i) % self.capacity;
            match &ring.slots[idx] {
                Some(event) if event.ts > cutoff => out.push(event.fields.clone()),
                _ => break,
            }
        }
        out.reverse();
        out
    }

    /// Fraction of events in the window matching the predicate, 0 when the
    /// window is empty. Always within [0, 1].
    pub fn rate<F>(&self, window: Duration, now: DateTime<Utc>, pred: F) -> f64
    where
        F: Fn(&Event) -> bool,
    {
        let events = self.snapshot(window, now);
        if events.is_empty() {
            return 0.0;
        }
        let matches = events.iter().filter(|ev| pred(ev)).count();
        matches as f64 / events.len() as f64
    }

    /// Cardinality of distinct values of `field` within the window.
    pub fn distinct(&self, field: &str, window: Duration, now: DateTime<Utc>) -> usize {
        let events = self.snapshot(window, now);
        let mut seen = HashSet::with_capacity(events.len());
        for event in &events {
            if let Some(value) = event.get(field) {
                seen.insert(value.to_string());
            }
        }
        seen.len()
    }
}

impl Default for WindowStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(pairs: &[(&str, serde_json::Value)]) -> Event {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn snapshot_is_chronological_and_strict() {
        let store = WindowStore::new(8);
        let now = Utc::now();
        store.append(now - Duration::minutes(10), &event(&[("n", json!(1))]));
        store.append(now - Duration::minutes(5), &event(&[("n", json!(2))]));
        store.append(now - Duration::minutes(1), &event(&[("n", json!(3))]));

        let snap = store.snapshot(Duration::minutes(5), now);
        // Cut-off is strictly greater-than: the event exactly at now-5m drops out.
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0]["n"], json!(3));

        let snap = store.snapshot(Duration::minutes(30), now);
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0]["n"], json!(1));
        assert_eq!(snap[2]["n"], json!(3));
    }

    #[test]
    fn ring_overwrites_oldest_when_full() {
        let store = WindowStore::new(2);
        let now = Utc::now();
        for n in 1..=3 {
            store.append(now - Duration::seconds(10 - n), &event(&[("n", json!(n))]));
        }
        let snap = store.snapshot(Duration::minutes(1), now);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0]["n"], json!(2));
        assert_eq!(snap[1]["n"], json!(3));
    }

    #[test]
    fn rate_is_matches_over_total() {
        let store = WindowStore::new(16);
        let now = Utc::now();
        for i in 0..10 {
            let reason = if i < 2 { "consent_required" } else { "quota" };
            store.append(
                now - Duration::seconds(60 - i),
                &event(&[("deny_reason", json!(reason))]),
            );
        }
        let rate = store.rate(Duration::minutes(15), now, |ev| {
            ev.get("deny_reason").and_then(|v| v.as_str()) == Some("consent_required")
        });
        assert!((rate - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn rate_on_empty_window_is_zero() {
        let store = WindowStore::new(4);
        assert_eq!(store.rate(Duration::minutes(5), Utc::now(), |_| true), 0.0);
    }

    #[test]
    fn distinct_counts_unique_values() {
        let store = WindowStore::new(16);
        let now = Utc::now();
        for org in ["acme", "acme", "globex", "initech"] {
            store.append(now - Duration::seconds(30), &event(&[("org", json!(org))]));
        }
        assert_eq!(store.distinct("org", Duration::minutes(5), now), 3);
        assert_eq!(store.distinct("missing", Duration::minutes(5), now), 0);
    }

    #[test]
    fn appended_fields_are_cloned() {
        let store = WindowStore::new(4);
        let now = Utc::now();
        let mut ev = event(&[("k", json!("v1"))]);
        store.append(now, &ev);
        ev.insert("k".into(), json!("v2"));
        let snap = store.snapshot(Duration::minutes(1), now);
        assert_eq!(snap[0]["k"], json!("v1"));
    }
}
