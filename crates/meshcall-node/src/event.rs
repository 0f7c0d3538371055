use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use meshcall_crypto::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Declined,
    Missed,
    Error,
}

/// One call attempt in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub direction: Direction,
    pub outcome: Outcome,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub public_key: PublicKey,
    #[serde(default)]
    pub address: Option<String>,
}

impl Event {
    pub fn now(
        direction: Direction,
        outcome: Outcome,
        public_key: PublicKey,
        address: Option<String>,
    ) -> Self {
        Self {
            direction,
            outcome,
            timestamp: now_millis(),
            public_key,
            address,
        }
    }

    pub fn is_missed(&self) -> bool {
        self.direction == Direction::Incoming && self.outcome == Outcome::Missed
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Append-only call history plus the count of calls missed since last seen.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Events {
    events: Vec<Event>,
    #[serde(skip)]
    missed: u32,
}

impl Events {
    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn note_missed(&mut self) {
        self.missed = self.missed.saturating_add(1);
    }

    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// The user has looked at the history.
    pub fn clear_missed(&mut self) {
        self.missed = 0;
    }

    /// Remove every event strictly older than `timestamp`; returns how many went.
    pub fn delete_before(&mut self, timestamp: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.timestamp >= timestamp);
        before - self.events.len()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.missed = 0;
    }

    pub fn last(&self) -> Option<&Event> {
        self.events.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshcall_crypto::IdentityKeyPair;

    fn event(ts: u64, outcome: Outcome) -> Event {
        Event {
            direction: Direction::Incoming,
            outcome,
            timestamp: ts,
            public_key: IdentityKeyPair::generate().public_key(),
            address: Some("10.0.0.9".into()),
        }
    }

    #[test]
    fn delete_before_timestamp() {
        let mut events = Events::default();
        events.push(event(100, Outcome::Accepted));
        events.push(event(200, Outcome::Missed));
        events.push(event(300, Outcome::Declined));

        assert_eq!(events.delete_before(200), 1);
        assert_eq!(events.len(), 2);
        assert_eq!(events.iter().next().unwrap().timestamp, 200);
        assert_eq!(events.delete_before(0), 0);
    }

    #[test]
    fn missed_counter() {
        let mut events = Events::default();
        assert!(event(1, Outcome::Missed).is_missed());
        assert!(!event(1, Outcome::Accepted).is_missed());
        events.note_missed();
        events.note_missed();
        assert_eq!(events.missed(), 2);
        events.clear_missed();
        assert_eq!(events.missed(), 0);
    }

    #[test]
    fn json_shape() {
        let mut events = Events::default();
        events.push(event(42, Outcome::Error));
        events.note_missed();
        let json = serde_json::to_value(&events).unwrap();
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["direction"], "incoming");
        assert_eq!(arr[0]["outcome"], "error");
        assert_eq!(arr[0]["timestamp"], 42);

        let back: Events = serde_json::from_value(json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.missed(), 0);
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
