//! Side-channel round-trip probing
//!
//! Every probe carries its send time (session clock, milliseconds) as its
//! id. The far side echoes the id back in a pong; the difference to the
//! receive time is the round trip. Probes not answered within the timeout
//! are counted as lost.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Probe id: send time on the session clock, in milliseconds
pub type ProbeId = u64;

/// Messages on the probe channel
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeMessage {
    Ping { id: f64 },
    Pong { id: f64 },
}

impl ProbeMessage {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The echo for a ping; pongs need no answer
    pub fn respond(&self) -> Option<ProbeMessage> {
        match *self {
            ProbeMessage::Ping { id } => Some(ProbeMessage::Pong { id }),
            ProbeMessage::Pong { .. } => None,
        }
    }
}

/// Millisecond clock starting at session creation
#[derive(Clone, Copy, Debug)]
pub struct SessionClock {
    origin: Instant,
}

impl SessionClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Instant at which the clock reads `ms`
    pub fn instant_at(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms)
    }
}

/// Outstanding-probe bookkeeping for one session
#[derive(Debug)]
pub struct Prober {
    /// Probe id to loss deadline
    outstanding: BTreeMap<ProbeId, u64>,
    timeout_ms: u64,
    last_id: Option<ProbeId>,
    replied: u64,
    lost: u64,
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        Self {
            outstanding: BTreeMap::new(),
            timeout_ms: timeout.as_millis() as u64,
            last_id: None,
            replied: 0,
            lost: 0,
        }
    }

    /// Register a new probe sent at `now_ms`. Ids are strictly increasing
    /// even if the clock has not advanced.
    pub fn next_probe(&mut self, now_ms: u64) -> ProbeMessage {
        let id = match self.last_id {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last_id = Some(id);
        self.outstanding.insert(id, id + self.timeout_ms);
        ProbeMessage::Ping { id: id as f64 }
    }

    /// Match a pong. Returns the round trip in milliseconds, or `None` for
    /// ids that are unknown, already answered or already expired.
    pub fn on_pong(&mut self, id: f64, now_ms: u64) -> Option<f64> {
        if !id.is_finite() || id < 0.0 || id.fract() != 0.0 {
            return None;
        }
        let id = id as ProbeId;

        self.outstanding.remove(&id)?;
        self.replied += 1;
        Some(now_ms.saturating_sub(id) as f64)
    }

    /// Drop every probe whose deadline has passed, returning how many
    pub fn expire(&mut self, now_ms: u64) -> usize {
        let before = self.outstanding.len();
        self.outstanding.retain(|_, deadline| *deadline > now_ms);
        let expired = before - self.outstanding.len();
        self.lost += expired as u64;
        expired
    }

    /// Earliest loss deadline among outstanding probes
    pub fn next_deadline(&self) -> Option<u64> {
        self.outstanding.values().min().copied()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    pub fn replied(&self) -> u64 {
        self.replied
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Forget all outstanding probes and counters
    pub fn reset(&mut self) {
        self.outstanding.clear();
        self.last_id = None;
        self.replied = 0;
        self.lost = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober() -> Prober {
        Prober::new(Duration::from_millis(1000))
    }

    #[test]
    fn test_probe_wire_format() {
        let ping = ProbeMessage::from_json(r#"{"type":"ping","id":1699999999123}"#).unwrap();
        assert_eq!(ping, ProbeMessage::Ping { id: 1699999999123.0 });

        let pong = ping.respond().unwrap();
        let json = pong.to_json().unwrap();
        assert!(json.contains(r#""type":"pong""#));
        assert_eq!(ProbeMessage::from_json(&json).unwrap(), ProbeMessage::Pong { id: 1699999999123.0 });
        assert!(pong.respond().is_none());
    }

    #[test]
    fn test_fractional_ids_echo_unchanged() {
        let ping = ProbeMessage::from_json(r#"{"type":"ping","id":1234.5678}"#).unwrap();
        assert_eq!(ping.respond(), Some(ProbeMessage::Pong { id: 1234.5678 }));
    }

    #[test]
    fn test_pong_yields_rtt() {
        let mut prober = prober();
        let ProbeMessage::Ping { id } = prober.next_probe(500) else {
            panic!("expected a ping");
        };

        assert_eq!(prober.outstanding(), 1);
        assert_eq!(prober.on_pong(id, 542), Some(42.0));
        assert_eq!(prober.outstanding(), 0);
        assert_eq!(prober.replied(), 1);

        // A duplicate pong is ignored
        assert_eq!(prober.on_pong(id, 600), None);
        assert_eq!(prober.replied(), 1);
    }

    #[test]
    fn test_unanswered_probe_is_lost() {
        let mut prober = prober();
        let ProbeMessage::Ping { id } = prober.next_probe(0) else {
            panic!("expected a ping");
        };
        assert_eq!(prober.next_deadline(), Some(1000));

        assert_eq!(prober.expire(999), 0);
        assert_eq!(prober.expire(1000), 1);
        assert_eq!(prober.outstanding(), 0);
        assert_eq!(prober.lost(), 1);

        // A late pong produces no sample
        assert_eq!(prober.on_pong(id, 1200), None);
    }

    #[test]
    fn test_ids_strictly_increase() {
        let mut prober = prober();
        let ids: Vec<f64> = (0..3)
            .map(|_| match prober.next_probe(100) {
                ProbeMessage::Ping { id } => id,
                ProbeMessage::Pong { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec![100.0, 101.0, 102.0]);
        assert_eq!(prober.outstanding(), 3);
    }

    #[test]
    fn test_unknown_ids_ignored() {
        let mut prober = prober();
        prober.next_probe(10);
        assert_eq!(prober.on_pong(11.0, 20), None);
        assert_eq!(prober.on_pong(10.5, 20), None);
        assert_eq!(prober.on_pong(f64::NAN, 20), None);
        assert_eq!(prober.outstanding(), 1);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut prober = prober();
        prober.next_probe(0);
        prober.next_probe(500);
        prober.expire(1200);
        prober.reset();

        assert_eq!(prober.outstanding(), 0);
        assert_eq!(prober.lost(), 0);
        assert_eq!(prober.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_clock() {
        let clock = SessionClock::start();
        tokio::time::advance(Duration::from_millis(750)).await;
        assert_eq!(clock.now_ms(), 750);
        assert_eq!(clock.instant_at(750), Instant::now());
    }
}
