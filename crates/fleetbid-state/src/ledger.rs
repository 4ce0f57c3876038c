//! Scoring Ledger: rolling (task, device, utilization, confidence) history.
//!
//! The history is one ring shared by every (task, device) pair, holding the
//! most recent `capacity` observations overall. Averages for a pair are
//! taken over whatever of that ring belongs to the pair, so a busy pair can
//! push a quiet one's observations out entirely. A pair's last score is
//! forgotten along with its last observation, so the score table never
//! outgrows the ring.
//!
//! Scores are advisory: winner selection does not consult them yet.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use fleetbid_protocol::{DeviceId, SCORE_HISTORY_LEN};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub task_type: String,
    pub device_id: DeviceId,
    pub utilization: f64,
    pub confidence: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Latest derived score for one (task type, device) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreEntry {
    pub task_type: String,
    pub device_id: DeviceId,
    pub score: f64,
    pub avg_utilization: f64,
    pub avg_confidence: f64,
    /// History samples the averages were taken over.
    pub samples: usize,
    pub updated_at: DateTime<Utc>,
}

/// `min(U, U_avg) * (1 - C_avg / C)` for positive `C`, else `min(U, U_avg)`.
pub fn fitness_score(utilization: f64, confidence: f64, avg_utilization: f64, avg_confidence: f64) -> f64 {
    let base = utilization.min(avg_utilization);
    if confidence > 0.0 {
        base * (1.0 - avg_confidence / confidence)
    } else {
        base
    }
}

#[derive(Debug)]
pub struct ScoringLedger {
    history: VecDeque<Observation>,
    capacity: usize,
    scores: HashMap<(String, DeviceId), ScoreEntry>,
}

impl Default for ScoringLedger {
    fn default() -> Self {
        Self::new(SCORE_HISTORY_LEN)
    }
}

impl ScoringLedger {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            scores: HashMap::new(),
        }
    }

    /// Score a fresh observation against the existing history, remember the
    /// score, then append the observation.
    pub fn record(&mut self, task_type: &str, device_id: &DeviceId, utilization: f64, confidence: f64) -> ScoreEntry {
        let (avg_utilization, avg_confidence, samples) = self.averages(task_type, device_id, utilization, confidence);
        let now = Utc::now();
        let entry = ScoreEntry {
            task_type: task_type.to_string(),
            device_id: device_id.clone(),
            score: fitness_score(utilization, confidence, avg_utilization, avg_confidence),
            avg_utilization,
            avg_confidence,
            samples,
            updated_at: now,
        };
        self.scores
            .insert((task_type.to_string(), device_id.clone()), entry.clone());

        let evicted = if self.history.len() == self.capacity {
            self.history.pop_front()
        } else {
            None
        };
        self.history.push_back(Observation {
            task_type: task_type.to_string(),
            device_id: device_id.clone(),
            utilization,
            confidence,
            recorded_at: now,
        });
        if let Some(old) = evicted {
            self.forget_if_unobserved(&old.task_type, &old.device_id);
        }

        tracing::debug!(
            task_type,
            device_id = %device_id,
            score = entry.score,
            samples,
            "score updated"
        );
        entry
    }

    /// Score the given current readings against history without recording.
    pub fn score(&self, task_type: &str, device_id: &DeviceId, utilization: f64, confidence: f64) -> f64 {
        let (avg_utilization, avg_confidence, _) = self.averages(task_type, device_id, utilization, confidence);
        fitness_score(utilization, confidence, avg_utilization, avg_confidence)
    }

    /// Last score recorded for a pair.
    pub fn latest(&self, task_type: &str, device_id: &DeviceId) -> Option<&ScoreEntry> {
        self.scores.get(&(task_type.to_string(), device_id.clone()))
    }

    /// All recorded scores ordered by task type then device.
    pub fn scores(&self) -> Vec<ScoreEntry> {
        let mut entries: Vec<ScoreEntry> = self.scores.values().cloned().collect();
        entries.sort_by(|a, b| (&a.task_type, &a.device_id).cmp(&(&b.task_type, &b.device_id)));
        entries
    }

    pub fn history(&self) -> impl Iterator<Item = &Observation> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    fn forget_if_unobserved(&mut self, task_type: &str, device_id: &DeviceId) {
        let observed = self
            .history
            .iter()
            .any(|o| o.task_type == task_type && &o.device_id == device_id);
        if !observed {
            self.scores.remove(&(task_type.to_string(), device_id.clone()));
            tracing::debug!(task_type, device_id = %device_id, "score dropped with its last observation");
        }
    }

    /// Means over the pair's share of history; the current readings stand
    /// in when the pair has none.
    fn averages(&self, task_type: &str, device_id: &DeviceId, utilization: f64, confidence: f64) -> (f64, f64, usize) {
        let (mut sum_u, mut sum_c, mut n) = (0.0, 0.0, 0usize);
        for obs in self
            .history
            .iter()
            .filter(|o| o.task_type == task_type && &o.device_id == device_id)
        {
            sum_u += obs.utilization;
            sum_c += obs.confidence;
            n += 1;
        }
        if n == 0 {
            (utilization, confidence, 0)
        } else {
            (sum_u / n as f64, sum_c / n as f64, n)
        }
    }
}
