//! Link quality classification from recent playout outcomes

use std::collections::VecDeque;

use super::LinkQuality;

/// Playout outcomes considered for the loss rate
const LOSS_WINDOW: usize = 100;

/// Loss above this fraction is Poor
const POOR_LOSS: f64 = 0.20;

/// Loss above this fraction is at best Fair
const FAIR_LOSS: f64 = 0.03;

/// Jitter above this multiple of the threshold is Poor
const POOR_JITTER_FACTOR: f64 = 3.0;

/// Sliding record of whether recent chunks reached playout
#[derive(Debug, Clone)]
pub struct LossWindow {
    outcomes: VecDeque<bool>,
}

impl LossWindow {
    pub fn new() -> Self {
        Self {
            outcomes: VecDeque::with_capacity(LOSS_WINDOW),
        }
    }

    fn push(&mut self, lost: bool) {
        if self.outcomes.len() == LOSS_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(lost);
    }

    pub fn record_played(&mut self) {
        self.push(false);
    }

    pub fn record_lost(&mut self) {
        self.push(true);
    }

    /// Fraction of recent outcomes that were losses
    pub fn loss_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let lost = self.outcomes.iter().filter(|&&l| l).count();
        lost as f64 / self.outcomes.len() as f64
    }

    pub fn clear(&mut self) {
        self.outcomes.clear();
    }
}

impl Default for LossWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a link from its playout loss rate and jitter
pub fn classify(loss_rate: f64, jitter_ms: f64, jitter_threshold_ms: f64) -> LinkQuality {
    if loss_rate > POOR_LOSS || jitter_ms > jitter_threshold_ms * POOR_JITTER_FACTOR {
        LinkQuality::Poor
    } else if loss_rate > FAIR_LOSS || jitter_ms > jitter_threshold_ms {
        LinkQuality::Fair
    } else {
        LinkQuality::Good
    }
}
