use serde::{Deserialize, Serialize};

/// Accumulated feedback signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackCounts {
    /// Positive signals.
    pub likes: u64,
    /// Negative signals.
    pub dislikes: u64,
}

/// Evaluation of the dislike ratio against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRatio {
    /// Positive signals.
    pub likes: u64,
    /// Negative signals.
    pub dislikes: u64,
    /// `likes + dislikes`.
    pub total: u64,
    /// `dislikes / total`, 0 when there is no feedback.
    pub ratio: f64,
    /// Threshold the ratio was compared to.
    pub threshold: f64,
    /// True when `ratio > threshold`: retraining should be requested.
    pub decision: bool,
}

/// Decide whether negative feedback warrants retraining. Pure.
pub fn evaluate(counts: FeedbackCounts, threshold: f64) -> FeedbackRatio {
    let total = counts.likes.saturating_add(counts.dislikes);
    let ratio = if total == 0 { 0.0 } else { counts.dislikes as f64 / total as f64 };
    FeedbackRatio {
        likes: counts.likes,
        dislikes: counts.dislikes,
        total,
        ratio,
        threshold,
        decision: ratio > threshold,
    }
}

impl FeedbackRatio {
    /// Multi-line report for the notification sink.
    pub fn report(&self) -> String {
        let state = if self.decision { "retraining requested" } else { "within threshold" };
        format!(
            "[feedback] {state}\n- likes: {}\n- dislikes: {}\n- total: {}\n- dislike ratio: {:.1}% (threshold {:.0}%)",
            self.likes,
            self.dislikes,
            self.total,
            self.ratio * 100.0,
            self.threshold * 100.0
        )
    }
}
