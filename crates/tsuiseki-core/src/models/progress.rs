use serde::{Deserialize, Serialize};

/// Aggregate watch progress for one show. Derived on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowProgress {
    pub show_id: u64,
    pub watched_count: u32,
    pub total_count: u32,
}

impl ShowProgress {
    pub fn is_complete(&self) -> bool {
        self.total_count > 0 && self.watched_count >= self.total_count
    }

    /// Fraction watched in `[0.0, 1.0]`; zero when the total is unknown.
    pub fn ratio(&self) -> f32 {
        if self.total_count == 0 {
            0.0
        } else {
            self.watched_count as f32 / self.total_count as f32
        }
    }
}
