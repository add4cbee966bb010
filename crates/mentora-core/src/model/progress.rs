use serde::{Deserialize, Serialize};

/// Read-only learner progress produced by the analytics collaborator.
///
/// Immutable for the lifetime of a request; nothing in this crate mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub missions_completed: u32,
    #[serde(default)]
    pub recipes_completed: u32,
    /// Average score across graded work, 0-100.
    #[serde(default)]
    pub average_score: f32,
    /// Consecutive active days.
    #[serde(default)]
    pub current_streak: u32,
    #[serde(default)]
    pub weak_areas: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub next_goals: Vec<String>,
    #[serde(default)]
    pub readiness_score: f32,
}

impl ProgressSnapshot {
    /// One-paragraph plain-text digest used when prompting the generator.
    pub fn digest(&self) -> String {
        let mut out = format!(
            "Missions completed: {}. Recipes completed: {}. Average score: {:.0}. \
             Current streak: {} days. Readiness: {:.0}.",
            self.missions_completed,
            self.recipes_completed,
            self.average_score,
            self.current_streak,
            self.readiness_score,
        );
        for (label, items) in [
            ("Strengths", &self.strengths),
            ("Weak areas", &self.weak_areas),
            ("Next goals", &self.next_goals),
        ] {
            if !items.is_empty() {
                out.push_str(&format!(" {label}: {}.", items.join(", ")));
            }
        }
        out
    }
}
