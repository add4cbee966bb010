//! Locally computed content for when the remote generator is unavailable.
//!
//! Everything here is pure: no I/O, no clock, no randomness.

use crate::model::ProgressSnapshot;

pub const FIRST_TIME_WELCOME: &str = "Welcome aboard! I'm your learning coach. \
Pick your first mission and I'll be here to help whenever you get stuck.";

pub const HIGH_PERFORMANCE_WELCOME: &str = "Outstanding work! Your average score is \
in the top range. Let's keep that momentum and take on a harder challenge today.";

pub const HANDS_ON_WELCOME: &str = "You've been busy building! All those completed \
recipes are real hands-on experience. Ready for the next one?";

pub const GENERIC_ENCOURAGEMENT: &str = "Good to see you again! Every session \
moves you forward. What would you like to work on today?";

/// Last tier of the welcome chain, used when even the progress snapshot is
/// unavailable.
pub const GENERIC_WELCOME: &str = "Welcome back! Ask me anything about your learning path.";

/// Assistant turn written when a chat reply could not be generated.
pub const CHAT_APOLOGY: &str = "Sorry, I couldn't come up with a reply just now. \
Your message is saved; please try again in a moment. This one didn't count against \
your daily allowance.";

pub const RECOMMENDATION_UNAVAILABLE: &str =
    "Recommendations are unavailable right now. Please try again later.";

/// Streak length at which the streak affirmation kicks in.
pub const STREAK_THRESHOLD: u32 = 7;
/// Average score at which the high-performance affirmation kicks in.
pub const HIGH_SCORE_THRESHOLD: f32 = 80.0;
/// Recipes completed beyond which the hands-on affirmation kicks in.
pub const HANDS_ON_THRESHOLD: u32 = 5;

/// Pick a welcome message from progress alone. First matching rule wins.
pub fn select_welcome(progress: &ProgressSnapshot) -> String {
    if progress.missions_completed == 0 {
        FIRST_TIME_WELCOME.to_string()
    } else if progress.average_score >= HIGH_SCORE_THRESHOLD {
        HIGH_PERFORMANCE_WELCOME.to_string()
    } else if progress.current_streak >= STREAK_THRESHOLD {
        streak_welcome(progress.current_streak)
    } else if progress.recipes_completed > HANDS_ON_THRESHOLD {
        HANDS_ON_WELCOME.to_string()
    } else {
        GENERIC_ENCOURAGEMENT.to_string()
    }
}

fn streak_welcome(days: u32) -> String {
    format!(
        "{days} days in a row! That streak is the habit that makes skills stick. \
         Let's make it {} today.",
        days + 1
    )
}
