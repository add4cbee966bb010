mod conversation;
mod progress;
mod quota;

pub use conversation::*;
pub use progress::*;
pub use quota::*;
