//! Rate governing logic and state management.

mod clock;
mod counter;
mod governor;
mod rules;

pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::{until_window_end, window_index, WindowedCounterStore};
pub use governor::{Governor, GovernorSettings, Verdict};
pub use rules::{PolicyDocument, Rule, RuleCatalog, RuleDocument};
