mod clock;
mod machine;
mod phase;

pub use clock::{Clock, ClockTick, ManualClock, SessionClock, SystemClock};
pub use machine::{SessionDefaults, SessionMachine};
pub use phase::{CompletionGuard, Phase, PhaseKind, SessionMeta, Transition};
