use core::fmt;

use serde::{Deserialize, Serialize};

use crate::user_ns::UidShift;

/// Messages exchanged between the parent and the outer child.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Message {
    /// The shift the outer child determined. `None` without a user namespace.
    UidShift(Option<UidShift>),
    /// The range the parent picked and now holds the lock for.
    UidShiftPicked(UidShift),
    /// Host pid of the inner child.
    InnerReady(i32),
    OuterFailed(String),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::UidShift(shift) => write!(f, "UidShift({:?})", shift),
            Message::UidShiftPicked(shift) => write!(f, "UidShiftPicked({:#x})", shift.shift),
            Message::InnerReady(pid) => write!(f, "InnerReady({})", pid),
            Message::OuterFailed(s) => write!(f, "OuterFailed({})", s),
        }
    }
}
