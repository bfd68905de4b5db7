mod time_amount;
pub use time_amount::TimeAmount;

mod deadline;
pub use deadline::Deadline;

mod timer_id;
pub use timer_id::TimerId;

/// Raw nanosecond count used by the serialized forms of the time types.
pub type Nanos = i64;
