//! Progress delivery to observers.
//!
//! Both modes read from the session's replay log (`total_progress`), never
//! from the runtime queues, so any number of observers can follow one
//! session and a late observer still sees the full output.
//!
//! - [`observer`]: pull cursor over the replay log
//! - [`push`]: event stream built on top of an observer

pub mod observer;
pub mod push;
