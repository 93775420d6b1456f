//! Background work: the deadline scanner and the resume queue.

mod deadline;
mod resume;

pub use deadline::DeadlineScanner;
#[cfg(test)]
pub use resume::MockResumeQueue;
pub use resume::{resume_channel, ChannelQueue, ResumeJob, ResumeQueue, ResumeTask, ResumeWorker};
