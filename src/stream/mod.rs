//! Stream composition helpers shared by the server and client roles.

mod head;
mod merge;

pub use head::{Remainder, extract_head};
pub use merge::{MergeClosed, MergeController, MergeSink, MergedStream, merge_channel};
