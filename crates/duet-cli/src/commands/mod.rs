pub mod common;
pub mod conflicts;
pub mod migrate;
pub mod purge;
pub mod queue;
pub mod run;
pub mod status;
pub mod sync;
