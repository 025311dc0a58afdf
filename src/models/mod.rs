pub mod listing;
pub mod rule;
pub mod run;
pub mod snapshot;
