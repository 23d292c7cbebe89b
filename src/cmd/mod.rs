mod merge;
mod prefetch;
mod run;

pub use merge::cmd_merge;
pub use prefetch::cmd_prefetch;
pub use run::cmd_run;
