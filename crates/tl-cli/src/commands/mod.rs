//! CLI subcommand implementations.

pub mod live;
pub mod messages;
pub mod sessions;
pub mod status;
pub mod sync;
pub mod watch;
