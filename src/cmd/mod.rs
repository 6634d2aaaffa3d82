pub mod queue_cli;
pub mod server;
