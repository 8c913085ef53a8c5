pub mod ca_client;
pub mod commands;
