//! Parley core library: WhatsApp webhook ingress, dispatch queue, conversation worker
//! and idle conversation reaper, used by the CLI.

pub mod affinity;
pub mod assistant;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod gateway;
pub mod init;
pub mod mail;
pub mod queue;
pub mod reaper;
pub mod report;
pub mod services;
pub mod store;
pub mod tenants;
pub mod worker;
