//! Gateway: HTTP front for the WhatsApp webhook.
//!
//! A single port serves the webhook verification handshake, inbound message POSTs and a
//! health probe. The same process runs the queue workers and the idle reaper.

mod ingress;
mod server;

pub use ingress::{Ingress, IngressOutcome, RejectReason};
pub use server::{router, run_gateway, GatewayState};
