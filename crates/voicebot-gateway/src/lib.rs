//! voicebot-gateway: HTTP front door for the voicebot
//!
//! Serves `POST /chat` and `GET /health` (also under `/api`), maps dispatch
//! failures to status codes, and hosts the static browser client.

pub mod protocol;
pub mod server;
pub mod webchat;

pub use server::GatewayServer;
