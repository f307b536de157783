//! Cross-instance integration flows.

mod broker_flows;
mod config_flow;
mod host_flow;
mod lifecycle;
mod store_flow;
