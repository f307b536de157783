//! # Bus Test Suite
//!
//! Multi-instance flows that need more than one bus in a process.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs          # Bus members, payloads and flaky collaborators
//! └── integration/
//!     ├── store_flow.rs    # Poll transport over a shared store
//!     ├── host_flow.rs     # Host-local transport through one hub
//!     ├── lifecycle.rs     # State machine seen from outside
//!     ├── config_flow.rs   # TOML and env resolution end to end
//!     └── broker_flows.rs  # Redis, AMQP, NATS (ignored, need servers)
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests --features sqlite
//! cargo test -p bus-tests -- --ignored   # with brokers on localhost
//! ```

pub mod fixtures;
pub mod integration;
