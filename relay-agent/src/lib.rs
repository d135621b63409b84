//! Agent library: the HTTP executor, heartbeat/watchdog, reconnect state
//! machine, agent config, and transport dialing. Split out from the
//! binary so integration tests can drive these pieces directly.

pub mod executor;
pub mod heartbeat;
pub mod reconnect;
pub mod state;
pub mod transport;
