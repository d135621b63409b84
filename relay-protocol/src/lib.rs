//! Wire types, framing, and TLS shared by the tunnel server and agent.

pub mod body;
pub mod clock;
pub mod error;
pub mod framing;
pub mod message;
pub mod tls;

pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use framing::MessageStream;
pub use message::{Message, RequestData, ResponseData};
