pub mod airplay;
pub mod socket;

pub use airplay::{AirplayTransport, SendError, TransportEvent};
pub use socket::BindError;
