pub mod http_node;
pub mod node;
pub mod session;

pub use http_node::HttpSubstationNode;
pub use node::{LocalSubstation, SubstationNode};
pub use session::{
    ChargeSession, SessionBook, SessionEnd, SessionListing, SessionStatus, SessionTicket,
};
