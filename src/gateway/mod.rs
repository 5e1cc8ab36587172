pub mod server;

pub use server::{AssignRequest, AssignResponse, BalancerRouter, BalancerServer, ServerState};
