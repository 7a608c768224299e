pub mod network;
pub mod runner;
pub mod sim;

pub use runner::{HostOptions, HostRunner};

/// Internal engine events that bridge the accept loop and the host tick loop
pub(crate) enum EngineEvent {
    PeerJoined(network::PeerLink),
    PeerLeft(iroh::EndpointId),
}
