//! Peer connection wrapper

mod adapter;

pub use adapter::{PeerConnectionAdapter, PeerConnectionUpdate};
