//! Generated protobuf bindings for the three wire dialects this daemon
//! speaks: tracker, peer, and local control. Each has its own message
//! roots (`ClientMessage`/`ServerMessage` in both the tracker and control
//! dialects, deliberately distinct types despite the shared names).

pub mod tracker {
    include!(concat!(env!("OUT_DIR"), "/warren.tracker.rs"));
}

pub mod peer {
    include!(concat!(env!("OUT_DIR"), "/warren.peer.rs"));
}

pub mod control {
    include!(concat!(env!("OUT_DIR"), "/warren.control.rs"));
}
