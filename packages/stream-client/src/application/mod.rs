//! Application Layer - Port definitions.
//!
//! This layer defines the seams between the stream engine and the outside
//! world: the frame transport it dials and the frames that cross it.

/// Port interfaces for the frame transport.
pub mod ports;
