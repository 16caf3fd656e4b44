//! # liftnet
//!
//! `liftnet` coordinates a small fixed group of elevator cars, one node per
//! car, into a single dispatch system. Nodes detect each other through
//! heartbeats, replicate a mergeable world view of all hall calls and car
//! states, elect one primary that runs the external assignment optimizer,
//! and fail over without losing or duplicating a passenger's call.
#![recursion_limit = "512"]

pub mod assign;
pub mod config;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod io;
pub mod node;
pub mod peer;
pub mod requests;
pub mod role;
pub mod rpc;
pub mod store;
pub mod time;
pub mod world_view;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::node::{start, Io, NodeHandle};
pub use crate::peer::{PeerId, Rank};
pub use crate::role::Role;
pub use crate::store::WorldViewStore;
pub use crate::world_view::{HallButton, HallRequestStatus, WorldView};
