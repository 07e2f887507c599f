//! Command Gateway for AeroTask vehicles
//!
//! This crate abstracts the flight-controller link. It provides:
//! - The discrete flight command set and payload actions
//! - The `FlightLink` transport trait with simulated and TCP implementations
//! - The `Gateway`, which adds acknowledgement timeouts, bounded retries and
//!   connection-state tracking on top of a link
//!
//! # Examples
//!
//! ```no_run
//! use aerotask_core::GatewayConfig;
//! use aerotask_gateway::Gateway;
//!
//! # async fn demo() -> aerotask_gateway::Result<()> {
//! let gateway = Gateway::connect("uav-1", "sim://uav-1?lat=45.0&lon=-122.0", GatewayConfig::default()).await?;
//! gateway.arm().await?;
//! gateway.takeoff(30.0).await?;
//! let state = gateway.query_state().await?;
//! println!("{} at {:.1}m", gateway.vehicle_id(), state.position.alt);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod command;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod link;
pub mod sim;
pub mod tcp;

pub use command::{Acknowledged, FlightCommand};
pub use connection::{ConnectionState, GatewayStats, GatewayStatsSnapshot};
pub use error::{GatewayError, LinkError, Result};
pub use gateway::Gateway;
pub use link::{open_link, ConnectionDescriptor, FlightLink};
pub use sim::{SimLink, SimSettings};
pub use tcp::{LinkOp, LinkRequest, LinkResponse, TcpLink};
