//! # Eddy KFC
//!
//! Group-addressed request/response messaging over the eddy engine.
//!
//! ## Features
//! - **Declarative Membership**: `<host> role=.. group=.. port=..` records with
//!   bracketed range expansion
//! - **Scheduling**: round robin, hashed and response-time weighted server choice,
//!   switchable per agent at runtime
//! - **Access Control**: per-group allow/deny patterns checked on every inbound
//!   connection and request
//! - **Timeout-bound Correlation**: every request carries a channel id; late
//!   responses are dropped
//!
//! ```no_run
//! # use std::time::Duration;
//! # use bytes::Bytes;
//! # use eddy_kfc::{Kfc, KfcPacket};
//! # async fn demo(kfc: Kfc) -> Result<(), eddy_kfc::KfcError> {
//! kfc.join_server("echo", |request: &KfcPacket| Some(request.payload.clone()))?;
//! kfc.allow_client("echo", "*", true)?;
//! kfc.start()?;
//!
//! let agent = kfc.join_client("echo")?;
//! let channel = agent.send(Bytes::from_static(b"ping"), Duration::from_millis(500))?;
//! let reply = agent.recv_channel(channel, Duration::from_millis(500)).await?;
//! assert_eq!(&reply[..], b"ping");
//! agent.leave().await;
//! # Ok(())
//! # }
//! ```

pub mod acl;
pub mod agent;
pub mod codec;
pub mod error;
pub mod group;
pub mod kfc;
pub mod membership;
pub mod scheduler;

pub use acl::{AccessList, Pattern};
pub use agent::{Agent, AgentState, KfcEngine};
pub use codec::{group_id, KfcCodec, KfcPacket, PacketKind};
pub use error::{KfcError, MembershipError};
pub use group::{GroupHandler, GroupTable, KfcServer};
pub use kfc::{slab_allocator, Kfc};
pub use membership::{expand_host, Member, Membership, Role};
pub use scheduler::{Scheduler, SchedulerKind};
