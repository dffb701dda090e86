//! cohort-membership: gossip-based cluster membership.
//!
//! Nodes agree on who is in the cluster and in which lifecycle state each
//! member is, without a central coordinator. Every node holds a replica
//! of the membership snapshot ([`Gossip`]) versioned by a vector clock and
//! periodically exchanges it with a random peer. Replicas merge
//! deterministically, so once gossip stops changing every node holds the
//! same snapshot.
//!
//! # Architecture
//!
//! - **Snapshot and merge**: [`Gossip`], [`VectorClock`], [`Reachability`]
//! - **Lifecycle**: [`MemberStatus`] transitions and the leader's batch
//!   in [`state_machine`]
//! - **Daemon**: [`Cluster`] runs the protocol on one task and exposes a
//!   [`ClusterHandle`] plus a synchronous [`ReadView`]
//! - **Events**: [`ClusterEvent`]s published to [`Subscription`]s
//! - **Wire**: [`ClusterMessage`] codec over a [`Transport`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cohort_membership::{Cluster, MembershipConfig, UdpTransport};
//!
//! let (transport, inbound) = UdpTransport::bind("127.0.0.1:2552".parse()?).await?;
//! let cluster = Cluster::start(MembershipConfig::default(), Arc::new(transport), inbound)?;
//! let handle = cluster.handle();
//! handle.join(handle.self_address().address).await?;
//! ```

mod address;
mod cluster;
mod config;
mod error;
mod events;
mod failure;
mod gossip;
mod member;
mod message;
mod publisher;
mod reachability;
mod shutdown;
pub mod state_machine;
mod transport;
mod vclock;
mod view;

pub use address::UniqueAddress;
pub use cluster::{Cluster, ClusterBuilder, ClusterHandle};
pub use config::{format_duration, parse_duration, parse_optional_duration, MembershipConfig};
pub use error::{MembershipError, Result};
pub use events::{diff, ClusterEvent, CurrentClusterState, EventKind, GossipStats};
pub use failure::{AutoDown, DeadlineFailureDetector, FailureDetector};
pub use gossip::{Gossip, GossipOverview};
pub use member::{Member, MemberStatus, NOT_UP};
pub use message::ClusterMessage;
pub use publisher::{InitialStateMode, SubscriberId, Subscription};
pub use reachability::{ObserverRow, Reachability, ReachabilityPolicy, ReachabilityStatus};
pub use shutdown::{CoordinatedShutdown, LeaveCompletion, Phase, ShutdownReason};
pub use state_machine::{AlwaysReady, ExitGate};
pub use transport::{Inbound, LocalNetwork, LocalTransport, Transport, UdpTransport};
pub use vclock::{ClockOrdering, VectorClock};
pub use view::ReadView;
