//! The engine's own network: policy-driven HTTPS dialing backed by
//! persistent per-tactic statistics.

mod dialer;
mod network;
pub mod policy;
pub mod stats;
mod tactic;

pub use dialer::HttpsDialer;
pub use network::Network;
pub use policy::{
    HttpsDialerPolicy, NullPolicy, StaticPolicy, StaticPolicyConfig, StatsPolicy,
    new_https_dialer_policy,
};
pub use stats::{HttpsDialerStatsManager, StatsContainer, StatsError, TacticStats};
pub use tactic::HttpsDialerTactic;
