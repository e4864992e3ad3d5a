pub mod balancer;
pub mod configuration;
pub mod error;
pub mod hash_ring;
pub mod health;
pub mod key;
pub mod load_balancing;
pub mod logging;
pub mod membership;
pub mod pool;
pub mod probe;
pub mod stats;
pub mod target;
pub mod upstream;

pub use balancer::{Lease, LoadBalancer, LoadBalancerBuilder, Outcome};
pub use error::BalancerError;
pub use health::{HealthPolicy, HealthState};
pub use key::{KeyExtractor, RequestKey};
pub use load_balancing::Strategy;
pub use pool::{MembershipChange, PoolSnapshot, SourceKind};
pub use target::{Role, TargetId, TargetSpec};
pub use upstream::{Upstream, Upstreams};
