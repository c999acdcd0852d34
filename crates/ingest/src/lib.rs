pub mod discovery;
pub mod listing;
pub mod normalizer;
pub mod pipeline;
pub mod registry;

pub use discovery::{DiscoveryConfig, DiscoveryCoordinator, DiscoveryError, DiscoveryStatus};
pub use listing::{ListConfig, ListError, ListOptions, Lookup, PairListService};
pub use normalizer::Normalizer;
pub use pipeline::Pipeline;
pub use registry::{
    Delivery, Notice, RegistryConfig, RegistryError, SubscriptionId, SubscriptionRegistry, SubscriptionState,
    WatchRequest, WatchedContract,
};
