pub mod admin;
pub mod db;
pub mod member;
pub mod metrics;
pub mod placement;
pub mod ps_admin;
pub mod service;
pub mod space;

pub use metrics::MetricsRegistry;
pub use placement::{AlwaysLive, LivenessProbe};
pub use ps_admin::PsAdmin;
pub use service::{MasterService, ServerAddr};
pub use space::SpaceUpdate;
