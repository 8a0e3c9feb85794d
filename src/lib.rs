pub mod blob;
pub mod cache;
pub mod config;
pub mod error;
pub mod feed;
pub mod mutation;
pub mod profile;
pub mod queries;
pub mod service;
pub mod session;
pub mod validate;

pub use cache::{Query, QueryCache, QueryEntry, QueryKey, QueryOp, QueryStatus, ReadOptions, Subscription};
pub use error::{ErrorDisplay, ServiceError};
pub use mutation::{Mutation, MutationCoordinator, MutationKind};
pub use profile::{Aggregate, AggregateStatus, DerivedProfileView, MemberCard, ProfileAggregator};
pub use session::{IdentityEvent, Session, SessionManager};
