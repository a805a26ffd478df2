//! Agent transport for adbrief: the local auth proxy and the agent client.

pub mod agent;
pub mod proxy;
pub mod shared;

pub use shared::{ProviderError, ProviderErrorKind, ProviderResult, USER_AGENT};
