mod authorizer;
mod credential;
mod manager;
mod types;

pub use authorizer::ConfiguredTokenAuthorizer;
pub use credential::{Credential, TokenKey, TokenStore, TOKEN_RECORD_VERSION};
pub use manager::{AuthenticatedTransport, ChannelManager, ChannelPaths};
pub use types::{Channel, ChannelSettings, ChannelStatistics, Visibility, CATALOGUE_VERSION};
pub(crate) use types::{ChannelCatalogue, SettingsCatalogue};
