pub mod api_keys;
pub mod credential_disallow;
pub mod credentials;
pub mod downstream_traffic;
pub mod error_rules;
pub mod global_config;
pub mod internal_events;
pub mod message_requests;
pub mod model_prices;
pub mod providers;
pub mod request_filters;
pub mod sensitive_words;
pub mod upstream_requests;
pub mod upstream_traffic;
pub mod upstream_usages;
pub mod user_keys;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use credential_disallow::Entity as CredentialDisallow;
pub use credentials::Entity as Credentials;
pub use downstream_traffic::Entity as DownstreamTraffic;
pub use error_rules::Entity as ErrorRules;
pub use global_config::Entity as GlobalConfig;
pub use internal_events::Entity as InternalEvents;
pub use message_requests::Entity as MessageRequests;
pub use model_prices::Entity as ModelPrices;
pub use providers::Entity as Providers;
pub use request_filters::Entity as RequestFilters;
pub use sensitive_words::Entity as SensitiveWords;
pub use upstream_requests::Entity as UpstreamRequests;
pub use upstream_traffic::Entity as UpstreamTraffic;
pub use upstream_usages::Entity as UpstreamUsages;
pub use user_keys::Entity as UserKeys;
pub use users::Entity as Users;
