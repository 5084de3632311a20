// Error taxonomy shared by every component
pub mod error;

// Configuration (TOML file + environment overrides)
pub mod config;

// Execution-environment probe and storage backend selection
pub mod environment;

// Application credentials and the cloud secret store client
pub mod credentials;

// Token records, persistence backends and the lifecycle manager
pub mod token;

// OAuth authorization-code and refresh grants
pub mod oauth;

// Explicitly constructed process-wide auth state
pub mod context;

// Resilient brokerage API client
pub mod client;

// Brokerage account calls built on the client
pub mod accounts;

pub use client::{ApiClient, ApiRequest, ApiResponse};
pub use context::AuthContext;
pub use credentials::Credentials;
pub use environment::StorageBackend;
pub use error::{ApiError, AuthError, ConfigurationError, StorageError};
pub use token::{TokenManager, TokenSet, TokenState};
