//! OIDC Provider: authorization-code issuance, ID-token signing, JWKS
//! publication, and discovery metadata (§4.3).

pub mod authorization;
pub mod clients;
pub mod handler;
pub mod service;
pub mod signing;

pub use clients::ClientRegistry;
pub use service::OidcProviderService;
pub use signing::SigningKey;
