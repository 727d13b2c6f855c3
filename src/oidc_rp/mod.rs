//! OIDC Relying Party flow (§4.5): initiating upstream login, redeeming the
//! authorization code, and verifying the returned ID token against an
//! upstream JWKS cached by `kid`. [`provider`] holds the pure network/crypto
//! logic behind [`provider::Provider`] (generic OIDC or GitHub, mutually
//! exclusive per configuration); [`handler`] is the `/login`/`/logout` HTTP
//! surface.

pub mod handler;
pub mod provider;

pub use provider::Provider;
