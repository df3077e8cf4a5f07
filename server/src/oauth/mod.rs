//! AT Protocol OAuth client: PAR handshake, DPoP-bound token lifecycle, and
//! the authenticated PDS proxy.

pub mod dpop;
pub mod jwk;
pub mod metadata;
pub mod par;
pub mod proxy;
pub mod store;
pub mod token;
