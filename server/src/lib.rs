pub mod auth;
pub mod did;
pub mod errors;
pub mod oauth;
pub mod routes;
pub mod security;
pub mod state;
