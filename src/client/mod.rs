//! Client-side middlewares

pub mod auth;

pub use auth::{AuthMiddleware, CredentialError, Credentials, CredentialsProvider, StaticCredentials};
