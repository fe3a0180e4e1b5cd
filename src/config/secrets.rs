//! Secret handling.
//!
//! Connection strings carry credentials, so they travel as `SecretString`
//! and are only exposed at the point of connecting.

pub use secrecy::{ExposeSecret, SecretString};
