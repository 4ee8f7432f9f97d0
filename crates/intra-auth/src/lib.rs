//! Intra credential and token library
//!
//! Provides the app record data model, the persistent credential store (the
//! apps file), and the token endpoint client for the 42 intra API. This
//! crate is a standalone library with no dependency on the engine — it can
//! be tested and used independently.
//!
//! Credential flow:
//! 1. App ids and uid/secret pairs come from the web console (scraped by an
//!    external adapter) or straight from the apps file
//! 2. `AppStore::load()` reads the fleet at startup
//! 3. `token::fetch_token()` exchanges a uid/secret pair for a bearer token
//! 4. Refreshed tokens are written back via `AppStore::update_token()`
//! 5. `AppStore::save()` persists the fleet at shutdown

pub mod constants;
pub mod error;
pub mod record;
pub mod store;
pub mod token;

pub use constants::*;
pub use error::{Error, Result};
pub use record::{AppRecord, unix_now};
pub use store::AppStore;
pub use token::{TokenResponse, fetch_token};
