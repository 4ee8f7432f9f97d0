//! Intra API endpoint constants
//!
//! Public endpoint configuration for the 42 intra API. These values are not
//! secrets — the actual secrets (uid/secret pairs and access tokens) are
//! managed by the app store.

/// Base URL prepended to leading-slash request paths
pub const API_BASE: &str = "https://api.intra.42.fr/v2";

/// Token endpoint for the client-credentials grant
pub const TOKEN_ENDPOINT: &str = "https://api.intra.42.fr/oauth/token";

/// Sentinel for an unknown token expiry
pub const EXPIRY_UNKNOWN: i64 = -1;
