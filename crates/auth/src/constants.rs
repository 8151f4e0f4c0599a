//! OAuth client defaults
//!
//! The remote service identifies its public web client with a well-known
//! client id/secret pair sent as HTTP basic auth. These are not secrets; the
//! account password and the issued tokens are.

/// Public OAuth client id used when the config does not override it
pub const DEFAULT_CLIENT_ID: &str = "web";

/// Public OAuth client secret paired with `DEFAULT_CLIENT_ID`
pub const DEFAULT_CLIENT_SECRET: &str = "web";

/// Token endpoint path relative to the API base URL
pub const TOKEN_PATH: &str = "/oauth/token";

/// Scope requested for regular account access
pub const DEFAULT_SCOPE: &str = "SCOPE_APP_WEB";
