//! Credential verification and session lifecycle for the storefront.
//!
//! Short-lived signed access tokens are paired with opaque, single-use,
//! server-side refresh tokens that rotate on every refresh.

pub mod config;
pub mod cookie;
pub mod db;
pub mod error;
pub mod router;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod password;
    pub mod token;
}

pub mod models {
    pub mod principal;
    pub mod refresh_token;
    pub mod user;
}

pub mod repositories {
    pub mod memory;
    pub mod refresh_token;
    pub mod user;
}

pub mod services {
    pub mod access_token;
    pub mod session;
    pub mod totp;
}

pub mod handlers {
    pub mod auth;
    pub mod json;
    pub mod two_factor;
}

pub mod middleware_layer {
    pub mod auth;
}

pub mod validation {
    pub mod auth;
}
