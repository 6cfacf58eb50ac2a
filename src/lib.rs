//! Keep a single steam account logged in and expose its trading functions over http
//!
//! Steam guard codes are requested from operators through telegram when the account
//! has no shared secret configured.

pub mod auth;
pub mod broker;
pub mod chats;
pub mod config;
mod de;
pub mod http;
pub mod provider;
pub mod session;
pub mod shutdown;
pub mod steam;
mod store;
pub mod telegram;

pub use store::FileStoreError;
