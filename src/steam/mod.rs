//! The steam side of the service: logging the account in and trading with its web session

mod provider;
mod trade;

pub use provider::{web_cookies, Credentials, WebSessionProvider};
pub use trade::*;
