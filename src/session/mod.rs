//! Keeping the steam session alive
//!
//! [`SessionMachine`] decides, [`SessionController`] acts.

mod controller;
mod machine;
mod store;

pub use controller::{SessionController, SessionHandle};
pub use machine::{
    Command, DisconnectPolicy, MachineConfig, SessionEvent, SessionMachine, SessionState,
    SessionStatus, KEEP_ALIVE_INTERVAL, LOGGED_ON_MESSAGE, RELOGIN_WINDOW,
};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
