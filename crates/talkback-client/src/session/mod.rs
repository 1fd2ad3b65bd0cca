pub mod controller;
pub mod reconnect;

pub use controller::{SessionController, SessionDeps, SessionSettings};
pub use reconnect::ReconnectSupervisor;
