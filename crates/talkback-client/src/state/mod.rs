pub mod session;

pub use session::{ConnectionState, SessionSnapshot};
