//! Types stored in the session.

pub mod session;

pub use session::CurrentUser;
pub use session::keys as session_keys;
