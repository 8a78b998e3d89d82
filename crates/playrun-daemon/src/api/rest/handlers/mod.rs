//! API request handlers

mod health;
mod listener;
mod playbooks;
mod plays;
mod stream;

pub use health::*;
pub use listener::*;
pub use playbooks::*;
pub use plays::*;
pub use stream::*;
