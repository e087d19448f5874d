pub mod forward;
pub mod io;
pub mod server;

pub use forward::{forward, ForwardConnection, Matcher, Replacer};
pub use server::{RequestResponseMatcher, Server, Stats};
