// Session and role resolution.
// The resolver is the only writer of the fallback record; handlers and other
// subsystems go through it.

pub mod error;
pub mod gotrue;
pub mod handlers;
pub mod provider;
pub mod resolver;
pub mod store;
