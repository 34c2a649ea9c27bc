mod gameserver;
mod gameserverset;
mod meta;

pub use gameserver::*;
pub use gameserverset::*;
pub use meta::*;
