pub mod pe;
pub mod redirect;
pub mod resolve;

// Export the main functionality
pub use pe::{ModuleView, PeError};
pub use redirect::{RedirectError, RedirectSession, RedirectionReport};
pub use resolve::{StaticResolver, SymbolResolver};
