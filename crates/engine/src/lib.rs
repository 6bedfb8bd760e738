pub mod address;
pub mod bounce;
pub mod config;
pub mod directory;
pub mod encrypt;
pub mod engine;
pub mod forward;
pub mod message;
pub mod notify;
pub mod reply;
pub mod spam;
pub mod status;
pub mod testing;
pub mod transform;
pub mod transport;
pub mod unsubscribe;

pub use config::*;
pub use directory::*;
pub use engine::*;
pub use message::*;
pub use notify::*;
pub use status::*;
pub use transport::*;
