// Transport module: connection abstraction and socket-backed implementation
pub mod error;
pub mod traits;
pub mod socket;
pub mod unix;
pub mod tcp;

pub use error::*;
pub use traits::*;
pub use socket::*;
pub use unix::*;
pub use tcp::*;
