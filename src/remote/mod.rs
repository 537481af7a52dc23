mod cache;
mod codec;
mod proxy;
mod transport;

pub use codec::{decode, encode, Request, Response};
pub use proxy::{Forwarded, RemoteLockProxy};
pub use transport::{call, InProcessTransport, LockTransport, PayloadHandler};
