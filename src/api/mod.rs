pub mod client;
pub mod logging;
pub mod mock_client;
pub mod stream;
pub mod upstream;

pub use client::{ByteStream, ProxyClient};
pub use stream::EnvelopeParser;
pub use upstream::{ApiProtocol, UpstreamClient};
