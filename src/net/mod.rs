//! Network layer: origin fetch seam, HTTP implementation, retry policy

pub mod client;
pub mod stub;

pub use client::{
    parse_content_range, BodyStream, FetchRange, HttpRemoteSource, RemoteInfo, RemoteResponse,
    RemoteSource, RetryPolicy,
};
pub use stub::StubRemoteSource;
