//! Error types for the inventory and upstream paths.
//!
//! Neither kind is ever fatal: the refresher logs and skips the scope that
//! failed, and the responder drops a query whose upstream exchange failed.

use std::net::SocketAddr;

use hickory_proto::error::ProtoError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The inventory HTTP request could not be sent or its body not read.
    #[error("inventory request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The inventory API answered with a non-2xx status.
    #[error("unexpected status code {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The inventory API body was not the expected `{ "data": ... }` envelope.
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("an IO error occurred: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("upstream {0} did not answer in time")]
    UpstreamTimeout(SocketAddr),

    /// The upstream answered with a message id that is not the one we sent.
    #[error("upstream answered id {got}, expected {expected}")]
    UpstreamMismatch { expected: u16, got: u16 },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
