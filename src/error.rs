use thiserror::Error;

/// Error kinds for the peer protocol and its orchestration layer.
///
/// `Protocol` and `Decoder` are fatal to the session that produced them;
/// `Transport` is fatal to a peer connection but transient for tracker and
/// LPD sockets, which close and reopen later.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed frame, bad length prefix, unknown message, failed schema
    /// check, double handshake, or an unexpected first message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Schema-level validation failure. On inbound traffic this surfaces as
    /// a protocol error; on outbound it means we built a bad message.
    #[error("message validation failed: {0}")]
    Decoder(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Nonzero exit from a repository tool child process.
    #[error("{command} exited with code {code}")]
    Orchestration { command: String, code: i32 },

    #[error("git error: {0}")]
    Git(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn decoder(msg: impl Into<String>) -> Self {
        Error::Decoder(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
