use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("socks5 protocol error: {0}")]
    Protocol(String),

    #[error("socks5 request failed: {reason} (0x{code:02x})")]
    Socks5Reply { code: u8, reason: &'static str },

    #[error("socks5 handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("dns exchange timed out after {0:?}")]
    DnsTimeout(std::time::Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Map an RFC 1928 reply code to a failure error. Code 0 is success and
    /// must not reach this constructor.
    pub fn socks5_reply(code: u8) -> Self {
        let reason = match code {
            0x01 => "general failure",
            0x02 => "connection not allowed",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown error",
        };
        Error::Socks5Reply { code, reason }
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        std::io::Error::other(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
