/// The result that this crate uses
pub type Result<T> = std::result::Result<T, Error>;

/// All the errors an engine can surface to the caller.
///
/// Per-packet problems (bad identifier, truncation, out-of-window
/// sequence numbers) never reach this type; they are dropped inside the
/// receive loop and at most show up in the node report.
#[derive(Debug)]
pub enum Error {
    /// Binding or configuring the UDP socket failed
    Bind(std::io::Error),

    /// Sending on the UDP socket failed
    Send(std::io::Error),

    /// Joining or leaving a multicast group failed
    Multicast(std::io::Error),

    /// The engine is not in the right state for the requested operation
    NotRunning,

    /// A port index outside the compiled `PORTS` range was used
    InvalidPort(usize),
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Bind(inner) => write!(fmt, "UDP bind failed: {}", inner),
            Error::Send(inner) => write!(fmt, "UDP send failed: {}", inner),
            Error::Multicast(inner) => write!(fmt, "Multicast membership change failed: {}", inner),
            Error::NotRunning => write!(fmt, "Engine is not running"),
            Error::InvalidPort(port) => write!(fmt, "Invalid port index {}", port),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Bind(inner) | Error::Send(inner) | Error::Multicast(inner) => Some(inner),
            _ => None,
        }
    }
}
