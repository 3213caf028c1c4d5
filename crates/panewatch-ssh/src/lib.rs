pub mod config;
pub mod error;
pub mod events;
pub mod poller;
pub mod reconnect;
pub mod russh_transport;
pub mod session;
pub mod shell;
pub mod transport;

pub use config::{Credentials, ReconnectPolicy, SessionConfig};
pub use error::{Result, SessionError};
pub use events::{PollOutcome, SessionEvent};
pub use poller::PanePoller;
pub use reconnect::ReconnectSupervisor;
pub use russh_transport::RusshConnector;
pub use session::RemoteSession;
pub use transport::{Connector, ShellStream, Transport};
