//! Defaults for every tunable. Binaries thread these into constructors
//! explicitly; nothing here is read from the environment.

use std::time::Duration;

/// Well-known Unix socket path of the local socket bridge.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/pipesecret.sock";

/// Environment variable that overrides the socket path on both ends.
pub const SOCKET_ENV: &str = "PIPESECRET_SOCKET";

/// Projects the username and password fields of a 1Password login item.
pub const DEFAULT_QUERY: &str = r#"{"username": .fields[] | select(.id == "username").value, "password": .fields[] | select(.id == "password").value}"#;

/// Command run on the far end of the session by `serve`.
pub const DEFAULT_REMOTE_COMMAND: &str = "pipesecret remote-serve";

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// `op` may block on a biometric prompt, so calls get a generous budget.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
