pub use crate::connection::{ConnId, Connection, Flags};
pub use crate::endpoint::{Endpoint, Proto};
pub use crate::event::{handler, Event, EventHandler};
pub use crate::http::{parse_http, HttpMessage, StartLine};
pub use crate::manager::Manager;
pub use crate::support::{NetworkError, SetupError};
pub use crate::tls::{TlsConfig, TlsProvider, TlsSession};
pub use crate::wakeup::Broadcaster;
pub use crate::ws::{Opcode, WsMessage};
