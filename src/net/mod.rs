//! TCP networking built on the reactor: sockets, the acceptor, connections,
//! and the server.

mod acceptor;
mod connection;
mod server;
mod socket;

pub use acceptor::Acceptor;
pub use connection::{Connection, ConnectionCallback, ConnectionState, MessageCallback};
pub use server::TcpServer;
pub use socket::{Socket, DEFAULT_BACKLOG};
