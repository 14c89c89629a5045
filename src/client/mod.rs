//! Client connection layer and cluster drivers

pub mod async_client;
pub mod async_connection;
pub mod cluster_client;
pub mod connection;
pub mod raw_connection;
pub mod stream;

pub use async_client::AsyncClusterClient;
pub use async_connection::{
    connect_tcp_async, AsyncConnection, AsyncConnectionExt, AsyncConnectionPool, AsyncNodePool,
    AsyncPooledConnection, AsyncRespConnection,
};
pub use cluster_client::ClusterClient;
pub use connection::{Connection, ConnectionExt, ConnectionPool, PushSink, RespConnection};
pub use raw_connection::{connect_tcp, ConnectionFactory, NodePool, PooledConnection};
pub use stream::{ByteStream, ReadOutcome};
