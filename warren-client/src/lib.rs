//! # Warren Client Library
//!
//! An async Rust client for the warren message broker.
//!
//! ## Features
//!
//! - **Channels**: many logical channels multiplexed over one TCP connection
//! - **Async/Await**: built on tokio, one reader and one writer task per connection
//! - **Streams**: consumers and returned messages implement `futures::Stream`
//! - **Typed errors**: broker soft and hard errors surface as
//!   [`ClientError::ChannelClosed`] and [`ClientError::ConnectionClosed`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use warren_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = Connection::dial("localhost:5672").await?;
//!     let channel = connection.channel().await?;
//!
//!     channel.queue_declare("jobs", QueueDeclareOptions::default()).await?;
//!     channel
//!         .publish("", "jobs", PublishOptions::default(), BasicProperties::default(), "hello")
//!         .await?;
//!
//!     let mut consumer = channel.consume("jobs", "", ConsumeOptions::default()).await?;
//!     if let Some(delivery) = consumer.next().await {
//!         println!("Received: {}", String::from_utf8_lossy(&delivery.body));
//!         channel.ack(delivery.delivery_tag, false).await?;
//!     }
//!
//!     connection.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod error;

pub use channel::{
    Channel, ConsumeOptions, ExchangeDeclareOptions, PublishOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
pub use config::ClientConfig;
pub use connection::Connection;
pub use consumer::{Consumer, Delivery, Returned, Returns};
pub use error::ClientError;
pub use warren::protocol::{BasicProperties, FieldTable, FieldValue, QueueDeclareOk};

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
