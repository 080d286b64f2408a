//! NsBroker Core - shared, named execution contexts reachable over the network.
//!
//! A broker hosts *namespaces*: independently locked binding tables that
//! clients run code and evaluate expressions in. Namespaces can be exported
//! from one broker to another, after which the receiving broker forwards all
//! work on them to the owner transparently.
//!
//! # Example
//!
//! ```rust,ignore
//! use nsbroker_core::{Broker, BrokerConfig, BrokerServer, Client};
//!
//! #[tokio::main]
//! async fn main() -> nsbroker_core::Result<()> {
//!     let broker = Broker::new(BrokerConfig::default());
//!     let server = BrokerServer::start(broker, "127.0.0.1:8089").await?;
//!
//!     let client = Client::connect("localhost:8089/work").await?;
//!     client.exec("total = 40").await?;
//!     println!("{}", client.eval("total + 2").await?);
//!
//!     server.shutdown();
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod handler;
pub mod hostspec;
pub mod protocol;
pub mod registry;
pub mod results;
pub mod server;
pub mod value;

// Re-export commonly used types
pub use broker::Broker;
pub use client::{Client, ExecOutcome, RvState};
pub use config::{BrokerConfig, Password, ProtocolConfig, ServerConfig};
pub use connection::{Connection, ConnectionSlot};
pub use engine::{ExecutionEngine, Scope};
pub use error::{BrokerError, Result};
pub use evaluator::{Evaluator, ScriptEvaluator};
pub use handler::{ConnectionHandler, ConnectionOptions, HandlerState};
pub use hostspec::{HostSpec, Target};
pub use protocol::{AsyncHandle, ExecRequest, ExecResult, Message};
pub use registry::{Namespace, Registry};
pub use server::{apply_directives, serve_stdio, BrokerServer, BrokerServerHandle, Directive};
pub use value::Value;
