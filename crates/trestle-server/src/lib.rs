//! # Trestle Server
//!
//! Hosts a synchronous [`Dispatcher`](trestle_core::Dispatcher) behind a
//! hyper HTTP/1.1 server.
//!
//! - [`Bridge`] - Per-request exchange: body buffering, dispatch, cleanup, completion wait
//! - [`resolver`] - Maps failures to `503`/`500` without writing a committed response twice
//! - [`IdleSupervisor`] - Closes connections after a period of inactivity
//! - [`TlsTerminator`] - TLS with a client certificate policy
//! - [`Server`] - Listener loop with graceful shutdown
//!
//! ## Example
//!
//! ```rust,ignore
//! use trestle_core::dispatch_fn;
//! use trestle_server::{Server, ShutdownSignal};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listening = Server::builder()
//!         .http_addr("127.0.0.1:0")
//!         .dispatcher(dispatch_fn(|request, _body, response| {
//!             response.write(request.uri().to_string())?;
//!             Ok(())
//!         }))
//!         .build()?
//!         .bind()
//!         .await?;
//!
//!     println!("listening on {}", listening.local_addr());
//!     listening.serve_with_shutdown(ShutdownSignal::new()).await?;
//!     Ok(())
//! }
//! ```

#![doc(html_root_url = "https://docs.rs/trestle-server/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod body;
mod bridge;
mod config;
pub mod idle;
pub mod resolver;
mod server;
pub mod shutdown;
pub mod tls;

pub use body::ResponseBody;
pub use bridge::{Bridge, BridgeBuilder};
pub use config::{DispatchMode, ServerConfig, ServerConfigBuilder, DEFAULT_HTTP_ADDR, DEFAULT_SHUTDOWN_TIMEOUT_SECS};
pub use idle::{ActivityClock, IdleStream, IdleSupervisor};
pub use server::{Listening, Server, ServerBuilder, ServerError};
pub use shutdown::{ConnectionToken, ConnectionTracker, ShutdownSignal};
pub use tls::{ClientAuth, TlsTerminator};
