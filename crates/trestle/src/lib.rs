//! # Trestle
//!
//! **Host a synchronous request dispatcher behind an async HTTP server.**
//!
//! Trestle accepts connections with hyper on Tokio, buffers each request
//! body, calls your [`Dispatcher`](trestle_core::Dispatcher) synchronously
//! and streams back what it writes. A request may also suspend and be
//! completed later from another thread.
//!
//! - **Bounded completion** – a declared timeout that expires before the response is committed becomes `503`
//! - **Single write** – failures after the response head went out abort the body instead of writing twice
//! - **Cleanup** – registered tasks run once per request, in order, even when dispatch fails or panics
//! - **Idle connections** – closed after a configurable period without reads or writes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trestle::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     Server::builder()
//!         .http_addr("0.0.0.0:8080")
//!         .dispatcher(dispatch_fn(|request, body, response| {
//!             response.set_status(StatusCode::OK)?;
//!             response.write(format!("{} bytes to {}", body.len(), request.uri()))?;
//!             Ok(())
//!         }))
//!         .build()?
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Request Flow
//!
//! ```text
//! accept → idle supervision → (TLS) → aggregate body → dispatch → cleanup tasks
//!                                                         ↓
//!            response ← error resolution ← completion wait (optional timeout)
//! ```

#![doc(html_root_url = "https://docs.rs/trestle/0.1.0")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod bootstrap;

pub use bootstrap::{server_builder, BootstrapError, Trestle};

// Re-export core types
pub use trestle_core as core;

// Re-export server types
pub use trestle_server as server;

// Re-export telemetry
pub use trestle_telemetry as telemetry;

// Re-export configuration
pub use trestle_config as config;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use trestle::prelude::*;
///
/// let dispatcher = dispatch_fn(|_request, _body, response| {
///     response.write("ok")?;
///     Ok(())
/// });
/// # let _ = dispatcher;
/// ```
pub mod prelude {
    pub use trestle_core::{
        dispatch_fn, AsyncResponse, BridgeError, CleanupTask, DispatchError, Dispatcher,
        MaterializedBody, ProviderContext, RequestEnvelope, RequestId, ResponseError,
        ResponseWriter,
    };

    pub use trestle_server::{
        ClientAuth, DispatchMode, Server, ServerBuilder, ServerError, ShutdownSignal,
    };

    pub use trestle_config::{ConfigLoader, TrestleConfig};

    pub use crate::bootstrap::Trestle;

    pub use http::{HeaderValue, Method, StatusCode};
}
