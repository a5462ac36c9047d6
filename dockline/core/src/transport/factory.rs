//! Transport Factory
//!
//! Entry points for turning a descriptor into a connection agent.

use futures::future::BoxFuture;

use super::agent::ConnectionAgent;
use super::config::TransportConfig;
use super::descriptor::TransportDescriptor;
use super::traits::TransportError;

/// Acquire a connection agent for `descriptor` with default limits
///
/// # Errors
///
/// Returns `TransportError::Connection` when the transport cannot be opened
/// (missing socket, SSH connect or authentication failure) and
/// `TransportError::Tls` when TLS material is unusable. Nothing stays open
/// on error.
///
/// # Example
///
/// ```ignore
/// use dockline_core::transport::{acquire_connection, TransportDescriptor};
///
/// let agent = acquire_connection(TransportDescriptor::local_socket("/var/run/docker.sock")).await?;
/// let channel = agent.open_channel().await?;
/// agent.release().await?;
/// ```
pub async fn acquire_connection(
    descriptor: TransportDescriptor,
) -> Result<ConnectionAgent, TransportError> {
    ConnectionAgent::acquire(&TransportConfig::for_descriptor(descriptor)).await
}

/// Run `body` with an agent that is released afterwards
///
/// The agent is released exactly once on the normal path. If the returned
/// future is cancelled or `body` panics, the agent's drop tears it down.
/// A release failure after a successful body is returned as the error.
pub async fn with_connection<T, F>(config: &TransportConfig, body: F) -> Result<T, TransportError>
where
    F: for<'a> FnOnce(&'a ConnectionAgent) -> BoxFuture<'a, T>,
{
    let agent = ConnectionAgent::acquire(config).await?;
    let value = body(&agent).await;
    agent.release().await?;
    Ok(value)
}
