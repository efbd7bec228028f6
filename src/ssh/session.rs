//! A pool of transfer connections to one remote.

use parking_lot::RwLock;
use std::sync::Arc;

use super::command::TransferCommand;
use super::connection::Connection;
use crate::{Error, Result};

/// Ordered, resizable set of [`Connection`]s sharing one command line.
///
/// Connection `n` is meant for worker `n` of a transfer adapter, so the pool
/// grows with the adapter's concurrency.
pub struct Session {
    command: TransferCommand,
    connections: RwLock<Vec<Arc<Connection>>>,
}

impl Session {
    /// Start the first connection. Fails if it cannot be established.
    pub fn new(command: TransferCommand) -> Result<Session> {
        let first = Connection::start(0, &command.program, &command.args, command.trace_packets)?;
        Ok(Session {
            command,
            connections: RwLock::new(vec![Arc::new(first)]),
        })
    }

    /// The `n`th connection, counting from 0.
    pub fn connection(&self, n: usize) -> Result<Arc<Connection>> {
        self.connections
            .read()
            .get(n)
            .cloned()
            .ok_or_else(|| Error::protocol(format!("pure SSH connection unavailable (#{n})")))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Grow or shrink the pool to exactly `n` connections.
    ///
    /// Shrinking ends the dropped connections; they leave the pool even if
    /// ending one fails, and the first such error is returned.
    pub fn set_connection_count(&self, n: usize) -> Result<()> {
        let mut connections = self.connections.write();
        self.resize(&mut connections, n)
    }

    /// Grow the pool to at least `n` connections. Never shrinks.
    pub fn set_connection_count_at_least(&self, n: usize) -> Result<()> {
        let mut connections = self.connections.write();
        if n <= connections.len() {
            return Ok(());
        }
        self.resize(&mut connections, n)
    }

    /// End every connection.
    pub fn shutdown(&self) -> Result<()> {
        tracing::debug!("shutting down pure SSH connections");
        self.set_connection_count(0)
    }

    fn resize(&self, connections: &mut Vec<Arc<Connection>>, n: usize) -> Result<()> {
        let count = connections.len();
        if n < count {
            let mut first_err = None;
            for conn in connections.drain(n..) {
                tracing::debug!(
                    "terminating pure SSH connection (#{}) (resetting total from {} to {})",
                    conn.id(),
                    count,
                    n
                );
                if let Err(e) = conn.end() {
                    first_err.get_or_insert(e);
                }
            }
            return first_err.map_or(Ok(()), Err);
        }
        for id in count..n {
            let conn = Connection::start(id, &self.command.program, &self.command.args, self.command.trace_packets)
                .map_err(|e| {
                    tracing::debug!("failed to spawn pure SSH connection (#{}): {}", id, e);
                    e
                })?;
            connections.push(Arc::new(conn));
        }
        Ok(())
    }
}
