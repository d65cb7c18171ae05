use std::time::Duration;

use async_trait::async_trait;
use drover_core::{ConnectionId, Job, QueueClient, QueueError, Reservation};
use tracing::{debug, info};

use crate::connection::Connection;

/// Fan-out over one connection per configured server. Reservation is
/// steered toward a preferred connection when the caller names one, else
/// round-robin. A connection that fails any operation is dropped and
/// redialed on the next `connect()`.
pub struct Pool {
    addrs: Vec<String>,
    topic: Option<String>,
    conns: Vec<Connection>,
    next: usize,
}

impl Pool {
    pub fn new(addrs: Vec<String>) -> Self {
        Pool {
            addrs,
            topic: None,
            conns: Vec::new(),
            next: 0,
        }
    }

    fn pick(&mut self, preferred: Option<&ConnectionId>) -> Result<usize, QueueError> {
        if self.conns.is_empty() {
            return Err(QueueError::NoConnections);
        }
        if let Some(addr) = preferred {
            if let Some(idx) = self.conns.iter().position(|c| c.addr() == addr) {
                return Ok(idx);
            }
        }
        let idx = self.next % self.conns.len();
        self.next = self.next.wrapping_add(1);
        Ok(idx)
    }

    fn conn_for(&self, addr: &ConnectionId) -> Result<usize, QueueError> {
        self.conns
            .iter()
            .position(|c| c.addr() == addr)
            .ok_or_else(|| QueueError::NotConnected(addr.clone()))
    }

    /// Drop a connection that just failed so the next `connect()` redials it
    fn evict(&mut self, idx: usize) {
        let conn = self.conns.remove(idx);
        debug!(addr = %conn.addr(), "dropping failed queue connection");
    }
}

#[async_trait]
impl QueueClient for Pool {
    async fn connect(&mut self) -> Result<(), QueueError> {
        if self.addrs.is_empty() {
            return Err(QueueError::NotConfigured);
        }
        let missing: Vec<String> = self
            .addrs
            .iter()
            .filter(|addr| !self.conns.iter().any(|c| c.addr() == *addr))
            .cloned()
            .collect();
        for addr in missing {
            let mut conn = Connection::connect(&addr).await?;
            if let Some(topic) = &self.topic {
                conn.watch(topic).await?;
            }
            info!(addr, "queue connection established");
            self.conns.push(conn);
        }
        Ok(())
    }

    async fn watch(&mut self, topic: &str) -> Result<(), QueueError> {
        self.topic = Some(topic.to_string());
        for idx in (0..self.conns.len()).rev() {
            if let Err(err) = self.conns[idx].watch(topic).await {
                self.evict(idx);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn reserve(
        &mut self,
        preferred: Option<&ConnectionId>,
        timeout: Duration,
    ) -> Result<Reservation, QueueError> {
        let idx = self.pick(preferred)?;
        match self.conns[idx].reserve(timeout).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.evict(idx);
                Err(err)
            }
        }
    }

    async fn delete(&mut self, job: &Job) -> Result<(), QueueError> {
        let idx = self.conn_for(&job.conn)?;
        match self.conns[idx].delete(job.id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !matches!(err, QueueError::JobNotFound(_)) {
                    self.evict(idx);
                }
                Err(err)
            }
        }
    }

    async fn release(&mut self, job: &Job) -> Result<(), QueueError> {
        let idx = self.conn_for(&job.conn)?;
        match self.conns[idx].release(job.id, job.stats.pri, 0).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !matches!(err, QueueError::JobNotFound(_)) {
                    self.evict(idx);
                }
                Err(err)
            }
        }
    }

    async fn decay(&mut self, job: &Job) -> Result<(), QueueError> {
        let idx = self.conn_for(&job.conn)?;
        let delay = job.decay_delay();
        match self.conns[idx].release(job.id, job.stats.pri, delay).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if !matches!(err, QueueError::JobNotFound(_)) {
                    self.evict(idx);
                }
                Err(err)
            }
        }
    }
}
