use std::time::Duration;

use drover_core::{ConnectionId, Job, JobId, JobStats, QueueError, Reservation};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::proto::{Command, QueueCodec, Reply};

fn unexpected(expected: &'static str, got: Reply) -> QueueError {
    QueueError::UnexpectedReply {
        expected,
        got: format!("{got:?}"),
    }
}

/// One logical link to a queue backend. Owns its own reservation state on
/// the server side; jobs must be deleted or released through the same
/// connection they were reserved from.
pub struct Connection {
    addr: ConnectionId,
    framed: Framed<TcpStream, QueueCodec>,
}

impl Connection {
    pub async fn connect(addr: &str) -> Result<Self, QueueError> {
        let stream = TcpStream::connect(addr).await?;
        debug!(addr, "connected to queue server");
        Ok(Connection {
            addr: addr.to_string(),
            framed: Framed::new(stream, QueueCodec::new()),
        })
    }

    pub fn addr(&self) -> &ConnectionId {
        &self.addr
    }

    async fn call(&mut self, cmd: Command) -> Result<Reply, QueueError> {
        self.framed.send(cmd).await?;
        match self.framed.next().await {
            Some(Ok(Reply::Error(fault))) => {
                Err(QueueError::Protocol(format!("server fault: {fault}")))
            }
            Some(reply) => reply,
            None => Err(QueueError::NotConnected(self.addr.clone())),
        }
    }

    pub async fn watch(&mut self, topic: &str) -> Result<(), QueueError> {
        match self
            .call(Command::Watch {
                topic: topic.to_string(),
            })
            .await?
        {
            Reply::Watching(_) => Ok(()),
            other => Err(unexpected("WATCHING", other)),
        }
    }

    /// Reserve one job, blocking at most `timeout`. Job stats are fetched
    /// immediately after reservation; a stats failure falls back to
    /// defaults rather than losing the job.
    pub async fn reserve(&mut self, timeout: Duration) -> Result<Reservation, QueueError> {
        let reply = self
            .call(Command::Reserve {
                timeout_secs: timeout.as_secs(),
            })
            .await?;
        match reply {
            Reply::Reserved { id, body } => {
                let stats = match self.stats_job(id).await {
                    Ok(stats) => stats,
                    Err(err) => {
                        debug!(id, error = %err, "stats-job failed, using defaults");
                        JobStats::default()
                    }
                };
                Ok(Reservation::Job(Box::new(Job::new(
                    id,
                    self.addr.clone(),
                    body,
                    stats,
                ))))
            }
            Reply::TimedOut => Ok(Reservation::TimedOut),
            Reply::DeadlineSoon => Ok(Reservation::DeadlineSoon),
            other => Err(unexpected("RESERVED", other)),
        }
    }

    pub async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        match self.call(Command::Delete { id }).await? {
            Reply::Deleted => Ok(()),
            Reply::NotFound => Err(QueueError::JobNotFound(id)),
            other => Err(unexpected("DELETED", other)),
        }
    }

    pub async fn release(&mut self, id: JobId, pri: u32, delay: u32) -> Result<(), QueueError> {
        match self.call(Command::Release { id, pri, delay }).await? {
            Reply::Released => Ok(()),
            Reply::Buried => {
                // The server parked the job instead of requeueing it. It is
                // not lost, so the release still counts.
                warn!(id, "release buried the job");
                Ok(())
            }
            Reply::NotFound => Err(QueueError::JobNotFound(id)),
            other => Err(unexpected("RELEASED", other)),
        }
    }

    pub async fn stats_job(&mut self, id: JobId) -> Result<JobStats, QueueError> {
        match self.call(Command::StatsJob { id }).await? {
            Reply::Ok(data) => serde_yaml::from_slice(&data)
                .map_err(|err| QueueError::Protocol(format!("bad stats reply: {err}"))),
            Reply::NotFound => Err(QueueError::JobNotFound(id)),
            other => Err(unexpected("OK", other)),
        }
    }
}
