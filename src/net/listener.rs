//! TCP listener: one task per connection feeding decoded frames to the broker.

use super::router::ConnectionRouter;
use crate::broker::Broker;
use crate::core::config::ListenerConfig;
use crate::mqtt::codec::{read_message, write_message, CodecError};
use crate::mqtt::{ConnectReturnCode, Message, Packet};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Listener {
    inner: TcpListener,
    broker: Arc<Broker>,
    router: Arc<ConnectionRouter>,
    max_frame_bytes: usize,
    default_keep_alive: u16,
}

impl Listener {
    pub async fn bind(
        cfg: &ListenerConfig,
        broker: Arc<Broker>,
        router: Arc<ConnectionRouter>,
    ) -> Result<Self> {
        let inner = TcpListener::bind(&cfg.bind)
            .await
            .with_context(|| format!("failed to bind TCP listener on {}", cfg.bind))?;
        info!("MQTT listener bound on {}", inner.local_addr()?);
        Ok(Self {
            inner,
            broker,
            router,
            max_frame_bytes: cfg.max_frame_bytes,
            default_keep_alive: cfg.default_keep_alive_secs,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// Accept connections until the task is dropped.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!("tcp accept error: {err:?}");
                    continue;
                }
            };
            let connection = Connection {
                id: Uuid::new_v4().to_string(),
                broker: self.broker.clone(),
                router: self.router.clone(),
                max_frame_bytes: self.max_frame_bytes,
                keep_alive: self.default_keep_alive,
            };
            tokio::spawn(async move {
                debug!("accepted peer={} connection_id={}", peer, connection.id);
                connection.run(stream).await;
            });
        }
    }
}

struct Connection {
    id: String,
    broker: Arc<Broker>,
    router: Arc<ConnectionRouter>,
    max_frame_bytes: usize,
    keep_alive: u16,
}

enum Flow {
    Continue,
    Close,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) {
        let mut outbound = self.router.register(&self.id);
        let (mut reader, mut writer) = stream.into_split();
        let (frames_tx, mut frames) = mpsc::channel::<Result<Message, CodecError>>(16);
        let max_frame_bytes = self.max_frame_bytes;
        let reader_task = tokio::spawn(async move {
            loop {
                let frame = read_message(&mut reader, max_frame_bytes).await;
                let failed = frame.is_err();
                if frames_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
        });

        let mut session_id: Option<String> = None;
        let mut last_seen = Instant::now();
        loop {
            let idle = tokio::time::sleep_until(last_seen + grace(self.keep_alive));
            tokio::select! {
                biased;
                out = outbound.recv() => {
                    let Some(message) = out else { break };
                    match self.write(&mut writer, &mut session_id, message).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(err) => {
                            warn!("write failed connection_id={} err={}", self.id, err);
                            break;
                        }
                    }
                }
                frame = frames.recv() => match frame {
                    Some(Ok(message)) => {
                        last_seen = Instant::now();
                        if let Packet::Connect(connect) = &message.packet {
                            self.keep_alive = connect.keep_alive;
                        }
                        if let Err(err) = self
                            .broker
                            .on_message(&self.id, session_id.as_deref(), message)
                            .await
                        {
                            debug!("message rejected connection_id={} err={}", self.id, err);
                        }
                    }
                    Some(Err(CodecError::Closed)) | None => {
                        debug!("peer closed connection_id={}", self.id);
                        break;
                    }
                    Some(Err(err)) => {
                        warn!("bad frame connection_id={} err={}", self.id, err);
                        break;
                    }
                },
                _ = idle, if self.keep_alive > 0 => {
                    info!(
                        "keep-alive expired connection_id={} keep_alive={}",
                        self.id, self.keep_alive
                    );
                    break;
                }
            }
        }

        self.router.deregister(&self.id);
        reader_task.abort();
        let _ = writer.shutdown().await;
        if let Err(err) = self
            .broker
            .on_connection_closed(&self.id, session_id.as_deref())
            .await
        {
            warn!("connection cleanup failed connection_id={} err={}", self.id, err);
        }
    }

    async fn write(
        &self,
        writer: &mut OwnedWriteHalf,
        session_id: &mut Option<String>,
        message: Message,
    ) -> Result<Flow, CodecError> {
        match &message.packet {
            Packet::Disconnect(_) => return Ok(Flow::Close),
            Packet::ConnectAck(ack) if ack.code == ConnectReturnCode::Accepted => {
                *session_id = Some(message.route.session_id.clone());
            }
            _ => {}
        }
        write_message(writer, &message).await?;
        Ok(Flow::Continue)
    }
}

/// MQTT allows one and a half keep-alive periods of silence.
fn grace(keep_alive: u16) -> Duration {
    Duration::from_millis(u64::from(keep_alive) * 1500).max(Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::grace;
    use std::time::Duration;

    #[test]
    fn grace_is_one_and_a_half_periods() {
        assert_eq!(grace(10), Duration::from_secs(15));
        assert_eq!(grace(1), Duration::from_millis(1500));
        assert_eq!(grace(0), Duration::from_secs(1));
    }
}
