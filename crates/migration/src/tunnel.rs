//! Tunnel relay worker
//!
//! Copies the hypervisor's native migration byte stream from a local pipe
//! or socket onto the control-connection stream. The worker owns its end of
//! the pipe for its whole life and is joined exactly once through
//! [`TunnelHandle::stop`].
use crate::constants::TUNNEL_SEND_BUF_SIZE;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Outgoing half of a control-connection stream
#[async_trait]
pub trait TunnelStream: Send + Sync {
    async fn send(&self, data: &[u8]) -> std::io::Result<()>;

    /// Mark the stream complete; no data may follow
    async fn finish(&self) -> std::io::Result<()>;

    /// Tear the stream down mid-transfer
    async fn abort(&self) -> std::io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Tunnelled migration failed to read from hypervisor: {0}")]
    Read(std::io::Error),

    #[error("Migration tunnel wake-up channel failed")]
    Poll,

    #[error("Migration stream error: {0}")]
    Stream(std::io::Error),
}

/// Wake-up messages; the byte values mirror the wire of the self-pipe this
/// replaces: 0 drains and finishes, 1 aborts immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Finish,
    Abort,
}

pub struct TunnelHandle {
    control: mpsc::Sender<StopMode>,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl TunnelHandle {
    /// Wake the worker, join it and merge results.
    ///
    /// When the coordinator already failed (`error`), the worker's own
    /// error is discarded; otherwise it is surfaced to the caller.
    pub async fn stop(self, error: bool) -> Result<(), TunnelError> {
        let mode = if error {
            StopMode::Abort
        } else {
            StopMode::Finish
        };
        // a worker that already exited has dropped its receiver; joining
        // still yields its result
        let _ = self.control.send(mode).await;

        match self.task.await {
            Ok(result) if error => {
                if let Err(err) = result {
                    tracing::debug!("tunnel worker failed during abort: {err}");
                }
                Ok(())
            }
            Ok(result) => result,
            Err(join) => {
                tracing::warn!("tunnel worker panicked: {join}");
                Err(TunnelError::Poll)
            }
        }
    }
}

/// Spawn the relay worker over a hypervisor-side reader and a stream
pub fn start<R>(source: R, stream: Arc<dyn TunnelStream>) -> TunnelHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (control, wakeup) = mpsc::channel(1);
    let task = tokio::spawn(run(source, stream, wakeup));
    TunnelHandle { control, task }
}

async fn run<R>(
    mut source: R,
    stream: Arc<dyn TunnelStream>,
    mut wakeup: mpsc::Receiver<StopMode>,
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = vec![0u8; TUNNEL_SEND_BUF_SIZE];

    loop {
        tokio::select! {
            stop = wakeup.recv() => match stop {
                Some(StopMode::Abort) => {
                    if let Err(err) = stream.abort().await {
                        tracing::debug!("aborting migration stream failed: {err}");
                    }
                    return Ok(());
                }
                Some(StopMode::Finish) => {
                    return drain_and_finish(&mut source, &stream, &mut buffer).await;
                }
                None => {
                    let _ = stream.abort().await;
                    return Err(TunnelError::Poll);
                }
            },
            read = source.read(&mut buffer) => match read {
                Ok(0) => {
                    // hypervisor closed its end; the transfer is complete
                    return stream.finish().await.map_err(TunnelError::Stream);
                }
                Ok(n) => {
                    stream.send(&buffer[..n]).await.map_err(TunnelError::Stream)?;
                }
                Err(err) => {
                    let _ = stream.abort().await;
                    return Err(TunnelError::Read(err));
                }
            },
        }
    }
}

/// Graceful stop: one zero-timeout read pass picks up bytes the hypervisor
/// wrote without closing the pipe, then the stream is finished
async fn drain_and_finish<R>(
    source: &mut R,
    stream: &Arc<dyn TunnelStream>,
    buffer: &mut [u8],
) -> Result<(), TunnelError>
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match timeout(Duration::from_millis(0), source.read(buffer)).await {
            Err(_) => {
                // reading would block: the hypervisor kept the pipe open
                // after finishing, treat like EOF
                tracing::debug!("hypervisor left the migration pipe open");
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => stream.send(&buffer[..n]).await.map_err(TunnelError::Stream)?,
            Ok(Err(err)) => {
                let _ = stream.abort().await;
                return Err(TunnelError::Read(err));
            }
        }
    }
    stream.finish().await.map_err(TunnelError::Stream)
}
