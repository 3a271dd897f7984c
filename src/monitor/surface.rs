use crate::error::AppError;
use crate::monitor::types::UiFrame;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};

pub const FRAME_CHANNEL_CAPACITY: usize = 4_096;

/// Charting collaborator: accepts render instructions and never blocks the caller.
pub trait ChartSurface {
    fn emit(&mut self, frame: UiFrame) -> Result<(), AppError>;
}

pub type FrameReceiver = mpsc::Receiver<UiFrame>;

#[derive(Debug, Clone)]
pub struct FrameEmitter {
    frame_tx: mpsc::Sender<UiFrame>,
    dropped: Arc<AtomicU64>,
}

pub fn frame_channel(capacity: usize) -> (FrameEmitter, FrameReceiver) {
    let (frame_tx, frame_rx) = mpsc::channel(capacity);
    let emitter = FrameEmitter {
        frame_tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (emitter, frame_rx)
}

impl FrameEmitter {
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits for room instead of dropping; used outside the dispatch path.
    pub async fn publish(&self, frame: UiFrame) -> Result<(), AppError> {
        self.frame_tx
            .send(frame)
            .await
            .map_err(|_| AppError::ChannelClosed)
    }
}

impl ChartSurface for FrameEmitter {
    fn emit(&mut self, frame: UiFrame) -> Result<(), AppError> {
        match self.frame_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(AppError::Handler(
                    "chart surface backlog is full; frame dropped".to_string(),
                ))
            }
            Err(TrySendError::Closed(_)) => Err(AppError::ChannelClosed),
        }
    }
}

/// Writes every frame as one JSON line until all emitters are gone.
pub async fn write_frames_jsonl<W>(mut frames: FrameReceiver, mut writer: W) -> Result<u64, AppError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0_u64;
    while let Some(frame) = frames.recv().await {
        let mut line = simd_json::to_string(&frame)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        written += 1;
    }
    Ok(written)
}
