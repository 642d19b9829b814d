use bytes::Bytes;
use std::time::Duration;
use tokio::{io::AsyncRead, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::dca::DcaDecoder;
use crate::error::DcaError;

/// Frames between two position reports.
pub const POSITION_REPORT_INTERVAL: u64 = 50;

/// Receives the elapsed playback time. Runs on the streaming task, so it
/// must not block.
pub type PositionCallback = Box<dyn Fn(Duration) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub frames_sent: u64,
    pub position: Duration,
}

/// Decodes frames from `decoder` into `out` until EOF or cancellation.
///
/// Cancellation is observed before every decode and while waiting on a full
/// channel, and ends the stream without error. A closed receiver also ends
/// it quietly: the consumer reports its own failure.
pub async fn stream_frames<R>(
    cancel: &CancellationToken,
    decoder: &mut DcaDecoder<R>,
    out: &mpsc::Sender<Bytes>,
    report_every: u64,
    on_position: Option<PositionCallback>,
) -> Result<StreamSummary, DcaError>
where
    R: AsyncRead + Unpin,
{
    let mut frames_sent = 0u64;

    loop {
        if cancel.is_cancelled() {
            debug!("Stream cancelado tras {} frames", frames_sent);
            break;
        }

        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = decoder.next_frame() => frame?,
        };

        let Some(frame) = frame else {
            debug!("Fin del stream tras {} frames", frames_sent);
            break;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = out.send(frame) => {
                if sent.is_err() {
                    debug!("Receptor de frames cerrado");
                    break;
                }
            }
        }

        frames_sent += 1;

        if report_every > 0 && frames_sent % report_every == 0 {
            if let Some(callback) = &on_position {
                callback(position_at(decoder.frame_duration(), frames_sent));
            }
        }
    }

    Ok(StreamSummary {
        frames_sent,
        position: position_at(decoder.frame_duration(), frames_sent),
    })
}

fn position_at(frame_duration: Duration, frames: u64) -> Duration {
    let frames = u32::try_from(frames).unwrap_or(u32::MAX);
    frame_duration.saturating_mul(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::dca::{DcaEncoder, EncodeOptions};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    fn container(frames: usize) -> Vec<u8> {
        let mut encoder = DcaEncoder::new(Vec::new(), &EncodeOptions::default().metadata()).unwrap();
        for i in 0..frames {
            encoder.write_frame(&[i as u8; 3]).unwrap();
        }
        encoder.finish().unwrap()
    }

    async fn drain(mut rx: mpsc::Receiver<Bytes>) -> usize {
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        count
    }

    #[tokio::test]
    async fn test_streams_every_frame_until_eof() {
        let data = container(120);
        let mut decoder = DcaDecoder::new(&data[..]);
        let (tx, rx) = mpsc::channel(8);
        let consumer = tokio::spawn(drain(rx));

        let reports = Arc::new(Mutex::new(Vec::new()));
        let callback: PositionCallback = {
            let reports = reports.clone();
            Box::new(move |position| reports.lock().unwrap().push(position))
        };

        let summary = stream_frames(&CancellationToken::new(), &mut decoder, &tx, 50, Some(callback))
            .await
            .unwrap();
        drop(tx);

        assert_eq!(consumer.await.unwrap(), 120);
        assert_eq!(summary.frames_sent, 120);
        assert_eq!(summary.position, Duration::from_millis(2_400));
        assert_eq!(
            *reports.lock().unwrap(),
            vec![Duration::from_millis(1_000), Duration::from_millis(2_000)]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start_sends_nothing() {
        let data = container(10);
        let mut decoder = DcaDecoder::new(&data[..]);
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = stream_frames(&cancel, &mut decoder, &tx, 50, None).await.unwrap();
        drop(tx);

        assert_eq!(summary.frames_sent, 0);
        assert_eq!(drain(rx).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_after_n_frames_stops_delivery() {
        let data = container(100);
        let (tx, rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();

        let callback: PositionCallback = {
            let cancel = cancel.clone();
            Box::new(move |_| cancel.cancel())
        };

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut decoder = DcaDecoder::new(&data[..]);
                stream_frames(&cancel, &mut decoder, &tx, 5, Some(callback)).await
            }
        });

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.frames_sent, 5);
        assert_eq!(drain(rx).await, 5);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_send() {
        let data = container(10);
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut decoder = DcaDecoder::new(&data[..]);
                stream_frames(&cancel, &mut decoder, &tx, 50, None).await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("stream did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(summary.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_decode_error_propagates() {
        let mut data = container(2);
        data.extend_from_slice(&(-1i16).to_le_bytes());
        let mut decoder = DcaDecoder::new(&data[..]);
        let (tx, rx) = mpsc::channel(8);

        let result = stream_frames(&CancellationToken::new(), &mut decoder, &tx, 50, None).await;
        drop(tx);

        assert!(matches!(result, Err(DcaError::NegativeFrameLength(-1))));
        assert_eq!(drain(rx).await, 2);
    }

    #[tokio::test]
    async fn test_closed_receiver_ends_stream() {
        let data = container(10);
        let mut decoder = DcaDecoder::new(&data[..]);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let summary = stream_frames(&CancellationToken::new(), &mut decoder, &tx, 50, None)
            .await
            .unwrap();
        assert_eq!(summary.frames_sent, 0);
    }
}
