use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{CaptureError, CaptureSource};
use crate::transport::{MediaStream, MediaTrack, TrackKind};

const FRAME_WIDTH: usize = 64;
const FRAME_HEIGHT: usize = 36;
pub const MAX_FPS: u32 = 240;

/// Test-pattern camera: a moving RGB gradient at a fixed frame rate.
///
/// The generator task lives exactly as long as the track; stopping the stream
/// ends it.
pub struct SyntheticCapture {
    fps: u32,
    unavailable: AtomicBool,
}

impl SyntheticCapture {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.clamp(1, MAX_FPS),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Makes the next `acquire` fail as if no device were attached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new(15)
    }
}

#[async_trait]
impl CaptureSource for SyntheticCapture {
    async fn acquire(&self) -> Result<MediaStream, CaptureError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceUnavailable("synthetic device disabled".into()));
        }
        let track = MediaTrack::new(TrackKind::Video);
        let period = Duration::from_secs(1) / self.fps;
        let generator = track.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut frame_number = 0u64;
            loop {
                tokio::select! {
                    _ = generator.stopped() => break,
                    _ = ticker.tick() => {
                        generator.push_sample(gradient_frame(frame_number));
                        frame_number += 1;
                    }
                }
            }
        });
        Ok(MediaStream::new(vec![track]))
    }
}

fn gradient_frame(frame_number: u64) -> Bytes {
    let base = (frame_number % 256) as u8;
    let mut data = vec![0u8; FRAME_WIDTH * FRAME_HEIGHT * 3];
    for y in 0..FRAME_HEIGHT {
        for x in 0..FRAME_WIDTH {
            let idx = (y * FRAME_WIDTH + x) * 3;
            data[idx] = base.wrapping_add(x as u8);
            data[idx + 1] = base.wrapping_add(y as u8);
            data[idx + 2] = base.wrapping_add((x + y) as u8);
        }
    }
    Bytes::from(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produces_frames_until_stopped() {
        let capture = SyntheticCapture::new(100);
        let stream = capture.acquire().await.unwrap();
        let track = stream.tracks()[0].clone();
        let mut samples = track.subscribe();

        let frame = tokio::time::timeout(Duration::from_secs(2), samples.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), FRAME_WIDTH * FRAME_HEIGHT * 3);

        stream.stop();
        assert!(!stream.is_active());
    }

    #[tokio::test]
    async fn frame_rate_is_clamped() {
        assert_eq!(SyntheticCapture::new(0).fps, 1);
        let capture = SyntheticCapture::new(u32::MAX);
        assert_eq!(capture.fps, MAX_FPS);

        let stream = capture.acquire().await.unwrap();
        let mut samples = stream.tracks()[0].subscribe();
        tokio::time::timeout(Duration::from_secs(2), samples.recv())
            .await
            .unwrap()
            .unwrap();
        stream.stop();
    }

    #[tokio::test]
    async fn unavailable_device_fails_acquire() {
        let capture = SyntheticCapture::default();
        capture.set_unavailable(true);
        assert!(matches!(
            capture.acquire().await,
            Err(CaptureError::DeviceUnavailable(_))
        ));
    }
}
