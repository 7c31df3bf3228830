// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Opens an RTSP source, demuxes it, and pushes normalized [`Packet`]s
//! into the [`crate::router::PacketRouter`] for one stream (spec.md
//! §4.2). Retina is async/tokio-based; this worker runs on its own
//! blocking thread (spec.md §5 "IngestWorker naturally maps to a
//! blocking read loop ... threads are simpler than async here"), so it
//! hands each retina future to the runtime with `block_on(handle.spawn(..))`
//! rather than driving an executor itself.

use crate::h264;
use crate::packet::{Packet, TrackKind};
use base::shutdown::Receiver as ShutdownReceiver;
use base::{bail, err, Error};
use bytes::Bytes;
use std::pin::Pin;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraparound in the source's 32-bit RTP timestamps is detected as a
/// backward jump greater than this many ticks (spec.md §4.2).
const WRAPAROUND_THRESHOLD: i64 = 1 << 31;

/// Extends a stream's narrow (typically 32-bit, possibly wrapping)
/// presentation timestamps into a 64-bit monotonic microsecond counter.
#[derive(Default)]
pub struct PtsExtender {
    last_raw: Option<i64>,
    offset: i64,
}

impl PtsExtender {
    pub fn extend(&mut self, raw: i64) -> i64 {
        if let Some(last) = self.last_raw {
            let delta = raw - last;
            if delta < -WRAPAROUND_THRESHOLD {
                // The raw counter wrapped forward past our reference; bump
                // the offset so the extended value keeps increasing.
                self.offset += 1i64 << 32;
            }
        }
        self.last_raw = Some(raw);
        raw + self.offset
    }
}

/// One already-demuxed frame, prior to PTS extension.
pub struct RawFrame {
    pub data: Bytes,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub is_keyframe: bool,
    pub track: TrackKind,
    /// Set when the source signals new SPS/PPS alongside this frame
    /// (spec.md §4.2's "handled by forwarding the parameter sets inline
    /// with the next keyframe").
    pub new_parameters: bool,
}

/// Trait boundary around the RTSP client, so the ingest loop can be unit
/// tested without a real camera or network.
pub trait Source: Send {
    /// Returns the next frame, blocking (internally) until one is ready
    /// or `READ_TIMEOUT` elapses.
    fn next(&mut self) -> Result<RawFrame, Error>;

    /// Whether the initial probe found an audio track worth demuxing.
    /// Checked once; if false the worker never emits
    /// [`TrackKind::Audio`] packets for the life of the worker
    /// (spec.md §4.2: "declared video-only at that point for the
    /// lifetime of the worker").
    fn has_audio(&self) -> bool;
}

/// Opens a [`Source`] for a configured stream URL. A trait so tests can
/// inject a canned source instead of dialing a real camera.
pub trait Opener: Send + Sync {
    fn open(&self, stream_name: &str, url: &str) -> Result<Box<dyn Source>, Error>;
}

pub struct RetinaOpener {
    pub rt_handle: tokio::runtime::Handle,
}

impl Opener for RetinaOpener {
    fn open(&self, stream_name: &str, url: &str) -> Result<Box<dyn Source>, Error> {
        let url: url::Url = url.parse().map_err(|e| err!(InvalidArgument, "bad RTSP URL: {e}"))?;
        let label = stream_name.to_string();
        let handle = self.rt_handle.clone();
        let (inner, has_audio) = handle
            .block_on(handle.spawn(RetinaSourceInner::connect(label, url)))
            .map_err(|e| err!(Internal, "ingest connect task panicked: {e}"))??;
        Ok(Box::new(RetinaSource { inner: Some(Box::new(inner)), rt_handle: handle, has_audio }))
    }
}

struct RetinaSource {
    inner: Option<Box<RetinaSourceInner>>,
    rt_handle: tokio::runtime::Handle,
    has_audio: bool,
}

struct RetinaSourceInner {
    session: retina::client::Demuxed,
}

impl RetinaSourceInner {
    async fn connect(label: String, url: url::Url) -> Result<(RetinaSourceInner, bool), Error> {
        let session_opts = retina::client::SessionOptions::default()
            .user_agent(format!("lightnvr/{}", env!("CARGO_PKG_VERSION")));
        let mut session = retina::client::Session::describe(url, session_opts)
            .await
            .map_err(|e| err!(Unavailable, "describing {label}: {e}"))?;
        let video_i = session
            .streams()
            .iter()
            .position(|s| s.media() == "video" && matches!(s.encoding_name(), "h264"))
            .ok_or_else(|| err!(FailedPrecondition, "{label}: no supported video stream"))?;
        let has_audio = session
            .streams()
            .iter()
            .any(|s| s.media() == "audio");
        let setup_opts = retina::client::SetupOptions::default()
            .transport(retina::client::Transport::Tcp(Default::default()));
        session
            .setup(video_i, setup_opts)
            .await
            .map_err(|e| err!(Unavailable, "setting up {label}: {e}"))?;
        let session = session
            .play(retina::client::PlayOptions::default())
            .await
            .map_err(|e| err!(Unavailable, "playing {label}: {e}"))?;
        let demuxed = session.demuxed().map_err(|e| err!(Unknown, "demuxing {label}: {e}"))?;
        Ok((RetinaSourceInner { session: demuxed }, has_audio))
    }

    async fn fetch_one(mut self: Box<Self>) -> Result<(Box<Self>, RawFrame), Error> {
        use futures::StreamExt;
        loop {
            let item = tokio::time::timeout(READ_TIMEOUT, Pin::new(&mut self.session).next())
                .await
                .map_err(|_| err!(DeadlineExceeded, "no packets for {READ_TIMEOUT:?}"))?;
            match item {
                None => bail!(Unavailable, "stream ended"),
                Some(Err(e)) => bail!(Unknown, "demux error: {e}"),
                Some(Ok(retina::codec::CodecItem::VideoFrame(v))) => {
                    let new_parameters = v.has_new_parameters();
                    let is_keyframe = v.is_random_access_point();
                    let pts = v.timestamp().elapsed();
                    let data: Bytes = v.into_data().into();
                    return Ok((
                        self,
                        RawFrame {
                            data,
                            pts,
                            dts: pts,
                            duration: 0,
                            is_keyframe,
                            track: TrackKind::Video,
                            new_parameters,
                        },
                    ));
                }
                Some(Ok(retina::codec::CodecItem::AudioFrame(a))) => {
                    let pts = a.timestamp().elapsed();
                    let data: Bytes = Bytes::copy_from_slice(a.data());
                    return Ok((
                        self,
                        RawFrame {
                            data,
                            pts,
                            dts: pts,
                            duration: 0,
                            is_keyframe: false,
                            track: TrackKind::Audio,
                            new_parameters: false,
                        },
                    ));
                }
                Some(Ok(_)) => continue,
            }
        }
    }
}

impl Source for RetinaSource {
    fn next(&mut self) -> Result<RawFrame, Error> {
        // `fetch_one` consumes the inner state because it's spawned as a
        // 'static tokio task; take it out and put the returned copy back.
        let handle = self.rt_handle.clone();
        let inner = self.inner.take().expect("RetinaSource polled after failure");
        let (inner, frame) = handle
            .block_on(handle.spawn(inner.fetch_one()))
            .map_err(|e| err!(Internal, "fetch task panicked: {e}"))??;
        self.inner = Some(inner);
        Ok(frame)
    }

    fn has_audio(&self) -> bool {
        self.has_audio
    }
}

/// Hook [`crate::supervisor`] implements to observe a running worker
/// without this module depending on it directly (spec.md §4.1's
/// `Connecting -> Running` transition happens here, mid-loop, where
/// `run` is the only code that knows when the first keyframe arrives).
pub trait WorkerObserver: Send + Sync {
    fn on_packet(&self, bytes: usize);
    fn on_first_keyframe(&self);
}

/// Drives one stream's ingest loop until told to stop or an
/// unrecoverable error occurs. Returns normally on cooperative shutdown;
/// any other return is treated by [`crate::supervisor`] as a failure to
/// retry (spec.md §4.1's `Running -> Reconnecting` transition).
pub fn run(
    stream_name: &str,
    mut source: Box<dyn Source>,
    sink: &crate::router::RouterSender,
    shutdown: &ShutdownReceiver,
    observer: &dyn WorkerObserver,
) -> Result<(), Error> {
    let mut pts_ext = PtsExtender::default();
    let mut dts_ext = PtsExtender::default();
    let mut seen_keyframe = false;
    loop {
        if shutdown.check().is_err() {
            return Ok(());
        }
        let raw = source.next()?;
        if raw.track == TrackKind::Audio && !source.has_audio() {
            continue;
        }
        if !seen_keyframe && raw.track == TrackKind::Video && raw.is_keyframe {
            seen_keyframe = true;
            observer.on_first_keyframe();
        }
        let new_parameters = if raw.new_parameters {
            h264::extract_parameter_sets(&raw.data)
        } else {
            None
        };
        let bytes = raw.data.len();
        let packet = Packet {
            stream_name: stream_name.to_string(),
            pts: pts_ext.extend(raw.pts),
            dts: dts_ext.extend(raw.dts),
            duration_us: raw.duration,
            is_keyframe: raw.is_keyframe,
            track: raw.track,
            data: raw.data,
            new_parameters,
        };
        sink.send(packet)?;
        observer.on_packet(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pts_extender_handles_forward_wraparound() {
        let mut ext = PtsExtender::default();
        assert_eq!(ext.extend(100), 100);
        assert_eq!(ext.extend(200), 200);
        // Raw counter wraps back near zero: a huge backward jump.
        let wrapped = ext.extend(10);
        assert!(wrapped > 200);
    }

    #[test]
    fn pts_extender_is_monotonic_for_normal_increments() {
        let mut ext = PtsExtender::default();
        let mut prev = ext.extend(0);
        for raw in (1000..100_000).step_by(1000) {
            let v = ext.extend(raw);
            assert!(v > prev);
            prev = v;
        }
    }
}
