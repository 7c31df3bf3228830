// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Per-stream packet fan-out (spec.md §2, §9): every packet from
//! [`crate::ingest`] goes to the `SegmentWriter`, and when motion
//! buffering is enabled for the stream, a cloned copy also goes to the
//! `MotionBuffer`. The router itself does no buffering or policy work;
//! that lives in the two consumers behind its queues.

use crate::packet::Packet;
use base::{err, Error};
use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Bound on the writer-side queue, enforced here so a wedged writer
/// can't grow the router's memory use without limit; the writer itself
/// applies the drop-oldest-non-keyframe policy (spec.md §4.4) by
/// draining this queue, not by the router refusing sends.
const WRITER_QUEUE_CAPACITY: usize = 256;

/// Bound on the motion-buffer-side queue. Motion buffering tolerates
/// drops more readily than recording does, so this queue is smaller;
/// a full queue here just means the oldest unconsumed packet is
/// silently replaced (see [`RouterSender::send`]).
const MOTION_QUEUE_CAPACITY: usize = 64;

/// The single-producer-single-consumer pair of queues for one stream,
/// constructed once by [`crate::supervisor`] when a worker starts.
pub struct PacketRouter {
    pub writer_rx: Receiver<Packet>,
    pub motion_rx: Option<Receiver<Packet>>,
    sender: RouterSender,
}

impl PacketRouter {
    /// Builds a new router for one stream. `motion_enabled` mirrors the
    /// stream's current `StreamSettings::motion_recording`; the
    /// supervisor rebuilds the router (and restarts the worker) if that
    /// setting changes, rather than toggling the motion queue live.
    pub fn new(motion_enabled: bool) -> PacketRouter {
        let (writer_tx, writer_rx) = crossbeam_channel::bounded(WRITER_QUEUE_CAPACITY);
        let (motion_tx, motion_rx) = if motion_enabled {
            let (tx, rx) = crossbeam_channel::bounded(MOTION_QUEUE_CAPACITY);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        PacketRouter { writer_rx, motion_rx, sender: RouterSender { writer_tx, motion_tx } }
    }

    /// The handle [`crate::ingest::run`] pushes packets through. Cheap
    /// to clone; only one producer is ever live per stream, but the
    /// type doesn't enforce that itself.
    pub fn sender(&self) -> RouterSender {
        self.sender.clone()
    }

    /// A sender into the writer-side queue alone, bypassing the motion
    /// fan-out. Used by [`crate::motion_trigger`] to hand flushed
    /// pre-buffer packets (and, while an event is open, live packets it
    /// forwards) straight to the segment writer without re-entering the
    /// motion queue.
    pub fn writer_sender(&self) -> Sender<Packet> {
        self.sender.writer_tx.clone()
    }
}

#[derive(Clone)]
pub struct RouterSender {
    writer_tx: Sender<Packet>,
    motion_tx: Option<Sender<Packet>>,
}

impl RouterSender {
    /// Fans `packet` out to the writer and, if enabled, the motion
    /// buffer. A full writer queue is an error: the caller
    /// ([`crate::ingest::run`]) treats it as a reason to stop the
    /// worker rather than block the ingest thread indefinitely.
    ///
    /// A full motion queue is not an error: motion buffering is best
    /// effort, so the stalest unconsumed packet is dropped in favor of
    /// this one, matching the ring-buffer semantics `MotionBuffer`
    /// implements on its read side (spec.md §4.3).
    pub fn send(&self, packet: Packet) -> Result<(), Error> {
        if let Some(motion_tx) = &self.motion_tx {
            let mut packet_for_motion = Some(packet.clone());
            loop {
                match motion_tx.try_send(packet_for_motion.take().unwrap()) {
                    Ok(()) => break,
                    Err(TrySendError::Full(p)) => {
                        let _ = motion_tx.try_recv();
                        packet_for_motion = Some(p);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
        }
        self.writer_tx
            .send(packet)
            .map_err(|_| err!(Unavailable, "segment writer queue closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::TrackKind;
    use bytes::Bytes;

    fn packet(pts: i64) -> Packet {
        Packet {
            stream_name: "cam1".to_string(),
            data: Bytes::from_static(b"x"),
            pts,
            dts: pts,
            duration_us: 0,
            is_keyframe: false,
            track: TrackKind::Video,
            new_parameters: None,
        }
    }

    #[test]
    fn without_motion_only_writer_receives() {
        let router = PacketRouter::new(false);
        assert!(router.motion_rx.is_none());
        router.sender().send(packet(1)).unwrap();
        assert_eq!(router.writer_rx.try_recv().unwrap().pts, 1);
    }

    #[test]
    fn with_motion_both_receive() {
        let router = PacketRouter::new(true);
        router.sender().send(packet(1)).unwrap();
        assert_eq!(router.writer_rx.try_recv().unwrap().pts, 1);
        assert_eq!(router.motion_rx.as_ref().unwrap().try_recv().unwrap().pts, 1);
    }

    #[test]
    fn full_motion_queue_drops_oldest_not_newest() {
        let router = PacketRouter::new(true);
        for i in 0..(MOTION_QUEUE_CAPACITY as i64 + 5) {
            router.sender().send(packet(i)).unwrap();
        }
        let rx = router.motion_rx.as_ref().unwrap();
        let last = std::iter::from_fn(|| rx.try_recv().ok()).last().unwrap();
        assert_eq!(last.pts, MOTION_QUEUE_CAPACITY as i64 + 4);
    }

    #[test]
    fn send_fails_once_writer_side_disconnected() {
        let router = PacketRouter::new(false);
        let sender = router.sender();
        drop(router.writer_rx);
        assert!(sender.send(packet(1)).is_err());
    }
}
