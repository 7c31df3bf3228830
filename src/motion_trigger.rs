// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Drives one stream's [`MotionEvent`](db::motion::MotionEvent) lifecycle
//! on top of its [`MotionBuffer`](crate::motion_buffer::MotionBuffer)
//! (spec.md §3 MotionEvent, §4.3 flush semantics). Continuously buffers
//! whatever arrives on [`crate::router::PacketRouter::motion_rx`]; an
//! external trigger opens a database row, flushes the pre-buffer into
//! the segment writer's queue, and flips the stream's `MotionActive`
//! flag so [`crate::segment_writer::SegmentWriter`] keeps an MP4 open.
//! The event closes itself once `post_buffer_sec` passes without a
//! retrigger.

use crate::motion_buffer::{MotionBuffer, Pool};
use crate::packet::Packet;
use crate::segment_writer::MotionActive;
use base::clock::Clocks;
use base::shutdown::Receiver as ShutdownReceiver;
use base::time::Time;
use base::Error;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use db::motion::Source as MotionSource;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// How often the driver wakes even with no packets, so a trigger can be
/// noticed and post-buffer expiry checked promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One request to start or extend a motion event, handed in from
/// whatever upstream signal decided motion is happening (an analytic
/// pipeline, an ONVIF event, or an operator) — none of which this crate
/// implements itself.
#[derive(Clone, Copy, Debug)]
pub struct Trigger {
    pub source: MotionSource,
}

/// Cheap-to-clone handle callers use to signal motion for one stream.
#[derive(Clone)]
pub struct TriggerSender(Sender<Trigger>);

impl TriggerSender {
    pub fn trigger(&self, source: MotionSource) -> Result<(), Error> {
        self.0
            .send(Trigger { source })
            .map_err(|_| base::err!(Unavailable, "motion trigger driver not running"))
    }
}

pub fn channel() -> (TriggerSender, Receiver<Trigger>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (TriggerSender(tx), rx)
}

struct OpenEvent {
    id: i64,
    last_trigger_micros: i64,
}

/// Runs on its own thread, one per stream with `motion_recording`
/// enabled, for the lifetime of that stream's worker.
pub struct MotionTriggerDriver<C: Clocks> {
    clocks: C,
    stream_name: String,
    db: Arc<Mutex<rusqlite::Connection>>,
    events: crate::event_bus::EventBus,
    motion_rx: Receiver<Packet>,
    trigger_rx: Receiver<Trigger>,
    writer_tx: Sender<Packet>,
    motion_active: MotionActive,
    shutdown: ShutdownReceiver,
    buffer: MotionBuffer,
    post_buffer_us: i64,
    open_event: Option<OpenEvent>,
}

impl<C: Clocks> MotionTriggerDriver<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clocks: C,
        stream_name: String,
        db: Arc<Mutex<rusqlite::Connection>>,
        events: crate::event_bus::EventBus,
        motion_rx: Receiver<Packet>,
        trigger_rx: Receiver<Trigger>,
        writer_tx: Sender<Packet>,
        motion_active: MotionActive,
        shutdown: ShutdownReceiver,
        pool: Arc<Pool>,
        pre_buffer_us: i64,
        post_buffer_us: i64,
    ) -> MotionTriggerDriver<C> {
        MotionTriggerDriver {
            clocks,
            stream_name,
            db,
            events,
            motion_rx,
            trigger_rx,
            writer_tx,
            motion_active,
            shutdown,
            buffer: MotionBuffer::new(pool, pre_buffer_us),
            post_buffer_us,
            open_event: None,
        }
    }

    /// Runs until the router side disconnects or shutdown is requested.
    pub fn run(mut self) {
        loop {
            if self.shutdown.check().is_err() {
                return;
            }
            match self.motion_rx.recv_timeout(POLL_INTERVAL) {
                Ok(packet) => self.handle_packet(packet),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
            self.drain_triggers();
            self.check_expiry();
        }
    }

    fn handle_packet(&mut self, packet: Packet) {
        if self.open_event.is_some() {
            // While an event is open the pre-buffer isn't needed again
            // until the next cold trigger; forward straight through.
            let _ = self.writer_tx.send(packet);
        } else {
            self.buffer.push(packet);
        }
    }

    fn drain_triggers(&mut self) {
        while let Ok(trigger) = self.trigger_rx.try_recv() {
            self.on_trigger(trigger);
        }
    }

    fn on_trigger(&mut self, trigger: Trigger) {
        let now_micros = self.clocks.monotonic_micros();
        if let Some(open) = &mut self.open_event {
            // Spec.md §8 "motion trigger fires while previous post-buffer
            // still active": extend the same event rather than open a
            // second one.
            open.last_trigger_micros = now_micros;
            return;
        }
        let id = {
            let conn = self.db.lock().unwrap();
            match db::motion::start(&conn, &self.stream_name, Time::now(), trigger.source) {
                Ok(id) => id,
                Err(e) => {
                    error!(stream = %self.stream_name, error = %e, "failed to open motion event");
                    return;
                }
            }
        };
        self.motion_active.store(true, Ordering::Relaxed);
        let writer_tx = self.writer_tx.clone();
        let flushed = self.buffer.flush(|p| {
            let _ = writer_tx.send(p);
        });
        self.events
            .publish(crate::event_bus::Event::MotionStarted { stream_name: self.stream_name.clone(), at: Time::now() });
        debug!(stream = %self.stream_name, event_id = id, flushed, "motion event started");
        self.open_event = Some(OpenEvent { id, last_trigger_micros: now_micros });
    }

    fn check_expiry(&mut self) {
        let Some(open) = &self.open_event else { return };
        if self.clocks.monotonic_micros() - open.last_trigger_micros < self.post_buffer_us {
            return;
        }
        let id = open.id;
        {
            let conn = self.db.lock().unwrap();
            if let Err(e) = db::motion::finish(&conn, id, Time::now()) {
                error!(stream = %self.stream_name, error = %e, "failed to close motion event");
            }
        }
        self.motion_active.store(false, Ordering::Relaxed);
        self.events
            .publish(crate::event_bus::Event::MotionEnded { stream_name: self.stream_name.clone(), at: Time::now() });
        debug!(stream = %self.stream_name, event_id = id, "motion event ended");
        self.open_event = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::{Event, EventBus};
    use crate::packet::TrackKind;
    use base::clock::{Clocks, SimulatedClocks};
    use bytes::Bytes;
    use std::sync::atomic::AtomicBool;

    fn packet(pts: i64, is_keyframe: bool) -> Packet {
        Packet {
            stream_name: "cam1".to_string(),
            data: Bytes::from(vec![0u8; 10]),
            pts,
            dts: pts,
            duration_us: 0,
            is_keyframe,
            track: TrackKind::Video,
            new_parameters: None,
        }
    }

    fn open_test_db() -> Arc<Mutex<rusqlite::Connection>> {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        db::migrate::upgrade(&mut conn).unwrap();
        conn.execute("INSERT INTO streams (name, url) VALUES ('cam1', 'rtsp://x')", []).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn new_driver(
        clocks: SimulatedClocks,
        writer_tx: Sender<Packet>,
        events: EventBus,
    ) -> (MotionTriggerDriver<SimulatedClocks>, base::shutdown::Sender) {
        let (_motion_tx, motion_rx) = crossbeam_channel::unbounded();
        let (_trigger_tx, trigger_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
        let driver = MotionTriggerDriver::new(
            clocks,
            "cam1".to_string(),
            open_test_db(),
            events,
            motion_rx,
            trigger_rx,
            writer_tx,
            Arc::new(AtomicBool::new(false)),
            shutdown_rx,
            Pool::new(crate::motion_buffer::DEFAULT_POOL_BUDGET_BYTES),
            10_000_000,
            10_000_000,
        );
        (driver, shutdown_tx)
    }

    #[test]
    fn trigger_flushes_buffered_packets_into_writer_queue() {
        let (writer_tx, writer_rx) = crossbeam_channel::unbounded();
        let (mut driver, _shutdown) = new_driver(SimulatedClocks::new(0), writer_tx, EventBus::new());

        driver.handle_packet(packet(0, true));
        driver.on_trigger(Trigger { source: MotionSource::Manual });

        assert!(driver.open_event.is_some());
        assert_eq!(writer_rx.try_recv().unwrap().pts, 0);
        assert!(driver.motion_active.load(Ordering::Relaxed));
    }

    #[test]
    fn retrigger_while_open_extends_instead_of_reopening() {
        let (writer_tx, _writer_rx) = crossbeam_channel::unbounded();
        let (mut driver, _shutdown) = new_driver(SimulatedClocks::new(0), writer_tx, EventBus::new());
        driver.on_trigger(Trigger { source: MotionSource::Analytic });
        let first_id = driver.open_event.as_ref().unwrap().id;
        driver.on_trigger(Trigger { source: MotionSource::Analytic });
        assert_eq!(driver.open_event.as_ref().unwrap().id, first_id);
    }

    #[test]
    fn expiry_closes_event_and_clears_motion_active() {
        let (writer_tx, _writer_rx) = crossbeam_channel::unbounded();
        let clocks = SimulatedClocks::new(0);
        let (mut driver, _shutdown) = new_driver(clocks.clone(), writer_tx, EventBus::new());
        driver.on_trigger(Trigger { source: MotionSource::Manual });
        clocks.sleep(Duration::from_secs(11));
        driver.check_expiry();
        assert!(driver.open_event.is_none());
        assert!(!driver.motion_active.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn motion_started_and_ended_events_publish() {
        let (writer_tx, _writer_rx) = crossbeam_channel::unbounded();
        let clocks = SimulatedClocks::new(0);
        let events = EventBus::new();
        let mut sub = events.subscribe();
        let (mut driver, _shutdown) = new_driver(clocks.clone(), writer_tx, events);
        driver.on_trigger(Trigger { source: MotionSource::Manual });
        clocks.sleep(Duration::from_secs(11));
        driver.check_expiry();
        drop(driver);
        assert!(matches!(sub.recv().await.unwrap(), Event::MotionStarted { .. }));
        assert!(matches!(sub.recv().await.unwrap(), Event::MotionEnded { .. }));
    }
}
