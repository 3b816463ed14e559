//! In-process stand-ins for the rover used by the tests.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use comms_if::{
    net::{Transport, TransportError},
    rover::{cmd::CmdFrame, Command, Reading},
};
use std::{
    sync::{
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    link::{CommandSink, LinkError, RoverLink},
    lock,
};

/// Receive poll period of the loopback transport.
const POLL: Duration = Duration::from_millis(5);

/// Server side of an in-memory connection.
pub struct LoopbackTransport {
    tx: Sender<String>,
    rx: Receiver<String>,
}

/// Rover side of an in-memory connection. Dropping it breaks the connection.
pub struct RoverEnd {
    tx: Sender<String>,
    rx: Receiver<String>,
}

pub fn loopback_pair() -> (LoopbackTransport, RoverEnd) {
    let (to_rover, from_server) = channel();
    let (to_server, from_rover) = channel();

    (
        LoopbackTransport {
            tx: to_rover,
            rx: from_rover,
        },
        RoverEnd {
            tx: to_server,
            rx: from_server,
        },
    )
}

/// Connect `link` to a new in-memory rover which accepts the handshake.
pub fn connect_loopback(link: &RoverLink) -> RoverEnd {
    let (transport, rover) = loopback_pair();

    let rover = thread::spawn(move || {
        rover.recv().unwrap();
        rover.send("ok");
        rover
    });

    let status = link.connect_with(Box::new(transport), "key").unwrap();
    assert_eq!(status, comms_if::rover::ConnectionStatus::Ok);

    rover.join().unwrap()
}

/// A new link connected to an in-memory rover.
pub fn connected_link() -> (Arc<RoverLink>, RoverEnd) {
    let link = Arc::new(RoverLink::default());
    let rover = connect_loopback(&link);
    (link, rover)
}

impl Transport for LoopbackTransport {
    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        self.tx
            .send(frame.into())
            .map_err(|_| TransportError::Disconnected)
    }

    fn recv(&mut self) -> Result<Option<String>, TransportError> {
        match self.rx.recv_timeout(POLL) {
            Ok(f) => Ok(Some(f)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected),
        }
    }
}

impl RoverEnd {
    pub fn send(&self, frame: &str) {
        self.tx.send(frame.into()).unwrap();
    }

    /// Next frame sent by the server, waiting up to a second.
    pub fn recv(&self) -> Option<String> {
        self.rx.recv_timeout(Duration::from_secs(1)).ok()
    }

    /// True if the server has not sent anything more.
    pub fn nothing_pending(&self) -> bool {
        self.rx.recv_timeout(Duration::from_millis(50)).is_err()
    }

    /// Next command frame sent by the server.
    pub fn recv_cmd(&self) -> Option<CmdFrame> {
        self.recv().map(|f| CmdFrame::from_json(&f).unwrap())
    }

    /// Send a telemetry frame with the given raw device values.
    pub fn send_telemetry(&self, raw_bits: (u8, u8, u8), head_deg: f64, distance: f64) {
        self.send(&format!(
            r#"{{"track_left":{},"track_middle":{},"track_right":{},"headX":{},"ultrasonic_distance":{},"speed":0.3}}"#,
            raw_bits.0,
            raw_bits.1,
            raw_bits.2,
            (head_deg - 90.0) / 45.0,
            distance
        ));
    }
}

/// Command sink remembering everything sent to it.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Command>>,
}

impl RecordingSink {
    pub fn take(&self) -> Vec<Command> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

impl CommandSink for RecordingSink {
    fn send(&self, cmd: &Command) -> Result<(), LinkError> {
        cmd.validate().map_err(LinkError::InvalidCommand)?;
        lock(&self.sent).push(*cmd);
        Ok(())
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// A reading arriving `ms` after the test epoch, with the line under the middle sensor.
pub fn reading_at(ms: i64, speed: f64) -> Reading {
    Reading {
        battery_voltage: 7.4,
        photosensitive: 0,
        track_left: 1,
        track_middle: 0,
        track_right: 1,
        sonar_distance: 100.0,
        head_x: 0.0,
        speed,
        direction: 0.0,
        thrust: 1,
        arrived_at: epoch() + ChronoDuration::milliseconds(ms),
    }
}

/// A reading with raw device track bits, sonar aim and distance.
pub fn sensor_reading(raw_bits: (u8, u8, u8), head_deg: f64, distance: f64) -> Reading {
    Reading {
        track_left: raw_bits.0,
        track_middle: raw_bits.1,
        track_right: raw_bits.2,
        head_x: (head_deg - 90.0) / 45.0,
        sonar_distance: distance,
        arrived_at: Utc::now(),
        ..reading_at(0, 0.3)
    }
}
