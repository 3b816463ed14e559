//! # ZMQ transport
//!
//! [`Transport`] over a monitored zmq `PAIR` socket.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::debug;

use super::{zmq, MonitoredSocket, SocketOptions, Transport, TransportError};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A connection to a single rover endpoint.
pub struct ZmqTransport {
    socket: MonitoredSocket,

    // Dropped after the socket
    _ctx: zmq::Context,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl ZmqTransport {
    /// Open a connection to `endpoint`, blocking until connected or the connect timeout in
    /// `socket_options` elapses.
    pub fn open(endpoint: &str, socket_options: &SocketOptions) -> Result<Self, TransportError> {
        let ctx = zmq::Context::new();

        let socket = MonitoredSocket::new(&ctx, zmq::PAIR, socket_options, endpoint)
            .map_err(TransportError::OpenError)?;

        debug!("ZmqTransport connected to {}", endpoint);

        Ok(Self { socket, _ctx: ctx })
    }
}

impl Transport for ZmqTransport {
    fn send(&mut self, frame: &str) -> Result<(), TransportError> {
        if !self.socket.connected() {
            return Err(TransportError::Disconnected);
        }

        self.socket
            .send(frame, 0)
            .map_err(TransportError::SendError)
    }

    fn recv(&mut self) -> Result<Option<String>, TransportError> {
        if !self.socket.connected() {
            return Err(TransportError::Disconnected);
        }

        match self.socket.recv_string(0) {
            // Valid message
            Ok(Ok(s)) => Ok(Some(s)),
            // Non UTF-8 message
            Ok(Err(_)) => Err(TransportError::NonUtf8Frame),
            // No message in timeout
            Err(zmq::Error::EAGAIN) => Ok(None),
            Err(e) => Err(TransportError::RecvError(e)),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pair_exchange() {
        let ctx = zmq::Context::new();
        let rover = ctx.socket(zmq::PAIR).unwrap();
        rover.set_rcvtimeo(1000).unwrap();
        rover.bind("tcp://127.0.0.1:*").unwrap();
        let endpoint = rover.get_last_endpoint().unwrap().unwrap();

        let options = SocketOptions {
            connect_timeout: 1000,
            recv_timeout: 10,
            send_timeout: 1000,
            linger: 0,
            ..Default::default()
        };
        let mut transport = ZmqTransport::open(&endpoint, &options).unwrap();

        transport.send(r#"{"type":1,"apiKey":"key"}"#).unwrap();
        assert_eq!(
            rover.recv_string(0).unwrap().unwrap(),
            r#"{"type":1,"apiKey":"key"}"#
        );

        // Nothing sent yet
        assert_eq!(transport.recv().unwrap(), None);

        rover.send("ok", 0).unwrap();
        let mut reply = None;
        for _ in 0..100 {
            reply = transport.recv().unwrap();
            if reply.is_some() {
                break;
            }
        }
        assert_eq!(reply.as_deref(), Some("ok"));

        rover.send(&[0xff, 0xfe][..], 0).unwrap();
        let mut err = None;
        for _ in 0..100 {
            match transport.recv() {
                Ok(None) => continue,
                other => {
                    err = Some(other);
                    break;
                }
            }
        }
        assert!(matches!(err, Some(Err(TransportError::NonUtf8Frame))));
    }
}
