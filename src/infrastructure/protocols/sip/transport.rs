//! SIP transport layer - UDP channels feeding the stack loop

use super::channel::{Channel, ChannelFactory};
use super::message::SipMessage;
use super::stack::StackInput;
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{ChannelKey, TransportProtocol};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One UDP peer behind the shared socket
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl Channel for UdpChannel {
    fn send(&mut self, message: &SipMessage) -> Result<(), SipError> {
        let data = message.to_bytes();
        debug!("Sending {} bytes to {} via UDP", data.len(), self.peer);
        self.socket
            .try_send_to(&data, self.peer)
            .map_err(|e| SipError::TransportError(format!("Failed to send UDP packet: {}", e)))?;
        Ok(())
    }

    fn is_reliable(&self) -> bool {
        false
    }
}

/// Opens UDP channels on a bound socket
pub struct UdpChannelFactory {
    socket: Arc<UdpSocket>,
}

impl UdpChannelFactory {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl ChannelFactory for UdpChannelFactory {
    fn open(&mut self, key: &ChannelKey, addr: SocketAddr) -> Result<Box<dyn Channel>, SipError> {
        if key.transport != TransportProtocol::Udp {
            return Err(SipError::ChannelUnavailable(format!(
                "No {} transport configured",
                key.transport
            )));
        }
        Ok(Box::new(UdpChannel {
            socket: self.socket.clone(),
            peer: addr,
        }))
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    receiver: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, SipError> {
        info!("Starting UDP transport on {}", bind_addr);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::TransportError(format!("Failed to bind UDP socket: {}", e)))?;
        let local = socket.local_addr()?;
        info!("UDP transport listening on {}", local);
        Ok(Self {
            socket: Arc::new(socket),
            receiver: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SipError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn channel_factory(&self) -> UdpChannelFactory {
        UdpChannelFactory::new(self.socket.clone())
    }

    /// Start the receive loop in the background
    pub fn start(&mut self, inputs: mpsc::Sender<StackInput>) {
        let socket = self.socket.clone();
        self.receiver = Some(tokio::spawn(async move {
            Self::receive_loop(socket, inputs).await;
        }));
    }

    pub fn stop(&mut self) {
        if let Some(handle) = self.receiver.take() {
            info!("Stopping UDP transport");
            handle.abort();
        }
    }

    async fn receive_loop(socket: Arc<UdpSocket>, inputs: mpsc::Sender<StackInput>) {
        let mut buf = vec![0u8; 65535];

        loop {
            match socket.recv_from(&mut buf).await {
                Ok((size, source)) => {
                    debug!("Received {} bytes from {} via UDP", size, source);
                    let channel = ChannelKey::from_addr(TransportProtocol::Udp, source);

                    match SipMessage::parse(&buf[..size]) {
                        Ok(message) => {
                            if inputs
                                .send(StackInput::Received { channel, message })
                                .await
                                .is_err()
                            {
                                debug!("Stack loop gone, stopping UDP receive loop");
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to parse SIP message from {}: {}", source, e);
                        }
                    }
                }
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    error!("Failed to receive UDP packet: {}", e);
                }
            }
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::{SipHeaders, SipResponse};

    #[tokio::test]
    async fn test_udp_channel_round_trip() {
        let mut transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let local = transport.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        transport.start(tx);

        let mut factory = transport.channel_factory();
        let key = ChannelKey::from_addr(TransportProtocol::Udp, local);
        let mut channel = factory.open(&key, local).unwrap();
        assert!(!channel.is_reliable());

        let mut response = SipResponse::build(200);
        response.push_header("Via", "SIP/2.0/UDP 127.0.0.1;branch=z9hG4bKudp");
        response.push_header("From", "<sip:a@example.com>;tag=1");
        response.push_header("To", "<sip:b@example.com>;tag=2");
        response.push_header("Call-ID", "udp-test");
        response.push_header("CSeq", "1 OPTIONS");
        response.push_header("Content-Length", "0");
        channel.send(&SipMessage::Response(response)).unwrap();

        match rx.recv().await {
            Some(StackInput::Received { channel, message }) => {
                assert_eq!(channel, key);
                assert!(message.is_response());
            }
            _ => panic!("expected a received message"),
        }
    }

    #[tokio::test]
    async fn test_factory_rejects_other_transports() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let mut factory = transport.channel_factory();
        let key = ChannelKey::new(TransportProtocol::Tcp, "127.0.0.1", 5060);
        let result = factory.open(&key, "127.0.0.1:5060".parse().unwrap());
        assert!(matches!(result, Err(SipError::ChannelUnavailable(_))));
    }
}
