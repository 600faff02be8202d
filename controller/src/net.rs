use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use launcher_common::{DatagramTransport, Error, Result};

// One socket bound to an ephemeral port with `SO_BROADCAST` set. Sends are
// synchronous and never retried.
pub struct UdpBroadcaster {
    socket: UdpSocket,
    broadcast: Ipv4Addr,
}

impl UdpBroadcaster {
    pub fn bind(broadcast: [u8; 4]) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        Ok(Self {
            socket,
            broadcast: Ipv4Addr::from(broadcast),
        })
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        self.broadcast
    }
}

impl DatagramTransport for UdpBroadcaster {
    fn send_broadcast(&self, port: u16, payload: &[u8]) -> Result<usize> {
        self.socket
            .send_to(payload, SocketAddrV4::new(self.broadcast, port))
            .map_err(Error::SendFailed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use launcher_common::{protocol::build_wake_packet, HardwareAddress};

    use super::*;

    #[test]
    fn sends_to_configured_address() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let sender = UdpBroadcaster::bind([127, 0, 0, 1]).unwrap();
        let packet = build_wake_packet(&HardwareAddress::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(sender.send_broadcast(port, &packet).unwrap(), 102);

        let mut buf = [0_u8; 256];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &packet[..]);
    }
}
