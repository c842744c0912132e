//! Readiness polling over registered transports.
//!
//! One `poll(2)` call per duty cycle covers every socket an agent owns;
//! ready entries are identified by the i64 id they were registered with
//! (endpoint registration ids here).

use std::io;
use std::os::unix::io::RawFd;

/// Poll set over raw socket fds.
pub struct TransportPoller {
    pollfds: Vec<libc::pollfd>,
    ids: Vec<i64>,
}

impl TransportPoller {
    pub fn new() -> Self {
        Self { pollfds: Vec::new(), ids: Vec::new() }
    }

    pub fn register(&mut self, fd: RawFd, id: i64) {
        self.pollfds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
        self.ids.push(id);
    }

    pub fn unregister(&mut self, id: i64) {
        if let Some(index) = self.ids.iter().position(|&existing| existing == id) {
            self.pollfds.swap_remove(index);
            self.ids.swap_remove(index);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pollfds.is_empty()
    }

    /// Poll without blocking; push the ids of readable transports into
    /// `ready` and return how many there were.
    pub fn poll(&mut self, ready: &mut Vec<i64>) -> io::Result<usize> {
        ready.clear();
        if self.pollfds.is_empty() {
            return Ok(0);
        }

        let rc = unsafe {
            libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, 0)
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(0);
        }

        for (index, pollfd) in self.pollfds.iter_mut().enumerate() {
            if pollfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) != 0 {
                ready.push(self.ids[index]);
            }
            pollfd.revents = 0;
        }
        Ok(ready.len())
    }
}

impl Default for TransportPoller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::channel::UdpChannel;
    use crate::udp::transport::UdpTransport;
    use crate::uri::ChannelUri;

    #[test]
    fn ready_after_datagram_arrives() {
        let uri = ChannelUri::parse("spate:udp?endpoint=127.0.0.1:0").unwrap();
        let channel = UdpChannel::from_uri(&uri).unwrap();
        let receive = UdpTransport::for_receive(&channel, 0).unwrap();
        let addr = receive.local_addr().unwrap();

        let mut poller = TransportPoller::new();
        poller.register(receive.fd(), 42);

        let mut ready = Vec::new();
        assert_eq!(poller.poll(&mut ready).unwrap(), 0);

        let send_uri = ChannelUri::parse(&format!("spate:udp?endpoint={addr}")).unwrap();
        let send =
            UdpTransport::for_send(&UdpChannel::from_uri(&send_uri).unwrap(), 0).unwrap();
        send.send_to(b"x", addr).unwrap();

        let mut seen = false;
        for _ in 0..1000 {
            if poller.poll(&mut ready).unwrap() > 0 {
                seen = true;
                break;
            }
            std::thread::yield_now();
        }
        assert!(seen);
        assert_eq!(ready, vec![42]);

        poller.unregister(42);
        assert!(poller.is_empty());
    }
}
