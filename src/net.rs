//! The network driver: deliver one message sequence to the server under
//! test and capture its responses, partitioned by sent-message boundaries.

use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket},
    os::fd::AsRawFd,
    process::Command,
    thread::sleep,
    time::{Duration, Instant},
};

use libafl_bolts::Error;

use crate::{
    bolts::create_timeout_error,
    config::{Config, Transport},
};

/// Upper bound on quiescence polling rounds, so a pathological target
/// cannot stall the fuzzer forever.
const MAX_QUIESCENCE_SPINS: u32 = 512;

/// Cap on accumulated response bytes per sequence.
const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// Server responses accumulated over one sequence. `offsets[i]` is the
/// total number of response bytes received after message `i` was sent.
#[derive(Debug, Default, Clone)]
pub struct ResponseBuffer {
    pub data: Vec<u8>,
    pub offsets: Vec<usize>,
}

impl ResponseBuffer {
    /// Response bytes accumulated up to and including message `i`.
    pub fn upto(&self, i: usize) -> &[u8] {
        let end = self
            .offsets
            .get(i)
            .copied()
            .unwrap_or(self.data.len())
            .min(self.data.len());
        &self.data[..end]
    }

    /// Whether some message elicited no additional response bytes.
    pub fn has_silent_message(&self) -> bool {
        let mut prev = 0usize;
        for &o in &self.offsets {
            if o == prev {
                return true;
            }
            prev = o;
        }
        false
    }
}

#[derive(Debug)]
pub struct SequenceOutcome {
    pub responses: ResponseBuffer,
    /// Heuristic: a silent message often means the server wedged itself;
    /// callers may downgrade uniqueness on this.
    pub likely_buggy: bool,
}

enum Chan {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Chan {
    fn send_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Chan::Tcp(s) => s.write_all(buf),
            Chan::Udp(s) => {
                let n = s.send(buf)?;
                if n < buf.len() {
                    return Err(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "short datagram send",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Drain whatever the server has to say right now, bounded by the
    /// socket receive timeout and the overall response cap.
    fn drain_into(&mut self, out: &mut Vec<u8>) {
        let mut chunk = [0u8; 4096];
        while out.len() < MAX_RESPONSE_BYTES {
            let res = match self {
                Chan::Tcp(s) => s.read(&mut chunk),
                Chan::Udp(s) => s.recv(&mut chunk),
            };
            match res {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    break
                }
                Err(_) => break,
            }
        }
    }
}

/// Everything needed to reach the server; built once from the config.
pub struct NetDriver {
    transport: Transport,
    host: String,
    port: u16,
    local_port: Option<u16>,
    socket_timeout: Duration,
    server_wait: Duration,
    poll_wait: Duration,
    cleanup_script: Option<String>,
}

impl NetDriver {
    pub fn new(cfg: &Config) -> Self {
        Self {
            transport: cfg.endpoint.transport,
            host: cfg.endpoint.host.clone(),
            port: cfg.endpoint.port,
            local_port: cfg.local_port,
            socket_timeout: cfg.socket_timeout,
            server_wait: cfg.server_wait,
            poll_wait: cfg.poll_wait,
            cleanup_script: cfg.cleanup_script.clone(),
        }
    }

    fn remote_addr(&self) -> Result<SocketAddr, Error> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::illegal_argument(format!("Cannot resolve target address: {e}")))?
            .next()
            .ok_or_else(|| Error::illegal_argument("Target address resolved to nothing"))
    }

    fn connect_tcp(&self, addr: SocketAddr) -> Result<TcpStream, Error> {
        if let Some(local) = self.local_port {
            return self.connect_tcp_bound(addr, local);
        }
        // The server may still be starting; keep knocking for about a
        // second.
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            match TcpStream::connect_timeout(&addr, Duration::from_millis(200)) {
                Ok(stream) => return Ok(stream),
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionRefused | ErrorKind::TimedOut
                    ) && Instant::now() < deadline =>
                {
                    sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(create_timeout_error(format!(
                        "Could not connect to the server: {e}"
                    )))
                }
            }
        }
    }

    /// Bind the client side to a fixed local port before connecting; some
    /// targets whitelist the peer.
    fn connect_tcp_bound(&self, addr: SocketAddr, local: u16) -> Result<TcpStream, Error> {
        use nix::sys::socket::{
            bind, connect, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType,
            SockaddrIn,
        };

        let SocketAddr::V4(v4) = addr else {
            return Err(Error::unsupported(
                "Fixed local ports are only supported for IPv4 targets",
            ));
        };
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let fd = socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::empty(),
                None,
            )
            .map_err(|e| Error::unknown(format!("socket() failed: {e}")))?;
            setsockopt(&fd, sockopt::ReuseAddr, &true)
                .map_err(|e| Error::unknown(format!("setsockopt() failed: {e}")))?;
            let o = [0, 0, 0, 0];
            bind(fd.as_raw_fd(), &SockaddrIn::new(o[0], o[1], o[2], o[3], local))
                .map_err(|e| Error::unknown(format!("bind() failed: {e}")))?;
            let octets = v4.ip().octets();
            let remote = SockaddrIn::new(octets[0], octets[1], octets[2], octets[3], v4.port());
            match connect(fd.as_raw_fd(), &remote) {
                Ok(()) => return Ok(TcpStream::from(fd)),
                Err(nix::errno::Errno::ECONNREFUSED) if Instant::now() < deadline => {
                    sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(create_timeout_error(format!(
                        "Could not connect from local port {local}: {e}"
                    )))
                }
            }
        }
    }

    fn open_channel(&self) -> Result<Chan, Error> {
        let addr = self.remote_addr()?;
        let chan = match self.transport {
            Transport::Tcp => {
                let stream = self.connect_tcp(addr)?;
                stream.set_read_timeout(Some(self.socket_timeout))?;
                stream.set_write_timeout(Some(self.socket_timeout.max(Duration::from_millis(10))))?;
                Chan::Tcp(stream)
            }
            Transport::Udp => {
                let sock = UdpSocket::bind(("0.0.0.0", self.local_port.unwrap_or(0)))?;
                sock.connect(addr)?;
                sock.set_read_timeout(Some(self.socket_timeout))?;
                sock.set_write_timeout(Some(self.socket_timeout.max(Duration::from_millis(10))))?;
                Chan::Udp(sock)
            }
        };
        Ok(chan)
    }

    /// Deliver a whole sequence. `still_active` is polled while waiting
    /// for the server to go quiet; it returns true as long as fresh
    /// coverage keeps appearing.
    pub fn send_sequence(
        &self,
        messages: &[&[u8]],
        mut still_active: impl FnMut() -> bool,
    ) -> Result<SequenceOutcome, Error> {
        if let Some(script) = &self.cleanup_script {
            match Command::new("sh").arg("-c").arg(script).status() {
                Ok(status) if !status.success() => {
                    log::warn!("Cleanup script exited with {status}");
                }
                Err(e) => log::warn!("Cleanup script failed to run: {e}"),
                _ => {}
            }
        }
        if !self.server_wait.is_zero() {
            sleep(self.server_wait);
        }

        let mut chan = self.open_channel()?;
        let mut responses = ResponseBuffer::default();

        // Early greeting, if the server volunteers one.
        chan.drain_into(&mut responses.data);

        let mut aborted = false;
        for msg in messages {
            if !msg.is_empty() {
                if let Err(e) = chan.send_all(msg) {
                    // A dying server still deserves a response drain; the
                    // bytes so far feed state tracking either way.
                    log::debug!("Send failed mid-sequence: {e}");
                    aborted = true;
                }
            }
            chan.drain_into(&mut responses.data);
            responses.offsets.push(responses.data.len());
            if aborted {
                break;
            }
        }

        // Wait for the server to stop producing fresh coverage.
        let mut spins = 0u32;
        while spins < MAX_QUIESCENCE_SPINS {
            if !self.poll_wait.is_zero() {
                sleep(self.poll_wait);
            }
            if !still_active() {
                break;
            }
            spins += 1;
        }
        chan.drain_into(&mut responses.data);
        if let Some(last) = responses.offsets.last_mut() {
            *last = responses.data.len();
        }

        let likely_buggy = responses.has_silent_message();
        Ok(SequenceOutcome {
            responses,
            likely_buggy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetEndpoint;
    use std::net::TcpListener;

    fn driver_for(port: u16) -> NetDriver {
        let endpoint: NetEndpoint = format!("tcp://127.0.0.1/{port}").parse().unwrap();
        NetDriver {
            transport: endpoint.transport,
            host: endpoint.host,
            port: endpoint.port,
            local_port: None,
            socket_timeout: Duration::from_millis(20),
            server_wait: Duration::ZERO,
            poll_wait: Duration::from_millis(1),
            cleanup_script: None,
        }
    }

    #[test]
    fn responses_are_partitioned_per_message() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"220 hello\r\n").unwrap();
            let mut buf = [0u8; 64];
            // Answer the first message, stay silent on the second.
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(b"331 ok\r\n").unwrap();
            let _ = stream.read(&mut buf);
            std::thread::sleep(Duration::from_millis(50));
        });

        let driver = driver_for(port);
        let outcome = driver
            .send_sequence(&[b"USER x\r\n", b"PASS y\r\n"], || false)
            .unwrap();
        server.join().unwrap();

        assert_eq!(outcome.responses.offsets.len(), 2);
        let first = outcome.responses.offsets[0];
        assert!(first >= b"220 hello\r\n".len());
        assert!(outcome
            .responses
            .upto(1)
            .windows(3)
            .any(|w| w == b"331"));
        // The silent second message trips the heuristic.
        assert!(outcome.likely_buggy);
    }

    #[test]
    fn refused_connection_is_a_transient_error() {
        // Port 1 is essentially never bound; expect a timeout-flavored
        // error, not a panic.
        let driver = driver_for(1);
        let err = driver.send_sequence(&[b"x"], || false);
        assert!(err.is_err());
    }
}
