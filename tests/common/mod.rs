#![allow(dead_code)]

use async_trait::async_trait;
use mppt_bridge::clock::Clock;
use mppt_bridge::mppt::session::{Connector, TcpConnector};
use mppt_bridge::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct Factory;

impl Factory {
    /// A plausible set of 45 register tokens from a SunSaver MPPT in float.
    pub fn sunsaver_tokens() -> Vec<String> {
        let mut tokens = vec!["0".to_string(); 45];
        tokens[0] = "4411".to_string(); // Adc_vb_f 13.46 V
        tokens[1] = "5898".to_string(); // Adc_va_f
        tokens[5] = "27".to_string(); // T_hs
        tokens[9] = "7".to_string(); // Charge_State FLOAT
        tokens[13] = "1".to_string(); // Ahc_r_HI
        tokens[14] = "100".to_string(); // Ahc_r_LO
        tokens[18] = "1".to_string(); // Load_State LOAD_ON
        tokens[20] = "3604".to_string(); // V_lvd 11.00 V
        tokens[29] = "3".to_string(); // Dip_Switch
        tokens
    }

    pub fn frame() -> Frame {
        Frame {
            header_id: "MPPT".to_string(),
            firmware_rev: "8".to_string(),
            raw_registers: Self::sunsaver_tokens(),
            checksum: 0,
        }
    }

    /// Wire bytes of `frame()`, checksum and CRLF included.
    pub fn report() -> Vec<u8> {
        Self::frame().encode()
    }

    /// Same report with the checksum digits replaced by a wrong value.
    pub fn corrupt_report() -> Vec<u8> {
        let mut report = Self::report();
        let star = report.iter().rposition(|b| *b == b'*').unwrap();
        let good = u8::from_str_radix(std::str::from_utf8(&report[star + 1..star + 3]).unwrap(), 16).unwrap();
        let bad = format!("{:02X}", good ^ 0xFF);
        report[star + 1..star + 3].copy_from_slice(bad.as_bytes());
        report
    }
}

#[derive(Clone, Debug)]
pub enum Reply {
    /// Write the bytes in chunks of this size, pausing between them.
    Chunked(Vec<u8>, usize),
    /// Accept, read the request, then hang up without answering.
    HangUp,
    /// Accept and never answer.
    Silent,
}

/// A translator stand-in listening on localhost. Every accepted connection gets the
/// same reply; everything the client sends is recorded per connection.
pub struct FakeDevice {
    pub port: u16,
    pub received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeDevice {
    pub async fn start(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));

        let log = received.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let log = log.clone();
                let reply = reply.clone();
                tokio::spawn(async move {
                    let bytes = Self::serve(socket, reply).await;
                    log.lock().unwrap().push(bytes);
                });
            }
        });

        Self { port, received }
    }

    async fn serve(mut socket: TcpStream, reply: Reply) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut buf = [0u8; 64];

        // wait for the report request
        while !seen.ends_with(b"R\r") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => return seen,
                Ok(n) => seen.extend_from_slice(&buf[..n]),
            }
        }

        match reply {
            Reply::Chunked(bytes, size) => {
                for chunk in bytes.chunks(size.max(1)) {
                    if socket.write_all(chunk).await.is_err() {
                        return seen;
                    }
                    let _ = socket.flush().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            Reply::HangUp => return seen,
            Reply::Silent => {}
        }

        // collect whatever follows (the restore command) until the client closes
        loop {
            match tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => seen.extend_from_slice(&buf[..n]),
            }
        }
        seen
    }

    pub fn station(&self, name: &str) -> Station {
        Station::new(name, "127.0.0.1", self.port)
    }

    /// Waits until `count` connections have finished and returns their traffic.
    pub async fn traffic(&self, count: usize) -> Vec<Vec<u8>> {
        for _ in 0..500 {
            if self.received.lock().unwrap().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received.lock().unwrap().clone()
    }
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// TCP connector that counts connection attempts per station name.
#[derive(Clone, Default)]
pub struct CountingConnector {
    inner: TcpConnector,
    pub attempts: Arc<Mutex<HashMap<String, usize>>>,
}

impl CountingConnector {
    pub fn attempts(&self, station: &str) -> usize {
        self.attempts.lock().unwrap().get(station).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.attempts.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Connector for CountingConnector {
    type Stream = TcpStream;

    async fn connect(&self, station: &Station) -> std::io::Result<Self::Stream> {
        *self.attempts.lock().unwrap().entry(station.name.clone()).or_default() += 1;
        self.inner.connect(station).await
    }
}

pub fn poll_options() -> mppt_bridge::mppt::session::PollOptions {
    mppt_bridge::mppt::session::PollOptions {
        connect_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        max_frame_bytes: 1024,
    }
}

/// Clock that never waits. `now()` hands out scripted offsets from a fixed base,
/// repeating the last one once the script runs out; `sleep` only records its argument.
/// Clones share the script and the record of sleeps.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offsets: Arc<Mutex<Vec<Duration>>>,
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn scripted(offsets_secs: &[u64]) -> Self {
        Self {
            base: Instant::now(),
            offsets: Arc::new(Mutex::new(
                offsets_secs.iter().rev().map(|s| Duration::from_secs(*s)).collect(),
            )),
            slept: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let mut offsets = self.offsets.lock().unwrap();
        let offset = if offsets.len() > 1 {
            offsets.pop().unwrap()
        } else {
            offsets.last().copied().unwrap_or_default()
        };
        self.base + offset
    }

    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}
