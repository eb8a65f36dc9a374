use crate::prelude::*;
use crate::clock::Clock;
use crate::mppt::decoder::decode_all;

use {
    async_trait::async_trait,
    bytes::BytesMut,
    net2::TcpStreamExt,
    num_enum::IntoPrimitive,
    std::time::Duration,
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    tokio_util::codec::Decoder,
};

const TCP_KEEPALIVE_SECS: u64 = 60;
const LINE_END: &[u8] = b"\r\n";

/// Single-character commands understood by the translator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Dump a report frame now.
    Report = b'R',
    /// Resume periodic broadcast.
    Broadcast = b'T',
}

impl Command {
    pub fn line(self) -> [u8; 2] {
        [self.into(), b'\r']
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    AwaitingFrame,
    ModeRestoring,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            max_frame_bytes: 1024,
        }
    }
}

impl From<&ConfigWrapper> for PollOptions {
    fn from(config: &ConfigWrapper) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            max_frame_bytes: config.max_frame_bytes(),
        }
    }
}

// ReportDecoder {{{
/// Yields the accumulated bytes once a line terminator shows up anywhere in them, or
/// once the byte cap is reached, whichever happens first.
#[derive(Debug, Clone, Copy)]
pub struct ReportDecoder {
    max_len: usize,
}

impl ReportDecoder {
    pub fn new(max_len: usize) -> Self {
        Self { max_len: max_len.max(LINE_END.len()) }
    }
}

impl Decoder for ReportDecoder {
    type Item = BytesMut;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        let window = src.len().min(self.max_len);

        if let Some(pos) = src[..window].windows(LINE_END.len()).position(|w| w == LINE_END) {
            return Ok(Some(src.split_to(pos + LINE_END.len())));
        }

        if src.len() >= self.max_len {
            debug!("report reached {} byte cap without a line terminator", self.max_len);
            return Ok(Some(src.split_to(self.max_len)));
        }

        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Ok(Some(src.split())),
        }
    }
} // }}}

// Connector {{{
/// Opens the byte stream to a station.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    async fn connect(&self, station: &Station) -> std::io::Result<Self::Stream>;
}

#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    pub use_tcp_nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self { use_tcp_nodelay: true }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = tokio::net::TcpStream;

    async fn connect(&self, station: &Station) -> std::io::Result<Self::Stream> {
        let stream = tokio::net::TcpStream::connect((station.host.as_str(), station.port)).await?;

        // net2 only speaks std sockets
        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
            warn!("{}: failed to set TCP keepalive: {}", station.name, e);
        }
        let stream = tokio::net::TcpStream::from_std(std_stream)?;

        if self.use_tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{}: failed to set TCP_NODELAY: {}", station.name, e);
            }
        }

        Ok(stream)
    }
} // }}}

/// One station's request/response exchange. Owns its stream exclusively.
pub struct Session<S> {
    station: String,
    stream: S,
    state: SessionState,
    options: PollOptions,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already connected stream.
    pub fn new(station: &str, stream: S, options: PollOptions) -> Self {
        Self {
            station: station.to_string(),
            stream,
            state: SessionState::Connected,
            options,
        }
    }

    pub async fn connect<C>(connector: &C, station: &Station, options: PollOptions) -> Result<Self, PollError>
    where
        C: Connector<Stream = S>,
    {
        debug!(
            "{}: {:?} to {}:{}",
            station.name,
            SessionState::Connecting,
            station.host,
            station.port
        );

        let stream = match tokio::time::timeout(options.connect_timeout, connector.connect(station)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(PollError::Connect {
                    host: station.host.clone(),
                    port: station.port,
                    source,
                })
            }
            Err(_) => {
                return Err(PollError::ConnectTimeout {
                    host: station.host.clone(),
                    port: station.port,
                    timeout: options.connect_timeout,
                })
            }
        };

        debug!("{}: connected", station.name);
        Ok(Self::new(&station.name, stream, options))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn send(&mut self, command: Command) -> Result<(), PollError> {
        let line = command.line();
        trace!("{}: TX {:?}", self.station, command);

        let write_timeout = self.options.read_timeout;
        let stream = &mut self.stream;
        let result = match tokio::time::timeout(write_timeout, async {
            stream.write_all(&line).await?;
            stream.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PollError::Transport(e)),
            Err(_) => Err(PollError::Timeout(write_timeout)),
        };

        if let Err(PollError::Transport(_)) = &result {
            self.state = SessionState::Failed;
        }
        result
    }

    /// Switches the device into report mode and reads its answer.
    pub async fn request_frame(&mut self) -> Result<BytesMut, PollError> {
        self.send(Command::Report).await?;
        self.state = SessionState::AwaitingFrame;

        let mut decoder = ReportDecoder::new(self.options.max_frame_bytes);
        let mut buf = BytesMut::with_capacity(self.options.max_frame_bytes);
        let deadline = tokio::time::Instant::now() + self.options.read_timeout;

        loop {
            if let Some(report) = decoder.decode(&mut buf)? {
                trace!("{}: RX {} bytes", self.station, report.len());
                return Ok(report);
            }

            let len = match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    self.state = SessionState::Failed;
                    return Err(PollError::Transport(e));
                }
                Err(_) => return Err(PollError::Timeout(self.options.read_timeout)),
            };

            if len == 0 {
                return match decoder.decode_eof(&mut buf)? {
                    Some(report) => Ok(report),
                    None => {
                        self.state = SessionState::Failed;
                        Err(PollError::Closed)
                    }
                };
            }
        }
    }

    /// Puts the device back into periodic broadcast mode.
    pub async fn restore_mode(&mut self) -> Result<(), PollError> {
        self.state = SessionState::ModeRestoring;
        self.send(Command::Broadcast).await
    }

    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("{}: shutdown: {}", self.station, e);
        }
        self.state = SessionState::Disconnected;
        debug!("{}: {:?}", self.station, self.state);
    }
}

/// The whole exchange with one station: connect, request, decode, restore, close.
///
/// Restoring broadcast mode is attempted whenever the transport is still usable,
/// including after a bad frame; a failed restore is only logged.
pub async fn poll_station<C, K>(
    connector: &C,
    clock: &K,
    station: &Station,
    registry: &SchemaRegistry,
    options: PollOptions,
) -> Result<DecodedRecord, PollError>
where
    C: Connector,
    K: Clock,
{
    let mut session = Session::connect(connector, station, options).await?;
    let start = clock.now();

    let frame = match session.request_frame().await {
        Ok(raw) => FrameCodec::for_registry(registry).decode(&raw).map_err(PollError::from),
        Err(e) => Err(e),
    };

    if session.state() != SessionState::Failed {
        if let Err(e) = session.restore_mode().await {
            warn!("{}: failed to restore broadcast mode: {}", station.name, e);
        }
    }

    let comm_duration = clock.now().saturating_duration_since(start).as_secs_f64();
    session.close().await;

    let frame = frame?;
    Ok(decode_all(
        &frame,
        registry,
        &station.name,
        chrono::Utc::now(),
        comm_duration,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    #[test]
    fn commands_are_single_characters_with_carriage_return() {
        assert_eq!(&Command::Report.line(), b"R\r");
        assert_eq!(&Command::Broadcast.line(), b"T\r");
    }

    #[test]
    fn decoder_waits_for_line_terminator() {
        let mut decoder = ReportDecoder::new(1024);
        let mut buf = BytesMut::from(&b"$MPPT,1,2"[..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"*00\r");
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"\n");
        let report = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&report[..], b"$MPPT,1,2*00\r\n");
        assert!(buf.is_empty());
    }

    #[test]
    fn decoder_stops_at_cap() {
        let mut decoder = ReportDecoder::new(8);
        let mut buf = BytesMut::from(&b"0123456789"[..]);
        let report = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&report[..], b"01234567");
    }

    #[test]
    fn decoder_hands_back_partial_data_at_eof() {
        let mut decoder = ReportDecoder::new(64);
        let mut buf = BytesMut::from(&b"$MPPT*00"[..]);
        assert_eq!(&decoder.decode_eof(&mut buf).unwrap().unwrap()[..], b"$MPPT*00");

        let mut empty = BytesMut::new();
        assert_eq!(decoder.decode_eof(&mut empty).unwrap(), None);
    }

    #[tokio::test]
    async fn session_tracks_state_through_exchange() {
        let (client, mut device) = tokio::io::duplex(256);
        let mut session = Session::new("S", client, PollOptions::default());
        assert_eq!(session.state(), SessionState::Connected);

        let device_task = tokio::spawn(async move {
            let mut cmd = [0u8; 2];
            device.read_exact(&mut cmd).await.unwrap();
            assert_eq!(&cmd, b"R\r");
            device.write_all(b"$A,1*5C\r\n").await.unwrap();
            device.read_exact(&mut cmd).await.unwrap();
            assert_eq!(&cmd, b"T\r");
        });

        let report = session.request_frame().await.unwrap();
        assert_eq!(&report[..], b"$A,1*5C\r\n");
        assert_eq!(session.state(), SessionState::AwaitingFrame);

        session.restore_mode().await.unwrap();
        assert_eq!(session.state(), SessionState::ModeRestoring);

        session.close().await;
        device_task.await.unwrap();
    }

    // Replays a canned report and refuses every write after the first command.
    struct ScriptedStream {
        report: Vec<u8>,
        pos: usize,
        written: Arc<Mutex<Vec<u8>>>,
        shut_down: Arc<Mutex<bool>>,
    }

    impl AsyncRead for ScriptedStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let this = self.get_mut();
            let n = (this.report.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.report[this.pos..this.pos + n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ScriptedStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<std::io::Result<usize>> {
            let mut written = self.written.lock().unwrap();
            if written.len() >= 2 {
                return Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed")));
            }
            written.extend_from_slice(data);
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            *self.shut_down.lock().unwrap() = true;
            Poll::Ready(Ok(()))
        }
    }

    struct ScriptedConnector {
        stream: Mutex<Option<ScriptedStream>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Stream = ScriptedStream;

        async fn connect(&self, _station: &Station) -> std::io::Result<Self::Stream> {
            self.stream
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "used"))
        }
    }

    #[tokio::test]
    async fn failed_restore_still_returns_record_and_closes() {
        let registry = SchemaRegistry::load().unwrap();
        let frame = Frame {
            header_id: "MPPT".to_string(),
            firmware_rev: "8".to_string(),
            raw_registers: vec!["0".to_string(); registry.len()],
            checksum: 0,
        };
        let written = Arc::new(Mutex::new(Vec::new()));
        let shut_down = Arc::new(Mutex::new(false));
        let connector = ScriptedConnector {
            stream: Mutex::new(Some(ScriptedStream {
                report: frame.encode(),
                pos: 0,
                written: written.clone(),
                shut_down: shut_down.clone(),
            })),
        };

        let station = Station::new("S", "127.0.0.1", 5001);
        let record = poll_station(&connector, &TokioClock, &station, &registry, PollOptions::default())
            .await
            .unwrap();

        assert_eq!(record.station, "S");
        assert_eq!(record.state("Charge_State"), Some("START"));
        assert_eq!(&written.lock().unwrap()[..], b"R\r");
        assert!(*shut_down.lock().unwrap());
    }
}
