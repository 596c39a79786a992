//! FTP driven by an event loop.
//!
//! The session lives on a private single-threaded tokio runtime. An upload
//! opens a write stream whose task reports `StreamEvent`s as it goes; an
//! `UploadHandler` consumes them and decides when the request is finished.
//! Each public request runs the loop with `block_on` until that terminal
//! event, so callers get the same synchronous contract as the blocking driver.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

use super::{parse_pasv_reply, remote_components, remote_path_string, split_remote, TransferDriver};
use crate::config::RemoteSettings;
use crate::error::{DriverError, EngineError};
use crate::progress::ProgressSink;

const STREAM_CHUNK: usize = 64 * 1024;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
struct Reply {
    code: u32,
    text: String,
}

impl Reply {
    /// 2xx
    fn is_positive(&self) -> bool {
        self.code / 100 == 2
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
}

fn redact(command: &str) -> &str {
    if command.starts_with("PASS ") {
        "PASS ****"
    } else {
        command
    }
}

struct ControlChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: IpAddr,
    timeout: Duration,
}

impl ControlChannel {
    async fn open(endpoint: &str, timeout: Duration) -> io::Result<Self> {
        let stream = time::timeout(timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| timed_out("connect"))??;
        let peer = stream.peer_addr()?.ip();
        let (read_half, write_half) = stream.into_split();
        Ok(ControlChannel {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            timeout,
        })
    }

    async fn read_line(&mut self, line: &mut String) -> io::Result<()> {
        let n = time::timeout(self.timeout, self.reader.read_line(line))
            .await
            .map_err(|_| timed_out("reply"))??;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed",
            ));
        }
        Ok(())
    }

    async fn read_reply(&mut self) -> io::Result<Reply> {
        let mut line = String::new();
        self.read_line(&mut line).await?;
        let code = line
            .get(..3)
            .and_then(|c| c.parse::<u32>().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("bad reply: {:?}", line)))?;
        let mut text = line.trim_end().to_string();

        // Multi-line reply: "123-..." up to a line starting with "123 "
        if line.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{} ", code);
            loop {
                let mut next = String::new();
                self.read_line(&mut next).await?;
                text.push('\n');
                text.push_str(next.trim_end());
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }
        debug!(code, "FTP <");
        Ok(Reply { code, text })
    }

    async fn send(&mut self, command: &str) -> io::Result<()> {
        debug!(command = %redact(command), "FTP >");
        let line = format!("{}\r\n", command);
        time::timeout(self.timeout, self.writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| timed_out("command"))?
    }

    async fn command(&mut self, command: &str) -> io::Result<Reply> {
        self.send(command).await?;
        self.read_reply().await
    }
}

/// Events a write stream reports while it runs.
#[derive(Debug)]
enum StreamEvent {
    OpenCompleted,
    CanAcceptBytes { sent: u64 },
    EndEncountered,
    ErrorOccurred(io::Error),
}

enum Flow {
    Continue,
    Finished(Result<u64, DriverError>),
}

/// Turns the event stream of one upload into its result.
struct UploadHandler<'p, 's> {
    path: &'p str,
    total: u64,
    sent: u64,
    opened: bool,
    sink: &'s mut dyn ProgressSink,
}

impl UploadHandler<'_, '_> {
    fn handle(&mut self, event: StreamEvent) -> Flow {
        match event {
            StreamEvent::OpenCompleted => {
                self.opened = true;
                Flow::Continue
            }
            StreamEvent::CanAcceptBytes { sent } => {
                self.sent = sent;
                if self.sink.report(sent, self.total) {
                    Flow::Continue
                } else {
                    Flow::Finished(Err(DriverError::Cancelled))
                }
            }
            StreamEvent::EndEncountered => Flow::Finished(Ok(self.sent)),
            StreamEvent::ErrorOccurred(e) => {
                let stage = if self.opened { "write" } else { "open" };
                Flow::Finished(Err(DriverError::Transfer {
                    path: self.path.to_string(),
                    message: format!("{} failed: {}", stage, e),
                }))
            }
        }
    }
}

/// Write `file` to `data`, one event per chunk. The bounded channel keeps the
/// writer at most one chunk ahead of the handler.
async fn drive_write_stream(
    mut data: TcpStream,
    mut file: tokio::fs::File,
    events: mpsc::Sender<StreamEvent>,
) {
    if events.send(StreamEvent::OpenCompleted).await.is_err() {
        return;
    }
    let mut buffer = vec![0u8; STREAM_CHUNK];
    let mut sent: u64 = 0;

    loop {
        let n = match file.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let _ = events.send(StreamEvent::ErrorOccurred(e)).await;
                return;
            }
        };
        if let Err(e) = data.write_all(&buffer[..n]).await {
            let _ = events.send(StreamEvent::ErrorOccurred(e)).await;
            return;
        }
        sent += n as u64;
        if events.send(StreamEvent::CanAcceptBytes { sent }).await.is_err() {
            return;
        }
    }

    match data.shutdown().await {
        Ok(()) => {
            let _ = events.send(StreamEvent::EndEncountered).await;
        }
        Err(e) => {
            let _ = events.send(StreamEvent::ErrorOccurred(e)).await;
        }
    }
}

async fn open_session(settings: &RemoteSettings) -> Result<ControlChannel, DriverError> {
    let endpoint = settings.endpoint();
    let timeout = Duration::from_secs(settings.timeout_secs.max(1));
    let connect_error = |message: String| DriverError::Connect {
        endpoint: endpoint.clone(),
        message,
    };
    let access_denied = |message: String| DriverError::AccessDenied {
        endpoint: endpoint.clone(),
        message,
    };

    let mut control = ControlChannel::open(&endpoint, timeout)
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    let greeting = control.read_reply().await.map_err(|e| connect_error(e.to_string()))?;
    if greeting.code != 220 {
        return Err(connect_error(greeting.text));
    }

    let reply = control
        .command(&format!("USER {}", settings.user_name))
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    let reply = match reply.code {
        230 => reply,
        331 | 332 => control
            .command(&format!("PASS {}", settings.password))
            .await
            .map_err(|e| connect_error(e.to_string()))?,
        530 => return Err(access_denied(reply.text)),
        _ => return Err(connect_error(reply.text)),
    };
    match reply.code {
        230 | 202 => {}
        530 => return Err(access_denied(reply.text)),
        _ => return Err(connect_error(reply.text)),
    }

    let reply = control
        .command("TYPE I")
        .await
        .map_err(|e| connect_error(e.to_string()))?;
    if !reply.is_positive() {
        return Err(connect_error(reply.text));
    }
    Ok(control)
}

async fn walk(
    control: &mut ControlChannel,
    components: &[String],
    create_if_missing: bool,
) -> Result<bool, DriverError> {
    let reply = control
        .command("CWD /")
        .await
        .map_err(|e| DriverError::io("/", e))?;
    if !reply.is_positive() {
        return Err(DriverError::Transfer {
            path: "/".to_string(),
            message: reply.text,
        });
    }

    let mut current = String::new();
    for component in components {
        current.push('/');
        current.push_str(component);

        let cwd = format!("CWD {}", component);
        let reply = control
            .command(&cwd)
            .await
            .map_err(|e| DriverError::io(current.clone(), e))?;
        if reply.is_positive() {
            continue;
        }
        if !create_if_missing {
            return Ok(false);
        }

        debug!(path = %current, "creating remote directory");
        let made = control
            .command(&format!("MKD {}", component))
            .await
            .map_err(|e| DriverError::io(current.clone(), e))?;
        if !made.is_positive() {
            debug!(path = %current, reply = %made.text, "MKD refused");
        }
        let reply = control
            .command(&cwd)
            .await
            .map_err(|e| DriverError::io(current.clone(), e))?;
        if !reply.is_positive() {
            return Err(DriverError::DirectoryCreation {
                path: current,
                message: reply.text,
            });
        }
    }
    Ok(true)
}

/// PASV, send `command`, connect the data socket and wait for the
/// preliminary reply.
async fn open_data_stream(
    control: &mut ControlChannel,
    command: &str,
    path: &str,
) -> Result<TcpStream, DriverError> {
    let io_error = |e: io::Error| DriverError::io(path, e);
    let transfer_error = |message: String| DriverError::Transfer {
        path: path.to_string(),
        message,
    };

    let reply = control.command("PASV").await.map_err(io_error)?;
    if reply.code != 227 {
        return Err(transfer_error(reply.text));
    }
    let advertised = parse_pasv_reply(&reply.text)
        .ok_or_else(|| transfer_error(format!("cannot parse passive reply: {}", reply.text)))?;
    let address = if advertised.ip().is_unspecified() {
        SocketAddr::new(control.peer, advertised.port())
    } else {
        SocketAddr::V4(advertised)
    };

    control.send(command).await.map_err(io_error)?;
    let connected = match time::timeout(control.timeout, TcpStream::connect(address)).await {
        Ok(connected) => connected,
        Err(_) => Err(timed_out("data connect")),
    };
    let data = match connected {
        Ok(data) => data,
        Err(e) => {
            // The server still answers the command; consume that reply so the
            // next request reads its own.
            if let Ok(reply) = control.read_reply().await {
                debug!(code = reply.code, "reply after failed data connection");
            }
            return Err(io_error(e));
        }
    };
    let reply = control.read_reply().await.map_err(io_error)?;
    if reply.code != 125 && reply.code != 150 {
        return Err(transfer_error(reply.text));
    }
    Ok(data)
}

/// FTP session whose requests are driven by an event loop.
pub struct EventLoopFtpDriver {
    settings: RemoteSettings,
    runtime: Runtime,
    control: Option<ControlChannel>,
}

impl EventLoopFtpDriver {
    pub fn new(settings: RemoteSettings) -> Result<Self, EngineError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Unknown {
                message: format!("cannot start transfer event loop: {}", e),
            })?;
        Ok(EventLoopFtpDriver {
            settings,
            runtime,
            control: None,
        })
    }

    fn parts(&mut self) -> Result<(&Runtime, &mut ControlChannel), DriverError> {
        let control = self.control.as_mut().ok_or(DriverError::NotConnected)?;
        Ok((&self.runtime, control))
    }
}

impl TransferDriver for EventLoopFtpDriver {
    fn describe(&self) -> String {
        format!("FTP server {}", self.settings.endpoint())
    }

    fn connect(&mut self) -> Result<(), DriverError> {
        self.close();
        let attempts = self.settings.retry_count + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.runtime.block_on(open_session(&self.settings)) {
                Ok(control) => {
                    info!(endpoint = %self.settings.endpoint(), attempt, "FTP session opened");
                    self.control = Some(control);
                    return Ok(());
                }
                Err(e @ DriverError::AccessDenied { .. }) => return Err(e),
                Err(e) => {
                    warn!(endpoint = %self.settings.endpoint(), attempt, error = %e, "FTP connect failed");
                    last_error = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(RETRY_BACKOFF * attempt);
                    }
                }
            }
        }
        Err(last_error.unwrap_or(DriverError::NotConnected))
    }

    fn ensure_directory(&mut self, path: &Path, create_if_missing: bool) -> Result<bool, DriverError> {
        let components = remote_components(path);
        let (runtime, control) = self.parts()?;
        runtime.block_on(walk(control, &components, create_if_missing))
    }

    fn exists(&mut self, path: &Path, is_directory: bool) -> Result<bool, DriverError> {
        if is_directory {
            return self.ensure_directory(path, false);
        }
        let remote_string = remote_path_string(path);
        let (parent, name) = split_remote(path)?;
        let (runtime, control) = self.parts()?;
        runtime.block_on(async move {
            if !walk(control, &parent, false).await? {
                return Ok(false);
            }
            let reply = control
                .command(&format!("SIZE {}", name))
                .await
                .map_err(|e| DriverError::io(remote_string, e))?;
            Ok(reply.code == 213)
        })
    }

    fn upload(
        &mut self,
        local: &Path,
        remote: &Path,
        sink: &mut dyn ProgressSink,
    ) -> Result<u64, DriverError> {
        let remote_string = remote_path_string(remote);
        let (parent, name) = split_remote(remote)?;
        let local_string = local.display().to_string();
        let (runtime, control) = self.parts()?;

        runtime.block_on(async move {
            walk(control, &parent, true).await?;

            let file = tokio::fs::File::open(local)
                .await
                .map_err(|e| DriverError::io(local_string.clone(), e))?;
            let total = file
                .metadata()
                .await
                .map_err(|e| DriverError::io(local_string.clone(), e))?
                .len();

            let data = open_data_stream(control, &format!("STOR {}", name), &remote_string).await?;
            let (events_tx, mut events) = mpsc::channel(1);
            let writer = tokio::spawn(drive_write_stream(data, file, events_tx));

            let mut handler = UploadHandler {
                path: &remote_string,
                total,
                sent: 0,
                opened: false,
                sink,
            };
            let outcome = loop {
                let event = events.recv().await.unwrap_or_else(|| {
                    StreamEvent::ErrorOccurred(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "write stream ended without a terminal event",
                    ))
                });
                if let Flow::Finished(result) = handler.handle(event) {
                    break result;
                }
            };

            // Stop the writer (dropping the data socket) before reading the
            // server's verdict on the transfer.
            if outcome.is_err() {
                writer.abort();
            }
            let _ = writer.await;
            drop(events);
            let verdict = control.read_reply().await;

            match outcome {
                Ok(bytes) => {
                    let verdict = verdict.map_err(|e| DriverError::io(remote_string.clone(), e))?;
                    if !verdict.is_positive() {
                        return Err(DriverError::Transfer {
                            path: remote_string,
                            message: verdict.text,
                        });
                    }
                    debug!(path = %remote_string, bytes, "upload complete");
                    Ok(bytes)
                }
                Err(DriverError::Cancelled) => {
                    if let Ok(reply) = control.command(&format!("DELE {}", name)).await {
                        debug!(path = %remote_string, code = reply.code, "partial file removal");
                    }
                    info!(path = %remote_string, "upload canceled");
                    Err(DriverError::Cancelled)
                }
                Err(e) => Err(e),
            }
        })
    }

    fn delete(&mut self, path: &Path) -> Result<(), DriverError> {
        let remote_string = remote_path_string(path);
        let (parent, name) = split_remote(path)?;
        let (runtime, control) = self.parts()?;
        runtime.block_on(async move {
            if !walk(control, &parent, false).await? {
                return Err(DriverError::NotFound { path: remote_string });
            }
            let reply = control
                .command(&format!("DELE {}", name))
                .await
                .map_err(|e| DriverError::io(remote_string.clone(), e))?;
            if reply.is_positive() {
                Ok(())
            } else {
                Err(DriverError::NotFound { path: remote_string })
            }
        })
    }

    fn close(&mut self) {
        if let Some(mut control) = self.control.take() {
            let quit = self.runtime.block_on(async move { control.command("QUIT").await });
            if let Err(e) = quit {
                debug!(error = %e, "QUIT failed");
            }
            info!(endpoint = %self.settings.endpoint(), "FTP session closed");
        }
    }
}

impl Drop for EventLoopFtpDriver {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder(Vec<u64>, bool);

    impl ProgressSink for Recorder {
        fn report(&mut self, bytes_done: u64, _bytes_total: u64) -> bool {
            self.0.push(bytes_done);
            self.1
        }
    }

    #[test]
    fn test_handler_finishes_on_end() {
        let mut sink = Recorder(Vec::new(), true);
        let mut handler = UploadHandler {
            path: "/a",
            total: 10,
            sent: 0,
            opened: false,
            sink: &mut sink,
        };

        assert!(matches!(handler.handle(StreamEvent::OpenCompleted), Flow::Continue));
        assert!(matches!(handler.handle(StreamEvent::CanAcceptBytes { sent: 4 }), Flow::Continue));
        assert!(matches!(handler.handle(StreamEvent::CanAcceptBytes { sent: 10 }), Flow::Continue));
        assert!(matches!(handler.handle(StreamEvent::EndEncountered), Flow::Finished(Ok(10))));
        assert_eq!(sink.0, vec![4, 10]);
    }

    #[test]
    fn test_handler_stops_when_sink_refuses() {
        let mut sink = Recorder(Vec::new(), false);
        let mut handler = UploadHandler {
            path: "/a",
            total: 10,
            sent: 0,
            opened: true,
            sink: &mut sink,
        };
        assert!(matches!(
            handler.handle(StreamEvent::CanAcceptBytes { sent: 4 }),
            Flow::Finished(Err(DriverError::Cancelled))
        ));
    }

    #[test]
    fn test_handler_reports_stream_errors() {
        let mut sink = Recorder(Vec::new(), true);
        let mut handler = UploadHandler {
            path: "/a/b.mov",
            total: 10,
            sent: 0,
            opened: false,
            sink: &mut sink,
        };
        match handler.handle(StreamEvent::ErrorOccurred(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        ))) {
            Flow::Finished(Err(DriverError::Transfer { path, message })) => {
                assert_eq!(path, "/a/b.mov");
                assert!(message.starts_with("open failed"));
            }
            _ => panic!("expected a transfer error"),
        }
    }

    /// Control server that advertises a passive port nobody listens on.
    fn unreachable_passive_server() -> String {
        use std::io::{BufRead, BufReader as StdBufReader, Write};

        let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let port = closed.local_addr().expect("Failed to read address").port();
        drop(closed);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to read address");
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("Failed to accept");
            let mut reader = StdBufReader::new(stream.try_clone().expect("Failed to clone"));
            let mut writer = stream;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap_or(0) > 0 {
                let reply = match line.split_whitespace().next() {
                    Some("PASV") => format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{})",
                        port >> 8,
                        port & 0xff
                    ),
                    Some("STOR") => "425 Cannot open data connection".to_string(),
                    _ => "200 OK".to_string(),
                };
                let _ = writer.write_all(format!("{}\r\n", reply).as_bytes());
                line.clear();
            }
        });
        addr.to_string()
    }

    #[test]
    fn test_failed_data_connection_keeps_replies_in_step() {
        let endpoint = unreachable_passive_server();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("Failed to build runtime");

        runtime.block_on(async {
            let mut control = ControlChannel::open(&endpoint, Duration::from_secs(5))
                .await
                .expect("Failed to open control channel");
            let result = open_data_stream(&mut control, "STOR clip.mov", "/clip.mov").await;
            assert!(result.is_err());

            let reply = control.command("NOOP").await.expect("NOOP failed");
            assert_eq!(reply.code, 200);
        });
    }

    #[test]
    fn test_requests_before_connect_fail() {
        let mut driver = EventLoopFtpDriver::new(RemoteSettings {
            server_name: "127.0.0.1".to_string(),
            ..RemoteSettings::default()
        })
        .expect("Failed to build driver");
        assert!(matches!(
            driver.exists(Path::new("/x"), true),
            Err(DriverError::NotConnected)
        ));
    }
}
