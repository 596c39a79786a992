//! In-process FTP server for the integration tests.
//!
//! Serves a temporary directory over plain FTP with passive-mode data
//! connections. Only the commands the drivers use are implemented. Every
//! command line received is logged so tests can assert on what a driver did.

#![allow(dead_code)]

use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use engine::{RemoteSettings, TransportBackend};
use tempfile::TempDir;

pub const USER: &str = "editor";
pub const PASSWORD: &str = "secret";

struct ServerState {
    root: PathBuf,
    log: Mutex<Vec<String>>,
    reject_mkd: AtomicBool,
}

pub struct MockFtpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    _dir: TempDir,
}

impl MockFtpServer {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create server root");
        let state = Arc::new(ServerState {
            root: dir.path().to_path_buf(),
            log: Mutex::new(Vec::new()),
            reject_mkd: AtomicBool::new(false),
        });
        let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind control socket");
        let addr = listener.local_addr().expect("Failed to read control address");

        let accept_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(_) => break,
                };
                let session_state = Arc::clone(&accept_state);
                thread::spawn(move || {
                    let _ = serve(stream, &session_state);
                });
            }
        });

        MockFtpServer {
            addr,
            state,
            _dir: dir,
        }
    }

    /// Settings that log in successfully with `backend`.
    pub fn settings(&self, backend: TransportBackend) -> RemoteSettings {
        RemoteSettings {
            server_name: self.addr.ip().to_string(),
            port: self.addr.port(),
            remote_directory: "/".to_string(),
            user_name: USER.to_string(),
            password: PASSWORD.to_string(),
            retry_count: 0,
            backend,
            timeout_secs: 5,
        }
    }

    /// Directory on disk the server exposes as `/`.
    pub fn root(&self) -> &Path {
        &self.state.root
    }

    /// Local path of a server path such as `/exports/media/clip.mov`.
    pub fn local(&self, remote: &str) -> PathBuf {
        self.state.root.join(remote.trim_start_matches('/'))
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.log.lock().expect("log poisoned").clone()
    }

    /// Number of commands received with this verb.
    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|line| line.split(' ').next() == Some(verb))
            .count()
    }

    pub fn reject_mkd(&self, reject: bool) {
        self.state.reject_mkd.store(reject, Ordering::SeqCst);
    }
}

fn reply(writer: &mut TcpStream, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}

/// Resolve a command argument against the current directory. Returns the
/// normalized virtual components, or None for paths escaping the root.
fn resolve(cwd: &[String], arg: &str) -> Option<Vec<String>> {
    let mut components: Vec<String> = if arg.starts_with('/') {
        Vec::new()
    } else {
        cwd.to_vec()
    };
    for component in Path::new(arg).components() {
        match component {
            Component::Normal(name) => components.push(name.to_string_lossy().into_owned()),
            Component::ParentDir => {
                components.pop()?;
            }
            _ => {}
        }
    }
    Some(components)
}

fn on_disk(root: &Path, components: &[String]) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in components {
        path.push(component);
    }
    path
}

fn serve(stream: TcpStream, state: &ServerState) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    reply(&mut writer, "220 mock FTP ready")?;

    let mut user: Option<String> = None;
    let mut logged_in = false;
    let mut cwd: Vec<String> = Vec::new();
    let mut passive: Option<TcpListener> = None;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let line = line.trim_end().to_string();
        let (verb, arg) = match line.find(' ') {
            Some(i) => (line[..i].to_uppercase(), line[i + 1..].to_string()),
            None => (line.to_uppercase(), String::new()),
        };
        let logged = if verb == "PASS" {
            "PASS ****".to_string()
        } else {
            format!("{} {}", verb, arg).trim_end().to_string()
        };
        state.log.lock().expect("log poisoned").push(logged);

        match verb.as_str() {
            "USER" => {
                user = Some(arg);
                reply(&mut writer, "331 Password required")?;
            }
            "PASS" => {
                if user.as_deref() == Some(USER) && arg == PASSWORD {
                    logged_in = true;
                    reply(&mut writer, "230 Logged in")?;
                } else {
                    reply(&mut writer, "530 Login incorrect")?;
                }
            }
            "QUIT" => {
                reply(&mut writer, "221 Goodbye")?;
                return Ok(());
            }
            _ if !logged_in => reply(&mut writer, "530 Not logged in")?,
            "TYPE" | "NOOP" => reply(&mut writer, "200 OK")?,
            "PWD" => reply(&mut writer, &format!("257 \"/{}\"", cwd.join("/")))?,
            "CWD" => match resolve(&cwd, &arg) {
                Some(target) if on_disk(&state.root, &target).is_dir() => {
                    cwd = target;
                    reply(&mut writer, "250 Directory changed")?;
                }
                _ => reply(&mut writer, "550 No such directory")?,
            },
            "MKD" => {
                let target = resolve(&cwd, &arg);
                let created = match &target {
                    Some(target) if !state.reject_mkd.load(Ordering::SeqCst) => {
                        fs::create_dir(on_disk(&state.root, target)).is_ok()
                    }
                    _ => false,
                };
                if created {
                    reply(&mut writer, &format!("257 \"{}\" created", arg))?;
                } else {
                    reply(&mut writer, "550 Cannot create directory")?;
                }
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0")?;
                let port = listener.local_addr()?.port();
                passive = Some(listener);
                reply(
                    &mut writer,
                    &format!(
                        "227 Entering Passive Mode (127,0,0,1,{},{}).",
                        port >> 8,
                        port & 0xff
                    ),
                )?;
            }
            "STOR" => {
                let listener = match passive.take() {
                    Some(listener) => listener,
                    None => {
                        reply(&mut writer, "425 Use PASV first")?;
                        continue;
                    }
                };
                let target = match resolve(&cwd, &arg) {
                    Some(target) if !target.is_empty() => on_disk(&state.root, &target),
                    _ => {
                        reply(&mut writer, "553 Bad file name")?;
                        continue;
                    }
                };
                let mut file = match fs::File::create(&target) {
                    Ok(file) => file,
                    Err(_) => {
                        reply(&mut writer, "550 Cannot create file")?;
                        continue;
                    }
                };
                reply(&mut writer, "150 Ready to receive")?;
                let (mut data, _) = listener.accept()?;
                match io::copy(&mut data, &mut file) {
                    Ok(_) => reply(&mut writer, "226 Transfer complete")?,
                    Err(_) => reply(&mut writer, "426 Transfer aborted")?,
                }
            }
            "SIZE" => match resolve(&cwd, &arg).map(|t| on_disk(&state.root, &t)) {
                Some(path) if path.is_file() => {
                    let size = fs::metadata(&path)?.len();
                    reply(&mut writer, &format!("213 {}", size))?;
                }
                _ => reply(&mut writer, "550 No such file")?,
            },
            "DELE" => match resolve(&cwd, &arg).map(|t| on_disk(&state.root, &t)) {
                Some(path) if path.is_file() && fs::remove_file(&path).is_ok() => {
                    reply(&mut writer, "250 Deleted")?
                }
                _ => reply(&mut writer, "550 No such file")?,
            },
            _ => reply(&mut writer, "502 Command not implemented")?,
        }
    }
}
