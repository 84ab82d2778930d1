//! Scripted in-process FTP server for integration tests.
//!
//! Serves a fixed directory tree over PASV, records every command it
//! receives, and notes whether a client ever sent a command before the
//! previous reply was written.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

pub const README: &[u8] = b"hello world";
pub const BIG_LEN: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct ServerScript {
    pub welcome: String,
    pub password: String,
    pub feat: bool,
    pub home: String,
    pub dirs: HashMap<String, String>,
    pub files: HashMap<String, Vec<u8>>,
}

impl Default for ServerScript {
    fn default() -> Self {
        let mut dirs = HashMap::new();
        dirs.insert(
            "/".to_string(),
            "drwxr-xr-x 2 ftp ftp 4096 Jan  1  2024 pub\r\n".to_string(),
        );
        dirs.insert(
            "/pub/".to_string(),
            [
                "total 5",
                "-rw-r--r-- 1 ftp ftp       11 Jan  1  2024 readme.txt",
                "-rw-r--r-- 1 ftp ftp        5 Jan  1  2024 B.txt",
                "drwxr-xr-x 2 ftp ftp     4096 Jan  1  2024 docs",
                "lrwxrwxrwx 1 ftp ftp       10 Jan  1  2024 latest -> readme.txt",
                "-rw-r--r-- 1 ftp ftp  4194304 Jan  1  2024 big.bin",
                "",
            ]
            .join("\r\n"),
        );
        dirs.insert(
            "/pub/docs/".to_string(),
            "-rw-r--r-- 1 ftp ftp 3 Feb  2  2024 a.md\r\n".to_string(),
        );

        let mut files = HashMap::new();
        files.insert("/pub/readme.txt".to_string(), README.to_vec());
        files.insert("/pub/B.txt".to_string(), b"bbbbb".to_vec());
        files.insert("/pub/big.bin".to_string(), vec![0x5a; BIG_LEN]);

        Self {
            welcome: "220 mock FTP ready".into(),
            password: "pw".into(),
            feat: true,
            home: "/".into(),
            dirs,
            files,
        }
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    log: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    pipelined: Arc<AtomicBool>,
}

impl MockServer {
    pub async fn start(script: ServerScript) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let pipelined = Arc::new(AtomicBool::new(false));

        let (l, c, p) = (log.clone(), connections.clone(), pipelined.clone());
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                c.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, script.clone(), l.clone(), p.clone()));
            }
        });

        Self {
            addr,
            log,
            connections,
            pipelined,
        }
    }

    /// `ftp://anon:pw@<addr><path>`
    pub fn url(&self, path: &str) -> Url {
        self.url_as("anon:pw", path)
    }

    pub fn url_as(&self, userinfo: &str, path: &str) -> Url {
        Url::parse(&format!("ftp://{}@{}{}", userinfo, self.addr, path)).unwrap()
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn saw_pipelining(&self) -> bool {
        self.pipelined.load(Ordering::SeqCst)
    }
}

fn dir_key(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{}/", trimmed)
    }
}

async fn reply(ctl: &mut BufReader<TcpStream>, text: &str) -> io::Result<()> {
    ctl.get_mut()
        .write_all(format!("{}\r\n", text).as_bytes())
        .await
}

async fn transfer(
    ctl: &mut BufReader<TcpStream>,
    listener: TcpListener,
    payload: &[u8],
) -> io::Result<()> {
    reply(ctl, "150 Opening data connection").await?;
    let (mut data, _) = listener.accept().await?;
    let outcome = async {
        data.write_all(payload).await?;
        data.shutdown().await
    }
    .await;
    drop(data);
    match outcome {
        Ok(()) => reply(ctl, "226 Transfer complete").await,
        Err(_) => reply(ctl, "426 Connection closed; transfer aborted").await,
    }
}

async fn serve(
    stream: TcpStream,
    script: ServerScript,
    log: Arc<Mutex<Vec<String>>>,
    pipelined: Arc<AtomicBool>,
) {
    let mut ctl = BufReader::new(stream);
    if reply(&mut ctl, &script.welcome).await.is_err() || !script.welcome.starts_with("220") {
        return;
    }

    let mut cwd = dir_key(&script.home);
    let mut pasv: Option<TcpListener> = None;

    loop {
        let mut line = String::new();
        match ctl.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let line = line.trim_end().to_string();
        log.lock().unwrap().push(line.clone());

        // Anything already queued behind this command means the client did
        // not wait for the reply.
        let mut peeked = [0u8; 1];
        let queued = !ctl.buffer().is_empty()
            || matches!(
                tokio::time::timeout(Duration::from_millis(5), ctl.get_ref().peek(&mut peeked)).await,
                Ok(Ok(n)) if n > 0
            );
        if queued {
            pipelined.store(true, Ordering::SeqCst);
        }

        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };

        let res = match verb.as_str() {
            "USER" => reply(&mut ctl, "331 Password required").await,
            "PASS" if arg == script.password => reply(&mut ctl, "230 Logged in").await,
            "PASS" => reply(&mut ctl, "530 Login incorrect").await,
            "FEAT" if script.feat => {
                reply(&mut ctl, "211-Features:\r\n MDTM\r\n SIZE\r\n UTF8\r\n211 End").await
            }
            "FEAT" => reply(&mut ctl, "502 Command not implemented").await,
            "TYPE" => reply(&mut ctl, "200 Type set").await,
            "PWD" => {
                let shown = if cwd == "/" { "/" } else { cwd.trim_end_matches('/') };
                reply(&mut ctl, &format!("257 \"{}\" is the current directory", shown)).await
            }
            "CWD" => {
                let dir = dir_key(&arg);
                if script.dirs.contains_key(&dir) {
                    cwd = dir;
                    reply(&mut ctl, "250 Directory successfully changed").await
                } else {
                    reply(&mut ctl, "550 Failed to change directory").await
                }
            }
            "PASV" => match TcpListener::bind("127.0.0.1:0").await {
                Ok(listener) => {
                    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                    pasv = Some(listener);
                    reply(
                        &mut ctl,
                        &format!(
                            "227 Entering Passive Mode (127,0,0,1,{},{}).",
                            port / 256,
                            port % 256
                        ),
                    )
                    .await
                }
                Err(_) => reply(&mut ctl, "425 Can't open passive listener").await,
            },
            "LIST" => {
                let dir = if arg.is_empty() { cwd.clone() } else { dir_key(&arg) };
                match (script.dirs.get(&dir), pasv.take()) {
                    (Some(body), Some(listener)) => {
                        transfer(&mut ctl, listener, body.as_bytes()).await
                    }
                    (None, _) => reply(&mut ctl, "550 No such directory").await,
                    (_, None) => reply(&mut ctl, "425 Use PASV first").await,
                }
            }
            "RETR" => {
                let path = if arg.starts_with('/') {
                    arg.clone()
                } else {
                    format!("{}{}", cwd, arg)
                };
                match (script.files.get(&path), pasv.take()) {
                    (Some(body), Some(listener)) => transfer(&mut ctl, listener, body).await,
                    (None, _) => reply(&mut ctl, "550 No such file").await,
                    (_, None) => reply(&mut ctl, "425 Use PASV first").await,
                }
            }
            "QUIT" => {
                let _ = reply(&mut ctl, "221 Goodbye").await;
                return;
            }
            _ => reply(&mut ctl, "502 Command not implemented").await,
        };
        if res.is_err() {
            return;
        }
    }
}
