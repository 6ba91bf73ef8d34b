//! Fixtures shared by the engine's unit tests: a loopback HTTP server that
//! understands `Range: bytes=<offset>-`, temp directories and in-memory ZIPs.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use uuid::Uuid;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Clone)]
pub struct Route {
    pub status: u16,
    pub body: Vec<u8>,
    pub honor_range: bool,
    /// Per-response pause, to keep a transfer in flight during a test.
    pub delay: Option<Duration>,
    /// Body written `chunk` bytes at a time with a pause after each.
    pub pace: Option<(usize, Duration)>,
}

impl Route {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            body,
            honor_range: true,
            delay: None,
            pace: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            honor_range: false,
            delay: None,
            pace: None,
        }
    }

    pub fn ignoring_range(mut self) -> Self {
        self.honor_range = false;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn trickled(mut self, chunk: usize, pause: Duration) -> Self {
        self.pace = Some((chunk.max(1), pause));
        self
    }
}

#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub path: String,
    pub range: Option<String>,
}

#[derive(Clone)]
pub struct FixtureServer {
    pub base_url: String,
    routes: Arc<Mutex<HashMap<String, Route>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl FixtureServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind fixture server");
        let port = listener.local_addr().expect("local addr").port();
        let server = Self {
            base_url: format!("http://127.0.0.1:{port}"),
            routes: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let routes = server.routes.clone();
        let requests = server.requests.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let routes = routes.clone();
                let requests = requests.clone();
                thread::spawn(move || {
                    let _ = handle_connection(stream, &routes, &requests);
                });
            }
        });
        server
    }

    pub fn route(&self, path: &str, route: Route) {
        self.routes
            .lock()
            .expect("routes lock")
            .insert(path.to_string(), route);
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn handle_connection(
    mut stream: TcpStream,
    routes: &Arc<Mutex<HashMap<String, Route>>>,
    requests: &Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    if reader.read_line(&mut request_line)? == 0 {
        return Ok(());
    }
    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/")
        .to_string();
    requests.lock().expect("requests lock").push(RecordedRequest {
        path: path.clone(),
        range: range.clone(),
    });

    let route = routes.lock().expect("routes lock").get(&path).cloned();
    let Some(route) = route else {
        return write_response(&mut stream, 404, "Not Found", b"", None, None);
    };
    if let Some(delay) = route.delay {
        thread::sleep(delay);
    }
    if route.status != 200 {
        return write_response(&mut stream, route.status, "Error", &route.body, None, None);
    }

    let offset = range
        .as_deref()
        .filter(|_| route.honor_range)
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.trim_end_matches('-').parse::<usize>().ok());
    match offset {
        Some(offset) if offset <= route.body.len() => {
            let total = route.body.len();
            let content_range = format!(
                "bytes {}-{}/{}",
                offset,
                total.saturating_sub(1),
                total
            );
            write_response(
                &mut stream,
                206,
                "Partial Content",
                &route.body[offset..],
                Some(content_range),
                route.pace,
            )
        }
        _ => write_response(&mut stream, 200, "OK", &route.body, None, route.pace),
    }
}

fn write_response(
    stream: &mut TcpStream,
    code: u16,
    status: &str,
    body: &[u8],
    content_range: Option<String>,
    pace: Option<(usize, Duration)>,
) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {code} {status}\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n",
        body.len()
    );
    if let Some(value) = content_range {
        head.push_str(&format!("Content-Range: {value}\r\n"));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes())?;
    match pace {
        Some((chunk, pause)) => {
            for part in body.chunks(chunk) {
                stream.write_all(part)?;
                stream.flush()?;
                thread::sleep(pause);
            }
        }
        None => stream.write_all(body)?,
    }
    stream.flush()
}

pub fn temp_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pintuxx-{label}-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp directory");
    dir
}

/// Builds a deflated ZIP holding `files` (name, contents).
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, contents) in files {
        writer.start_file(*name, options).expect("start zip entry");
        writer.write_all(contents).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}
