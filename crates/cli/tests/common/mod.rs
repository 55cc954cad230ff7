//! Common utilities for integration tests

#![allow(dead_code)]

use axum::response::Response;
use axum::Router;
use espota_cli::config::ServerConfig;
use espota_cli::server::conn;
use espota_cli::{router, AppState};
use espota_core::{
    AssignmentStore, AuditSink, ContentDigest, DeviceIdentity, FileSystemStore, HeaderNames,
    ImageCheck, IMAGE_MAGIC,
};
use espota_journal::FileJournal;
use hyper::{Body, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tower::ServiceExt;

pub const DEVICE: &str = "18:FE:AA:AA:AA:AA";
pub const MAC_HEADER: &str = "x-ESP8266-STA-MAC";
pub const MD5_HEADER: &str = "x-ESP8266-sketch-md5";

/// Server over a fresh data root, listening on a loopback port
pub struct TestServer {
    pub dir: TempDir,
    pub store: Arc<FileSystemStore>,
    pub journal: Arc<FileJournal>,
    pub app: Router,
    pub addr: SocketAddr,
}

impl TestServer {
    pub async fn new(image_check: ImageCheck) -> Self {
        let dir = TempDir::new().unwrap();
        let store = FileSystemStore::open(dir.path()).unwrap().with_image_check(image_check);
        let store = Arc::new(store);
        let journal = Arc::new(FileJournal::open(store.root()).unwrap());

        let state = AppState::new(
            store.clone() as Arc<dyn AssignmentStore>,
            journal.clone() as Arc<dyn AuditSink>,
            HeaderNames::default(),
        );
        let config = ServerConfig::default();
        let app = router(state.clone(), &config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let served = app.clone();
        tokio::spawn(async move {
            conn::run(listener, served, state, &config.checkin_path, std::future::pending()).await
        });

        Self {
            dir,
            store,
            journal,
            app,
            addr,
        }
    }

    /// firmware-v1 / a.bin = "foobar", 18:FE:AA:AA:AA:AA assigned
    pub async fn foobar() -> Self {
        let server = Self::new(ImageCheck::Disabled).await;
        server.store.create_application("firmware-v1").unwrap();
        server.store.upload_binary("firmware-v1", "a.bin", b"foobar").unwrap();
        server.store.set_active_binary("firmware-v1", "a.bin").unwrap();
        server
            .store
            .set_device_application(&device(), "firmware-v1")
            .unwrap();
        server
    }

    /// Write `request` to a fresh connection and read until the server closes it
    pub async fn exchange(&self, request: &[u8]) -> WireResponse {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        WireResponse::parse(raw)
    }

    pub async fn get(&self, path: &str, headers: &[(&str, &str)]) -> WireResponse {
        let mut request = format!("GET {path} HTTP/1.1\r\nHost: espota\r\n");
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        self.exchange(request.as_bytes()).await
    }

    pub async fn checkin(&self, mac: &str, claimed: &str) -> WireResponse {
        self.get("/get", &[(MAC_HEADER, mac), (MD5_HEADER, claimed)]).await
    }

    /// Through the router only
    pub async fn send(&self, request: Request<Body>) -> Response {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn get_json(&self, uri: &str) -> (u16, serde_json::Value) {
        let response = self.send(Request::get(uri).body(Body::empty()).unwrap()).await;
        let status = response.status().as_u16();
        (status, json_body(response).await)
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = self.send(request).await;
        let status = response.status().as_u16();
        (status, json_body(response).await)
    }
}

/// A response as it came off the socket
pub struct WireResponse {
    pub status: u16,
    /// Status line and header lines, untouched
    pub head: String,
    pub body: Vec<u8>,
}

impl WireResponse {
    fn parse(raw: Vec<u8>) -> Self {
        let end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response without a complete head");
        let head = String::from_utf8(raw[..end].to_vec()).unwrap();
        let status = head.split(' ').nth(1).unwrap().parse().unwrap();
        Self {
            status,
            head,
            body: raw[end + 4..].to_vec(),
        }
    }

    /// Header value, matching the name case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub fn device() -> DeviceIdentity {
    DeviceIdentity::parse(DEVICE).unwrap()
}

pub fn md5_hex(data: &[u8]) -> String {
    ContentDigest::of(data).to_hex()
}

/// A binary that passes the magic check
pub fn firmware(payload: &[u8]) -> Vec<u8> {
    let mut image = IMAGE_MAGIC.to_vec();
    image.extend_from_slice(payload);
    image
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    hyper::body::to_bytes(response.into_body()).await.unwrap().to_vec()
}

pub async fn json_body(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Wait until the journal has `count` records; audit runs off the response path
pub async fn wait_for_requests(journal: &FileJournal, count: u64) {
    for _ in 0..200 {
        if journal.appended() >= count {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("journal never reached {} records", count);
}
