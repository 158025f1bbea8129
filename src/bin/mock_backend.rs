//! Mock detection backend
//!
//! Local stand-in for the backend HTTP API, for bench testing the delivery
//! path without a server.
//!
//! Endpoints:
//! - POST /api/auth/login             {username, password} -> token grant
//! - POST /api/auth/refresh           {refresh_token} -> token grant (refresh tokens are single use)
//! - POST /api/detections             event JSON -> 201 {id}, 409 on a repeated id
//! - POST /api/detections/{id}/image  raw bytes -> 201
//! - GET  /api/health                 -> 200
//!
//! Fault injection:
//! - `--fail-every N`    every Nth upload answers 503
//! - `--expire-every N`  every Nth upload answers 401 and revokes the token
//!
//! Usage:
//!   cargo run --bin mock_backend -- --port 8080 --username device --password secret

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "mock_backend")]
#[command(about = "Mock pothole detection backend for local testing")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Accepted device username
    #[arg(long, default_value = "device")]
    username: String,

    /// Accepted device password
    #[arg(long, default_value = "secret")]
    password: String,

    /// Access token lifetime (seconds)
    #[arg(long, default_value = "300")]
    token_ttl_secs: u64,

    /// Answer 503 on every Nth upload (0 disables)
    #[arg(long, default_value = "0")]
    fail_every: u64,

    /// Answer 401 and revoke the token on every Nth upload (0 disables)
    #[arg(long, default_value = "0")]
    expire_every: u64,
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Deserialize)]
struct RefreshRequest {
    refresh_token: String,
}

#[derive(Deserialize)]
struct DetectionRequest {
    id: Uuid,
    #[serde(default)]
    device_id: String,
    confidence: f64,
    #[serde(default)]
    corroboration: Vec<String>,
}

#[derive(Default)]
struct BackendState {
    /// access token -> expiry
    access: FxHashMap<String, Instant>,
    refresh: FxHashSet<String>,
    detections: FxHashSet<Uuid>,
    images: FxHashSet<Uuid>,
}

struct MockBackend {
    args: Args,
    state: Mutex<BackendState>,
    uploads: AtomicU64,
}

type HttpResponse = Response<Full<Bytes>>;

fn respond(status: StatusCode, body: String) -> HttpResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("static response should not fail")
}

fn error(status: StatusCode, message: &str) -> HttpResponse {
    respond(status, format!(r#"{{"error":"{}"}}"#, message))
}

impl MockBackend {
    fn grant(&self) -> HttpResponse {
        let access = format!("at-{}", Uuid::now_v7().simple());
        let refresh = format!("rt-{}", Uuid::now_v7().simple());
        {
            let mut state = self.state.lock();
            let expiry = Instant::now() + Duration::from_secs(self.args.token_ttl_secs);
            state.access.insert(access.clone(), expiry);
            state.refresh.insert(refresh.clone());
        }
        respond(
            StatusCode::OK,
            serde_json::json!({
                "access_token": access,
                "refresh_token": refresh,
                "expires_in": self.args.token_ttl_secs,
            })
            .to_string(),
        )
    }

    fn authorized(&self, req: &Request<hyper::body::Incoming>) -> Option<String> {
        let token = req
            .headers()
            .get(hyper::header::AUTHORIZATION)?
            .to_str()
            .ok()?
            .strip_prefix("Bearer ")?
            .to_string();
        let state = self.state.lock();
        let expiry = state.access.get(&token)?;
        (Instant::now() < *expiry).then_some(token)
    }

    /// Fault injection shared by both upload endpoints
    fn injected_fault(&self, token: &str) -> Option<HttpResponse> {
        let n = self.uploads.fetch_add(1, Ordering::Relaxed) + 1;
        if self.args.expire_every > 0 && n % self.args.expire_every == 0 {
            self.state.lock().access.remove(token);
            println!("[MOCK] upload #{} -> 401 (token revoked)", n);
            return Some(error(StatusCode::UNAUTHORIZED, "token_expired"));
        }
        if self.args.fail_every > 0 && n % self.args.fail_every == 0 {
            println!("[MOCK] upload #{} -> 503", n);
            return Some(error(StatusCode::SERVICE_UNAVAILABLE, "try_later"));
        }
        None
    }

    async fn handle(self: Arc<Self>, req: Request<hyper::body::Incoming>) -> HttpResponse {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let token = self.authorized(&req);

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(_) => return error(StatusCode::BAD_REQUEST, "unreadable_body"),
        };

        match (method, path.as_str()) {
            (Method::POST, "/api/auth/login") => {
                let Ok(login) = serde_json::from_slice::<LoginRequest>(&body) else {
                    return error(StatusCode::BAD_REQUEST, "invalid_json");
                };
                if login.username != self.args.username || login.password != self.args.password {
                    println!("[MOCK] login rejected for {}", login.username);
                    return error(StatusCode::UNAUTHORIZED, "bad_credentials");
                }
                println!("[MOCK] login ok for {}", login.username);
                self.grant()
            }
            (Method::POST, "/api/auth/refresh") => {
                let Ok(refresh) = serde_json::from_slice::<RefreshRequest>(&body) else {
                    return error(StatusCode::BAD_REQUEST, "invalid_json");
                };
                if !self.state.lock().refresh.remove(&refresh.refresh_token) {
                    println!("[MOCK] refresh rejected (unknown or reused token)");
                    return error(StatusCode::UNAUTHORIZED, "invalid_refresh_token");
                }
                println!("[MOCK] refresh ok");
                self.grant()
            }
            (Method::GET, "/api/health") => match token {
                Some(_) => respond(StatusCode::OK, r#"{"status":"ok"}"#.to_string()),
                None => error(StatusCode::UNAUTHORIZED, "unauthorized"),
            },
            (Method::POST, "/api/detections") => {
                let Some(token) = token else {
                    return error(StatusCode::UNAUTHORIZED, "unauthorized");
                };
                if let Some(fault) = self.injected_fault(&token) {
                    return fault;
                }
                let Ok(detection) = serde_json::from_slice::<DetectionRequest>(&body) else {
                    return error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_detection");
                };
                if !self.state.lock().detections.insert(detection.id) {
                    println!("[MOCK] detection {} already stored -> 409", detection.id);
                    return error(StatusCode::CONFLICT, "duplicate");
                }
                println!(
                    "[MOCK] detection {} from {} confidence={:.2} corroboration={:?}",
                    detection.id, detection.device_id, detection.confidence, detection.corroboration
                );
                respond(StatusCode::CREATED, format!(r#"{{"id":"{}"}}"#, detection.id))
            }
            (Method::POST, p) if p.starts_with("/api/detections/") && p.ends_with("/image") => {
                let Some(token) = token else {
                    return error(StatusCode::UNAUTHORIZED, "unauthorized");
                };
                let raw_id = &p["/api/detections/".len()..p.len() - "/image".len()];
                let Ok(id) = raw_id.parse::<Uuid>() else {
                    return error(StatusCode::NOT_FOUND, "unknown_detection");
                };
                if !self.state.lock().detections.contains(&id) {
                    return error(StatusCode::NOT_FOUND, "unknown_detection");
                }
                if let Some(fault) = self.injected_fault(&token) {
                    return fault;
                }
                self.state.lock().images.insert(id);
                println!("[MOCK] image for {} ({} bytes)", id, body.len());
                respond(StatusCode::CREATED, format!(r#"{{"id":"{}"}}"#, id))
            }
            _ => error(StatusCode::NOT_FOUND, "not_found"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Mock backend");
    println!("  port:          {}", args.port);
    println!("  username:      {}", args.username);
    println!("  token ttl:     {} s", args.token_ttl_secs);
    println!("  fail every:    {}", args.fail_every);
    println!("  expire every:  {}", args.expire_every);
    println!();

    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let backend = Arc::new(MockBackend {
        args,
        state: Mutex::new(BackendState::default()),
        uploads: AtomicU64::new(0),
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        let backend = backend.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let backend = backend.clone();
                async move { Ok::<_, Infallible>(backend.handle(req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await
            {
                eprintln!("[MOCK] connection from {} failed: {}", peer, e);
            }
        });
    }
}
