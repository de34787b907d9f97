use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};
use tiny_http::{Header, Method, Request, Response};

use crate::archive::{unix_millis, ArchiveConfig, ImageArchiver, RecordMeta};
use crate::election::BallotSpec;
use crate::error::{Result, ScanError};
use crate::frame::ScanFrame;
use crate::scanner::{ReferenceImage, ScanConfig, Scanner};

/// Largest accepted submitted image.
const MAX_IMAGE_BYTES: u64 = 10_000_000;

/// Largest accepted reference rendering from the studio service.
const MAX_REFERENCE_BYTES: u64 = 50_000_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0:8080`.
    pub listen: String,
    /// Base URL of the studio service holding bubbles JSON and renderings.
    pub studio_prefix: String,
    /// Path prefix stripped from incoming request URLs.
    pub app_prefix: String,
    pub threads: usize,
    pub scan: ScanConfig,
    /// Archival directory; archival is disabled when absent.
    pub archive_dir: Option<PathBuf>,
}

type HandlerOutcome = std::result::Result<String, (u16, String)>;

/// Receives ballot images over HTTP, scans them against cached reference
/// resources, and answers with per-bubble JSON.
pub struct ScanServer {
    config: ServerConfig,
    bubbles_cache: Mutex<HashMap<i64, Arc<BallotSpec>>>,
    png_cache: Mutex<HashMap<i64, Arc<Vec<u8>>>>,
    archiver: Option<Arc<ImageArchiver>>,
    agent: ureq::Agent,
}

/// Binds the listener and serves requests on `config.threads` workers until
/// the process exits.
pub fn run(config: ServerConfig) -> Result<()> {
    let archiver = match &config.archive_dir {
        Some(dir) => Some(Arc::new(ImageArchiver::new(dir, ArchiveConfig::default())?)),
        None => None,
    };
    if archiver.is_none() {
        info!("image archival disabled");
    }

    let listener = tiny_http::Server::http(&config.listen)
        .map_err(|err| ScanError::Config(format!("bind {}: {err}", config.listen)))?;
    let listener = Arc::new(listener);
    info!("listening on {}", config.listen);

    let server = Arc::new(ScanServer::new(config, archiver));
    let mut workers = Vec::new();
    for index in 0..server.config.threads.max(1) {
        let listener = Arc::clone(&listener);
        let server = Arc::clone(&server);
        workers.push(
            thread::Builder::new()
                .name(format!("scan-worker-{index}"))
                .spawn(move || {
                    for request in listener.incoming_requests() {
                        server.handle(request);
                    }
                })?,
        );
    }
    for worker in workers {
        let _ = worker.join();
    }
    Ok(())
}

impl ScanServer {
    fn new(config: ServerConfig, archiver: Option<Arc<ImageArchiver>>) -> Self {
        Self {
            config,
            bubbles_cache: Mutex::new(HashMap::new()),
            png_cache: Mutex::new(HashMap::new()),
            archiver,
            agent: ureq::agent(),
        }
    }

    fn handle(&self, mut request: Request) {
        let outcome = self.process(&mut request);
        let response = match outcome {
            Ok(body) => Response::from_string(body)
                .with_status_code(200)
                .with_header(content_type("application/json")),
            Err((code, message)) => Response::from_string(message)
                .with_status_code(code)
                .with_header(content_type("text/plain")),
        };
        if let Err(err) = request.respond(response) {
            warn!("response write: {err}");
        }
    }

    fn process(&self, request: &mut Request) -> HandlerOutcome {
        if *request.method() != Method::Post {
            return Err((400, "POST a ballot image".to_string()));
        }
        let election_id = self.election_id_from_url(request.url())?;
        let meta = request_meta(request);
        let image_bytes = read_submitted_image(request)?;
        debug!(
            "election {election_id}: {} byte submission from {}",
            image_bytes.len(),
            meta.remote_addr
        );

        if let Some(archiver) = &self.archiver {
            let archiver = Arc::clone(archiver);
            let bytes = image_bytes.clone();
            rayon::spawn(move || archiver.archive(&bytes, meta));
        }

        let (spec, png) = rayon::join(
            || self.get_bubbles(election_id),
            || self.get_reference_png(election_id),
        );
        let spec = spec.map_err(|err| {
            error!("election {election_id}: bubble lookup: {err}");
            (500, "bubble lookup".to_string())
        })?;
        let png = png.map_err(|err| {
            error!("election {election_id}: reference lookup: {err}");
            (500, "reference lookup".to_string())
        })?;

        let rendering = image::load_from_memory(&png).map_err(|err| {
            error!("election {election_id}: reference decode: {err}");
            (500, "reference decode".to_string())
        })?;
        let reference = ReferenceImage::new(rendering, &spec).map_err(|err| {
            error!("election {election_id}: {err}");
            (500, "reference geometry".to_string())
        })?;

        let frame =
            ScanFrame::from_bytes(&image_bytes).map_err(|_| (400, "bad image".to_string()))?;
        let scanner = Scanner::new(spec, reference, self.config.scan.clone());
        let results = scanner
            .scan(&frame)
            .map_err(|err| (400, err.to_string()))?;
        serde_json::to_string(&results).map_err(|err| {
            error!("election {election_id}: response encode: {err}");
            (500, "response encode".to_string())
        })
    }

    /// Parses `{app_prefix}/scan/{election_id}` out of the request URL.
    fn election_id_from_url(&self, url: &str) -> std::result::Result<i64, (u16, String)> {
        let path = url.split('?').next().unwrap_or(url);
        let path = if self.config.app_prefix.is_empty() {
            path
        } else {
            match path.strip_prefix(self.config.app_prefix.as_str()) {
                Some(rest) => rest,
                None => {
                    error!(
                        "expected path under {} but got {path}, system misconfigured",
                        self.config.app_prefix
                    );
                    return Err((500, "bad path".to_string()));
                }
            }
        };
        let Some(id_text) = path.strip_prefix("/scan/") else {
            error!("expected path under /scan/ but got {path}, system misconfigured");
            return Err((500, "bad path".to_string()));
        };
        id_text
            .parse::<i64>()
            .map_err(|_| (400, "bad election id".to_string()))
    }

    /// Bubble geometry for an election, fetched from the studio service and
    /// cached. The cache lock is never held across the fetch; concurrent
    /// misses both fetch and the last insertion wins.
    fn get_bubbles(&self, election_id: i64) -> Result<Arc<BallotSpec>> {
        if let Some(spec) = lock_cache(&self.bubbles_cache).get(&election_id) {
            return Ok(Arc::clone(spec));
        }
        let url = self.studio_url(&format!("election/{election_id}_bubbles.json"));
        let response = self.fetch(&url, "application/json")?;
        let spec = BallotSpec::from_json_reader(response.into_reader().take(MAX_REFERENCE_BYTES))?;
        let spec = Arc::new(spec);
        lock_cache(&self.bubbles_cache).insert(election_id, Arc::clone(&spec));
        Ok(spec)
    }

    /// Reference rendering bytes for an election, fetched and cached the
    /// same way as the bubble geometry.
    fn get_reference_png(&self, election_id: i64) -> Result<Arc<Vec<u8>>> {
        if let Some(png) = lock_cache(&self.png_cache).get(&election_id) {
            return Ok(Arc::clone(png));
        }
        let url = self.studio_url(&format!("election/{election_id}.png"));
        let response = self.fetch(&url, "image/png")?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .take(MAX_REFERENCE_BYTES)
            .read_to_end(&mut bytes)?;
        let bytes = Arc::new(bytes);
        lock_cache(&self.png_cache).insert(election_id, Arc::clone(&bytes));
        Ok(bytes)
    }

    fn fetch(&self, url: &str, expected_type: &str) -> Result<ureq::Response> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|err| io_other(format!("GET {url}: {err}")))?;
        if response.content_type() != expected_type {
            return Err(ScanError::InputDecode(format!(
                "GET {url}: content type {:?}, wanted {expected_type:?}",
                response.content_type()
            )));
        }
        Ok(response)
    }

    fn studio_url(&self, suffix: &str) -> String {
        format!(
            "{}/{suffix}",
            self.config.studio_prefix.trim_end_matches('/')
        )
    }
}

fn lock_cache<K, V>(cache: &Mutex<HashMap<K, V>>) -> std::sync::MutexGuard<'_, HashMap<K, V>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn io_other(message: String) -> ScanError {
    ScanError::Io(std::io::Error::new(std::io::ErrorKind::Other, message))
}

fn content_type(value: &str) -> Header {
    Header::from_bytes(&b"Content-Type"[..], value.as_bytes()).expect("static header")
}

fn request_meta(request: &Request) -> RecordMeta {
    let mut headers = BTreeMap::new();
    for header in request.headers() {
        headers.insert(header.field.to_string(), header.value.to_string());
    }
    let remote_addr = request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    RecordMeta {
        headers,
        remote_addr,
        timestamp_ms: unix_millis(),
    }
}

fn header_value(request: &Request, name: &'static str) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv(name))
        .map(|h| h.value.to_string())
}

/// Pulls the submitted image out of the request body: either a bare
/// `image/*` body or the first `image/*` part of a `multipart/*` body.
fn read_submitted_image(request: &mut Request) -> std::result::Result<Vec<u8>, (u16, String)> {
    let content_type = header_value(request, "Content-Type").unwrap_or_default();
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_IMAGE_BYTES + 1)
        .read_to_end(&mut body)
        .map_err(|_| (400, "unreadable body".to_string()))?;
    if body.len() as u64 > MAX_IMAGE_BYTES {
        return Err((400, "image too large".to_string()));
    }

    if content_type.starts_with("image/") {
        return Ok(body);
    }
    if content_type.starts_with("multipart/") {
        let boundary =
            boundary_param(&content_type).ok_or((400, "bad multipart".to_string()))?;
        return first_image_part(body, &boundary);
    }
    Err((400, "no image part".to_string()))
}

fn first_image_part(
    body: Vec<u8>,
    boundary: &str,
) -> std::result::Result<Vec<u8>, (u16, String)> {
    let mut multipart = multipart::server::Multipart::with_body(Cursor::new(body), boundary);
    loop {
        match multipart.read_entry() {
            Ok(Some(mut field)) => {
                let is_image = field
                    .headers
                    .content_type
                    .as_ref()
                    .map_or(false, |mime| mime.type_().as_str() == "image");
                if !is_image {
                    continue;
                }
                let mut bytes = Vec::new();
                field
                    .data
                    .read_to_end(&mut bytes)
                    .map_err(|_| (400, "bad multipart".to_string()))?;
                return Ok(bytes);
            }
            Ok(None) => return Err((400, "no image part".to_string())),
            Err(_) => return Err((400, "bad multipart".to_string())),
        }
    }
}

/// Extracts the `boundary` parameter from a multipart content type.
fn boundary_param(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        let mut parts = param.trim().splitn(2, '=');
        if parts.next()?.eq_ignore_ascii_case("boundary") {
            let value = parts.next()?.trim().trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}
