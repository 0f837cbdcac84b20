//! Every capture runs in its own WebDriver session, deleted once the page is done
//! or has timed out.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, ImageFormat};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use url::Url;

use super::config::{Browser, ScreenshotSettings};
use super::error::ScreenshotError;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DRIVER_START_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_CLEANUP_TIMEOUT: Duration = Duration::from_secs(5);
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Public web paths of a stored screenshot pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenshotPaths {
    pub full: String,
    pub thumbnail: String,
}

#[async_trait]
pub trait Screenshotter: Send + Sync {
    async fn capture(&self, url: &str, file_name: &str) -> Result<ScreenshotPaths, ScreenshotError>;
}

/// Used when screenshots are switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledScreenshotter;

#[async_trait]
impl Screenshotter for DisabledScreenshotter {
    async fn capture(&self, _url: &str, _file_name: &str) -> Result<ScreenshotPaths, ScreenshotError> {
        Err(ScreenshotError::Disabled)
    }
}

/// Writes the full image and its thumbnail into the evidence directory.
#[derive(Debug, Clone)]
pub struct EvidenceImageWriter {
    dir: PathBuf,
    public_prefix: String,
    thumbnail_width: u32,
    thumbnail_height: u32,
}

impl EvidenceImageWriter {
    pub fn new(dir: impl Into<PathBuf>, settings: &ScreenshotSettings) -> Self {
        Self {
            dir: dir.into(),
            public_prefix: settings.public_prefix.trim_end_matches('/').to_string(),
            thumbnail_width: settings.thumbnail_width,
            thumbnail_height: settings.thumbnail_height,
        }
    }

    /// Re-encodes `raw` into the format implied by `file_name` and stores it next to
    /// a `thumb-` prefixed thumbnail.
    pub fn save(&self, raw: &[u8], file_name: &str) -> Result<ScreenshotPaths, ScreenshotError> {
        let img = image::load_from_memory(raw)?;
        let format = ImageFormat::from_path(file_name).unwrap_or(ImageFormat::Jpeg);
        let thumb_name = format!("thumb-{file_name}");

        let full = encode(&img, format)?;
        let thumb = encode(
            &make_thumbnail(&img, self.thumbnail_width, self.thumbnail_height),
            format,
        )?;

        fs::create_dir_all(&self.dir).map_err(|source| ScreenshotError::Io {
            path: self.dir.clone(),
            source,
        })?;
        write_file(&self.dir.join(file_name), &full)?;
        write_file(&self.dir.join(&thumb_name), &thumb)?;

        Ok(ScreenshotPaths {
            full: format!("{}/{}", self.public_prefix, file_name),
            thumbnail: format!("{}/{}", self.public_prefix, thumb_name),
        })
    }
}

/// Fits `img` inside `width` x `height` keeping its aspect ratio.
pub fn make_thumbnail(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    img.thumbnail(width, height)
}

fn encode(img: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, ScreenshotError> {
    // JPEG has no alpha channel.
    let img = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img.clone(),
    };
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)?;
    Ok(buf.into_inner())
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ScreenshotError> {
    fs::write(path, bytes).map_err(|source| ScreenshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub struct WebDriverScreenshotter {
    client: reqwest::Client,
    endpoint: String,
    settings: ScreenshotSettings,
    writer: EvidenceImageWriter,
    render_timeout: Duration,
}

impl WebDriverScreenshotter {
    pub fn new(settings: &ScreenshotSettings, evidence_dir: &Path) -> Result<Self, ScreenshotError> {
        let client = reqwest::Client::builder()
            .timeout(settings.page_timeout() + Duration::from_secs(10))
            .build()
            .map_err(|e| ScreenshotError::WebDriver(format!("http client build failed: {e}")))?;
        Ok(Self {
            client,
            endpoint: normalize_local_webdriver_endpoint(&settings.webdriver_url),
            settings: settings.clone(),
            writer: EvidenceImageWriter::new(evidence_dir, settings),
            render_timeout: settings.page_timeout()
                + Duration::from_millis(settings.settle_ms)
                + Duration::from_secs(15),
        })
    }

    fn base(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    async fn render(&self, url: &str) -> Result<Vec<u8>, ScreenshotError> {
        let session_id = self.create_session().await?;
        let result =
            tokio::time::timeout(self.render_timeout, self.render_in_session(&session_id, url))
                .await
                .unwrap_or_else(|_| Err(ScreenshotError::Timeout(self.render_timeout)));

        match tokio::time::timeout(SESSION_CLEANUP_TIMEOUT, self.delete_session(&session_id)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(session = %session_id, error = %e, "session cleanup failed"),
            Err(_) => warn!(session = %session_id, "session cleanup timed out"),
        }
        result
    }

    async fn render_in_session(&self, session_id: &str, url: &str) -> Result<Vec<u8>, ScreenshotError> {
        self.navigate(session_id, url).await?;
        self.wait_until_ready(session_id).await?;
        tokio::time::sleep(Duration::from_millis(self.settings.settle_ms)).await;

        let value = self
            .command(
                reqwest::Method::GET,
                &format!("/session/{session_id}/screenshot"),
                None,
            )
            .await?;
        let encoded = value
            .pointer("/value")
            .and_then(Value::as_str)
            .ok_or_else(|| ScreenshotError::Decode("screenshot payload missing".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ScreenshotError::Decode(e.to_string()))
    }

    async fn create_session(&self) -> Result<String, ScreenshotError> {
        let caps = webdriver_capabilities(&self.settings);
        let value = self
            .command(reqwest::Method::POST, "/session", Some(caps))
            .await?;
        value
            .pointer("/value/sessionId")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/sessionId").and_then(Value::as_str))
            .map(str::to_string)
            .ok_or_else(|| {
                ScreenshotError::WebDriver(format!(
                    "session id missing in response: {}",
                    truncate_for_log(&value.to_string(), 220)
                ))
            })
    }

    async fn navigate(&self, session_id: &str, url: &str) -> Result<(), ScreenshotError> {
        self.command(
            reqwest::Method::POST,
            &format!("/session/{session_id}/url"),
            Some(json!({ "url": url })),
        )
        .await
        .map(|_| ())
    }

    async fn wait_until_ready(&self, session_id: &str) -> Result<(), ScreenshotError> {
        let deadline = tokio::time::Instant::now() + self.settings.page_timeout();
        let script = json!({ "script": "return document.readyState;", "args": [] });
        loop {
            let value = self
                .command(
                    reqwest::Method::POST,
                    &format!("/session/{session_id}/execute/sync"),
                    Some(script.clone()),
                )
                .await?;
            if value.pointer("/value").and_then(Value::as_str) == Some("complete") {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ScreenshotError::Timeout(self.settings.page_timeout()));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ScreenshotError> {
        self.command(reqwest::Method::DELETE, &format!("/session/{session_id}"), None)
            .await
            .map(|_| ())
    }

    /// Sends one WebDriver command and unwraps the protocol's error envelope.
    async fn command(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ScreenshotError> {
        let endpoint = format!("{}{path}", self.base());
        let mut req = self.client.request(method, &endpoint);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req
            .send()
            .await
            .map_err(|e| ScreenshotError::WebDriver(format!("{path} request failed: {e}")))?;
        let status = res.status();
        let text = res
            .text()
            .await
            .map_err(|e| ScreenshotError::WebDriver(format!("{path} response read failed: {e}")))?;

        let value: Value = serde_json::from_str(&text).unwrap_or_default();
        if let Some(err) = value.pointer("/value/error").and_then(Value::as_str) {
            let message = value
                .pointer("/value/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown webdriver error");
            return Err(ScreenshotError::WebDriver(format!(
                "{err}: {}",
                truncate_for_log(message, 240)
            )));
        }
        if !status.is_success() {
            return Err(ScreenshotError::WebDriver(format!(
                "{path} HTTP {}: {}",
                status.as_u16(),
                truncate_for_log(&text, 240)
            )));
        }
        Ok(value)
    }
}

#[async_trait]
impl Screenshotter for WebDriverScreenshotter {
    async fn capture(&self, url: &str, file_name: &str) -> Result<ScreenshotPaths, ScreenshotError> {
        let raw = self.render(url).await?;
        let paths = self.writer.save(&raw, file_name)?;
        info!(url, path = %paths.full, "screenshot captured");
        Ok(paths)
    }
}

fn webdriver_capabilities(settings: &ScreenshotSettings) -> Value {
    let (width, height) = (settings.viewport_width, settings.viewport_height);
    let page_load_ms = settings.page_timeout_secs.saturating_mul(1000);
    match settings.browser {
        Browser::Firefox => json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "firefox",
                    "acceptInsecureCerts": true,
                    "timeouts": { "pageLoad": page_load_ms },
                    "moz:firefoxOptions": {
                        "args": ["-headless", format!("--width={width}"), format!("--height={height}")]
                    }
                }
            }
        }),
        Browser::Chrome => {
            let mut args = vec![
                "--headless=new".to_string(),
                format!("--window-size={width},{height}"),
                "--disable-gpu".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--no-first-run".to_string(),
                "--no-default-browser-check".to_string(),
                "--hide-scrollbars".to_string(),
            ];
            if !cfg!(target_os = "macos") {
                args.push("--no-sandbox".to_string());
            }
            json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "acceptInsecureCerts": true,
                        "timeouts": { "pageLoad": page_load_ms },
                        "goog:chromeOptions": { "args": args }
                    }
                }
            })
        }
    }
}

fn truncate_for_log(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "..."
}

fn normalize_local_webdriver_endpoint(endpoint: &str) -> String {
    let Ok(url) = Url::parse(endpoint) else {
        return endpoint.to_string();
    };
    let Some(host) = url.host_str() else {
        return endpoint.to_string();
    };
    if host != "localhost" && host != "127.0.0.1" {
        return endpoint.to_string();
    }
    let scheme = url.scheme();
    let port = url.port_or_known_default().unwrap_or(4444);
    format!("{scheme}://127.0.0.1:{port}")
}

async fn webdriver_reachable(endpoint: &str) -> bool {
    let Ok(parsed) = Url::parse(endpoint) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let port = parsed.port_or_known_default().unwrap_or(4444);
    matches!(
        tokio::time::timeout(REACHABILITY_TIMEOUT, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

/// A WebDriver process this run started. It is killed when dropped.
pub struct ManagedDriver {
    child: Child,
    endpoint: String,
}

impl ManagedDriver {
    /// Starts `driver_binary` when the configured endpoint is a local port nobody
    /// listens on. Returns `None` when no process is needed or none is configured.
    pub async fn ensure(settings: &ScreenshotSettings) -> Result<Option<Self>, ScreenshotError> {
        let endpoint = normalize_local_webdriver_endpoint(&settings.webdriver_url);
        if webdriver_reachable(&endpoint).await {
            debug!(endpoint = %endpoint, "webdriver endpoint reachable");
            return Ok(None);
        }
        let Some(binary) = settings.driver_binary.as_deref() else {
            warn!(endpoint = %endpoint, "webdriver endpoint unreachable and no driver_binary configured");
            return Ok(None);
        };

        let parsed = Url::parse(&endpoint)
            .map_err(|e| ScreenshotError::WebDriver(format!("invalid webdriver url: {e}")))?;
        if parsed.host_str() != Some("127.0.0.1") {
            return Err(ScreenshotError::WebDriver(
                "autostart only supports localhost endpoints".to_string(),
            ));
        }
        let port = parsed.port_or_known_default().unwrap_or(4444);

        let mut child = Command::new(binary)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScreenshotError::WebDriver(format!("failed to spawn {binary}: {e}")))?;

        let steps = (DRIVER_START_TIMEOUT.as_millis() / 200).max(1);
        for _ in 0..steps {
            if webdriver_reachable(&endpoint).await {
                info!(endpoint = %endpoint, binary, "webdriver autostarted");
                return Ok(Some(Self { child, endpoint }));
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ScreenshotError::WebDriver(format!(
                    "{binary} exited early with status {status}"
                )));
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Err(ScreenshotError::WebDriver(format!(
            "{binary} did not become ready in time"
        )))
    }

    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(endpoint = %self.endpoint, error = %e, "stopping webdriver failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba([200, 30, 30, 255])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn thumbnail_fits_box_and_keeps_aspect_ratio() {
        let img = DynamicImage::new_rgb8(1280, 800);
        let thumb = make_thumbnail(&img, 400, 300);
        assert_eq!(thumb.dimensions(), (400, 250));
    }

    #[test]
    fn save_writes_full_image_and_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let writer = EvidenceImageWriter::new(dir.path(), &ScreenshotSettings::default());

        let paths = writer.save(&png_bytes(1280, 800), "fake-test-homepage.jpg").unwrap();

        assert_eq!(paths.full, "/images/scam-evidence/fake-test-homepage.jpg");
        assert_eq!(paths.thumbnail, "/images/scam-evidence/thumb-fake-test-homepage.jpg");
        let full = image::open(dir.path().join("fake-test-homepage.jpg")).unwrap();
        let thumb = image::open(dir.path().join("thumb-fake-test-homepage.jpg")).unwrap();
        assert_eq!(full.dimensions(), (1280, 800));
        assert_eq!(thumb.dimensions(), (400, 250));
    }

    #[test]
    fn save_rejects_garbage_payload() {
        let dir = tempfile::tempdir().unwrap();
        let writer = EvidenceImageWriter::new(dir.path(), &ScreenshotSettings::default());
        assert!(matches!(
            writer.save(b"not an image", "x.jpg"),
            Err(ScreenshotError::Image(_))
        ));
        assert!(!dir.path().join("x.jpg").exists());
    }

    #[test]
    fn local_endpoints_are_pinned_to_loopback() {
        assert_eq!(
            normalize_local_webdriver_endpoint("http://localhost:9515/"),
            "http://127.0.0.1:9515"
        );
        assert_eq!(
            normalize_local_webdriver_endpoint("http://grid.internal:4444/wd/hub"),
            "http://grid.internal:4444/wd/hub"
        );
    }

    #[test]
    fn capabilities_carry_viewport_and_page_load_timeout() {
        let caps = webdriver_capabilities(&ScreenshotSettings::default());
        let always = &caps["capabilities"]["alwaysMatch"];
        assert_eq!(always["browserName"], "chrome");
        assert_eq!(always["timeouts"]["pageLoad"], 30_000);
        let args = always["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().any(|a| a == "--window-size=1280,800"));
    }

    /// Minimal WebDriver endpoint: logs each request line and stalls navigation.
    async fn stalling_webdriver() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(Mutex::new(Vec::new()));
        let requests = Arc::clone(&log);
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let requests = Arc::clone(&requests);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    let head_end = loop {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                            break pos + 4;
                        }
                    };
                    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                    let content_length = head
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    while buf.len() < head_end + content_length {
                        let n = stream.read(&mut chunk).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                    let line: Vec<&str> = head.lines().next().unwrap_or("").split(' ').collect();
                    let request = format!("{} {}", line[0], line.get(1).unwrap_or(&""));
                    requests.lock().unwrap().push(request.clone());

                    let body = if request == "POST /session" {
                        r#"{"value":{"sessionId":"s1","capabilities":{}}}"#
                    } else {
                        if request.ends_with("/url") {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                        }
                        r#"{"value":null}"#
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        (endpoint, log)
    }

    #[tokio::test]
    async fn timed_out_render_still_deletes_the_session() {
        let (endpoint, log) = stalling_webdriver().await;
        let dir = tempfile::tempdir().unwrap();
        let settings = ScreenshotSettings {
            webdriver_url: endpoint,
            page_timeout_secs: 0,
            settle_ms: 0,
            ..ScreenshotSettings::default()
        };
        let mut screenshotter = WebDriverScreenshotter::new(&settings, dir.path()).unwrap();
        screenshotter.render_timeout = Duration::from_millis(300);

        let result = screenshotter.capture("https://slow.test/", "slow-test-homepage.jpg").await;

        assert!(matches!(result, Err(ScreenshotError::Timeout(_))));
        let requests = log.lock().unwrap().clone();
        assert_eq!(requests[0], "POST /session");
        assert_eq!(requests[1], "POST /session/s1/url");
        assert!(requests.contains(&"DELETE /session/s1".to_string()));
        assert!(!dir.path().join("slow-test-homepage.jpg").exists());
    }

    #[tokio::test]
    async fn reachability_follows_the_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        assert!(webdriver_reachable(&endpoint).await);
        drop(listener);
        assert!(!webdriver_reachable(&endpoint).await);
        assert!(!webdriver_reachable("not a url").await);
    }

    #[tokio::test]
    async fn disabled_screenshotter_always_fails() {
        let result = DisabledScreenshotter.capture("https://fake.test/", "x.jpg").await;
        assert!(matches!(result, Err(ScreenshotError::Disabled)));
    }
}
