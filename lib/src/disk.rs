//! A filesystem-backed static server rooted at a configured directory.
//!
//! `GET`/`HEAD` serve files and JSON directory listings; `PUT` (when the
//! service is writable) replaces files atomically. Paths that fail to parse,
//! traverse upward, or touch dotfiles (when disallowed) are *blocked*:
//! reads answer 404 and writes 403, and the filesystem is never consulted.

use crate::error::Error;
use crate::service::{
    unsupported_event, AlarmResult, CustomEvent, CustomEventResult, ScheduledResult, Service,
    SubrequestMetadata, Trace, WorkerInterface,
};
use crate::util::{escape_json_string, http_time};
use futures::future::{BoxFuture, FutureExt};
use hyper::body::{Bytes, HttpBody};
use hyper::{header, Body, Method, Request, Response, StatusCode};
use std::fs::FileType;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const UNSUPPORTED_EVENT: &str = "Disk directory services don't support this event type.";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct DiskDirectoryService {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    writable: bool,
    allow_dotfiles: bool,
}

impl DiskDirectoryService {
    pub(crate) fn new(root: PathBuf, writable: bool, allow_dotfiles: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                writable,
                allow_dotfiles,
            }),
        }
    }
}

impl Service for DiskDirectoryService {
    fn start_request(&self, _metadata: SubrequestMetadata) -> Box<dyn WorkerInterface> {
        Box::new(DiskRequest {
            inner: self.inner.clone(),
        })
    }
}

struct DiskRequest {
    inner: Arc<Inner>,
}

impl WorkerInterface for DiskRequest {
    fn request(
        self: Box<Self>,
        req: Request<Body>,
    ) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        let inner = self.inner;
        async move {
            let path = parse_request_path(req.uri().path(), inner.allow_dotfiles);

            match *req.method() {
                Method::GET | Method::HEAD => {
                    let Some(segments) = path else {
                        return status_response(StatusCode::NOT_FOUND);
                    };
                    serve_node(&inner, segments, req.method() == Method::HEAD).await
                }
                Method::PUT => {
                    if !inner.writable {
                        return status_response(StatusCode::METHOD_NOT_ALLOWED);
                    }
                    let Some(segments) = path else {
                        return status_response(StatusCode::FORBIDDEN);
                    };
                    replace_file(&inner, segments, req.into_body()).await
                }
                _ => status_response(StatusCode::NOT_IMPLEMENTED),
            }
        }
        .boxed()
    }

    fn run_scheduled(
        self: Box<Self>,
        _scheduled_time: SystemTime,
        _cron: &str,
    ) -> BoxFuture<'static, Result<ScheduledResult, Error>> {
        unsupported_event(UNSUPPORTED_EVENT)
    }

    fn run_alarm(
        self: Box<Self>,
        _scheduled_time: SystemTime,
    ) -> BoxFuture<'static, Result<AlarmResult, Error>> {
        unsupported_event(UNSUPPORTED_EVENT)
    }

    fn send_traces(self: Box<Self>, _traces: Vec<Trace>) -> Result<(), Error> {
        Err(Error::Unsupported {
            msg: UNSUPPORTED_EVENT,
        })
    }

    fn custom_event(
        self: Box<Self>,
        _event: Box<dyn CustomEvent>,
    ) -> BoxFuture<'static, Result<CustomEventResult, Error>> {
        unsupported_event(UNSUPPORTED_EVENT)
    }
}

async fn serve_node(
    inner: &Inner,
    segments: Vec<String>,
    head_only: bool,
) -> Result<Response<Body>, Error> {
    let full = node_path(inner, &segments);
    let meta = match fs::metadata(&full).await {
        Ok(meta) => meta,
        Err(_) => return status_response(StatusCode::NOT_FOUND),
    };
    let last_modified = http_time(meta.modified().unwrap_or(UNIX_EPOCH));

    if meta.is_file() {
        // Content-Length is set explicitly so HEAD requests can report the
        // size of the body they omit.
        let builder = Response::builder()
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::LAST_MODIFIED, last_modified)
            .header(header::CONTENT_LENGTH, meta.len());
        if head_only {
            return Ok(builder.body(Body::empty())?);
        }
        Ok(builder.body(stream_file(full))?)
    } else if meta.is_dir() {
        // No Content-Length here, reserving the right to stream listings of
        // very large directories later.
        let builder = Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::LAST_MODIFIED, last_modified);
        if head_only {
            return Ok(builder.body(Body::empty())?);
        }
        let listing = list_directory(&full, inner.allow_dotfiles).await?;
        Ok(builder.body(Body::from(listing))?)
    } else {
        status_response(StatusCode::NOT_ACCEPTABLE)
    }
}

fn stream_file(path: PathBuf) -> Body {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(_) => {
                sender.abort();
                return;
            }
        };
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sender
                        .send_data(Bytes::copy_from_slice(&buf[..n]))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => {
                    sender.abort();
                    break;
                }
            }
        }
    });
    body
}

async fn list_directory(path: &PathBuf, allow_dotfiles: bool) -> Result<String, Error> {
    let mut entries = Vec::new();
    let mut dir = fs::read_dir(path).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !allow_dotfiles && name.starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().await?;
        entries.push(format!(
            "{{\"name\":\"{}\",\"type\":\"{}\"}}",
            escape_json_string(&name),
            file_type_name(&file_type)
        ));
    }
    Ok(format!("[{}]", entries.join(",")))
}

fn file_type_name(file_type: &FileType) -> &'static str {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if file_type.is_block_device() {
            return "blockDevice";
        }
        if file_type.is_char_device() {
            return "characterDevice";
        }
        if file_type.is_fifo() {
            return "namedPipe";
        }
        if file_type.is_socket() {
            return "socket";
        }
    }
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_file() {
        "file"
    } else {
        "other"
    }
}

async fn replace_file(
    inner: &Inner,
    segments: Vec<String>,
    mut body: Body,
) -> Result<Response<Body>, Error> {
    let full = node_path(inner, &segments);
    let parent = full.parent().map(PathBuf::from).unwrap_or_else(|| inner.root.clone());
    fs::create_dir_all(&parent).await?;

    // Write beside the destination, then rename over it.
    let temp = parent.join(format!(
        ".gantry-upload.{}.{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let write_result = async {
        let mut file = fs::File::create(&temp).await?;
        while let Some(chunk) = body.data().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);
        fs::rename(&temp, &full).await?;
        Ok::<(), Error>(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp).await;
        return Err(err);
    }
    status_response(StatusCode::NO_CONTENT)
}

fn node_path(inner: &Inner, segments: &[String]) -> PathBuf {
    let mut path = inner.root.clone();
    for segment in segments {
        path.push(segment);
    }
    path
}

fn status_response(status: StatusCode) -> Result<Response<Body>, Error> {
    Ok(Response::builder().status(status).body(Body::empty())?)
}

/// Splits and percent-decodes a request path into segments. Returns `None`
/// when the path is blocked: undecodable, traversing, containing odd
/// segments, or touching dotfiles while those are disallowed.
fn parse_request_path(path: &str, allow_dotfiles: bool) -> Option<Vec<String>> {
    let path = path.strip_prefix('/')?;
    let mut segments = Vec::new();

    if !path.is_empty() {
        let parts: Vec<&str> = path.split('/').collect();
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                // A trailing slash is fine; an interior empty segment is not.
                if i == parts.len() - 1 {
                    continue;
                }
                return None;
            }
            let decoded = percent_decode(part)?;
            if decoded.is_empty()
                || decoded == "."
                || decoded == ".."
                || decoded.contains('/')
                || decoded.contains('\0')
            {
                return None;
            }
            segments.push(decoded);
        }
    }

    if !allow_dotfiles && segments.iter().any(|segment| segment.starts_with('.')) {
        return None;
    }
    Some(segments)
}

fn percent_decode(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = (*bytes.get(i + 1)? as char).to_digit(16)?;
            let lo = (*bytes.get(i + 2)? as char).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn service(root: &Path, writable: bool, allow_dotfiles: bool) -> DiskDirectoryService {
        DiskDirectoryService::new(root.to_path_buf(), writable, allow_dotfiles)
    }

    async fn send(
        service: &DiskDirectoryService,
        method: Method,
        path: &str,
        body: Body,
    ) -> Response<Body> {
        let req = Request::builder()
            .method(method)
            .uri(path)
            .body(body)
            .unwrap();
        service
            .start_request(SubrequestMetadata::default())
            .request(req)
            .await
            .expect("request succeeds")
    }

    async fn body_bytes(resp: Response<Body>) -> Vec<u8> {
        hyper::body::to_bytes(resp.into_body()).await.unwrap().to_vec()
    }

    #[tokio::test]
    async fn get_serves_file_contents() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("foo.txt"), b"hello").unwrap();
        let mtime = std::fs::metadata(dir.path().join("foo.txt"))
            .unwrap()
            .modified()
            .unwrap();

        let svc = service(dir.path(), false, false);
        let resp = send(&svc, Method::GET, "/foo.txt", Body::empty()).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/octet-stream"
        );
        assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
        assert_eq!(
            resp.headers().get(header::LAST_MODIFIED).unwrap(),
            http_time(mtime).as_str()
        );
        assert_eq!(body_bytes(resp).await, b"hello");
    }

    #[tokio::test]
    async fn head_sends_headers_only() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("foo.txt"), b"hello").unwrap();

        let svc = service(dir.path(), false, false);
        let resp = send(&svc, Method::HEAD, "/foo.txt", Body::empty()).await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(header::CONTENT_LENGTH).unwrap(), "5");
        assert!(body_bytes(resp).await.is_empty());
    }

    #[tokio::test]
    async fn missing_files_are_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path(), false, false);
        let resp = send(&svc, Method::GET, "/nope", Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn directory_listing_is_json_and_omits_dotfiles() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), b"x").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();

        let svc = service(dir.path(), false, false);
        let resp = send(&svc, Method::GET, "/", Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let text = String::from_utf8(body_bytes(resp).await).unwrap();
        let mut parsed: Vec<serde_json::Value> = serde_json::from_str(&text).unwrap();
        parsed.sort_by_key(|e| e["name"].as_str().unwrap().to_owned());
        assert_eq!(
            parsed,
            vec![
                serde_json::json!({"name": "a", "type": "file"}),
                serde_json::json!({"name": "d", "type": "directory"}),
            ]
        );
    }

    #[tokio::test]
    async fn dotfiles_appear_when_allowed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".hidden"), b"secret").unwrap();

        let blocked = service(dir.path(), false, false);
        let resp = send(&blocked, Method::GET, "/.hidden", Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let allowed = service(dir.path(), false, true);
        let resp = send(&allowed, Method::GET, "/.hidden", Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, b"secret");
    }

    #[tokio::test]
    async fn traversal_is_rejected_even_when_the_target_exists() {
        let outer = TempDir::new().unwrap();
        std::fs::write(outer.path().join("secret"), b"x").unwrap();
        let root = outer.path().join("www");
        std::fs::create_dir(&root).unwrap();

        let svc = service(&root, false, false);
        for path in ["/../secret", "/%2e%2e/secret", "/a/../../secret"] {
            let resp = send(&svc, Method::GET, path, Body::empty()).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "path {path}");
        }
    }

    #[tokio::test]
    async fn put_replaces_files_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path(), true, false);

        let resp = send(&svc, Method::PUT, "/sub/dir/file.txt", Body::from("data")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            std::fs::read(dir.path().join("sub/dir/file.txt")).unwrap(),
            b"data"
        );

        let resp = send(&svc, Method::PUT, "/sub/dir/file.txt", Body::from("newer")).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            std::fs::read(dir.path().join("sub/dir/file.txt")).unwrap(),
            b"newer"
        );
    }

    #[tokio::test]
    async fn put_requires_a_writable_service() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path(), false, false);
        let resp = send(&svc, Method::PUT, "/file", Body::from("data")).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn put_to_blocked_paths_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path(), true, false);
        let resp = send(&svc, Method::PUT, "/../escape", Body::from("data")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = send(&svc, Method::PUT, "/.hidden", Body::from("data")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn other_methods_are_not_implemented() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path(), true, false);
        let resp = send(&svc, Method::POST, "/x", Body::empty()).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn path_parsing_blocks_odd_segments() {
        assert_eq!(parse_request_path("/", false), Some(vec![]));
        assert_eq!(
            parse_request_path("/a/b", false),
            Some(vec!["a".to_owned(), "b".to_owned()])
        );
        // Trailing slash is tolerated.
        assert_eq!(parse_request_path("/a/", false), Some(vec!["a".to_owned()]));
        assert_eq!(parse_request_path("/a//b", false), None);
        assert_eq!(parse_request_path("/./a", false), None);
        assert_eq!(parse_request_path("/%2f", false), None);
        assert_eq!(parse_request_path("/%00", false), None);
        assert_eq!(parse_request_path("/%zz", false), None);
        assert_eq!(
            parse_request_path("/a%20b", false),
            Some(vec!["a b".to_owned()])
        );
        assert_eq!(parse_request_path("/.well-known/x", false), None);
        assert_eq!(
            parse_request_path("/.well-known/x", true),
            Some(vec![".well-known".to_owned(), "x".to_owned()])
        );
    }
}
