//! End-to-end tests: real sockets, real services, one server per test.

mod common;

use common::{body_text, spawn_backend, Test, TestResult};
use hyper::{Body, Request, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn disk_sockets_serve_files_and_listings() -> TestResult {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("foo.txt"), b"hello")?;
    std::fs::write(dir.path().join(".hidden"), b"secret")?;

    let test = Test::from_toml(&format!(
        r#"
            [[services]]
            name = "site"
            disk = {{ path = "{}" }}

            [[sockets]]
            name = "main"
            service = "site"
        "#,
        dir.path().display()
    ))
    .start(&["main"])
    .await;

    let resp = test.get("main", "/foo.txt").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/octet-stream");
    assert_eq!(resp.headers()["content-length"], "5");
    assert_eq!(body_text(resp).await, "hello");

    // Directory listing omits the dotfile.
    let resp = test.get("main", "/").await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "application/json");
    let listing = body_text(resp).await;
    assert!(listing.contains("{\"name\":\"foo.txt\",\"type\":\"file\"}"));
    assert!(!listing.contains("hidden"));

    // Traversal and dotfiles are blocked outright.
    assert_eq!(
        test.get("main", "/../foo.txt").await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        test.get("main", "/.hidden").await.status(),
        StatusCode::NOT_FOUND
    );
    Ok(())
}

#[tokio::test]
async fn workers_see_absolute_urls_and_client_blobs() -> TestResult {
    let test = Test::from_toml(
        r#"
            [[services]]
            name = "hello"
            [services.worker]
            compatibility_date = "2022-10-31"
            modules = [{ name = "main.js", content = "export default {}" }]

            [[sockets]]
            name = "main"
            service = "hello"
        "#,
    )
    .start(&["main"])
    .await;

    let resp = test.get("main", "/a?b=1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_text(resp).await;

    // Host-style incoming rewrite: origin-form became an absolute URL on
    // the plain-http listener.
    assert!(body.contains(&format!("url=http://{}/a?b=1", test.addr("main"))), "{body}");
    // The connection's client blob made it into the worker.
    assert!(body.contains("cf={\"clientIp\": \"127.0.0.1\"}"), "{body}");
    assert!(body.contains("entrypoint=-"), "{body}");
    Ok(())
}

#[tokio::test]
async fn worker_subrequest_channels_reach_global_outbound() -> TestResult {
    let (backend, _backend_task) = spawn_backend().await;

    let test = Test::from_toml(
        r#"
            [[services]]
            name = "origin"
            external = {}

            [[services]]
            name = "hello"
            [services.worker]
            compatibility_date = "2022-10-31"
            modules = [{ name = "main.js", content = "export default {}" }]
            global_outbound = "origin"

            [[sockets]]
            name = "main"
            service = "hello"
        "#,
    )
    .external_addr("origin", backend)
    .start(&["main"])
    .await;

    // Channels 0 and 1 both alias the configured global outbound.
    for channel in ["/sub/0", "/sub/1"] {
        let resp = test.get("main", channel).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_text(resp).await;
        assert!(body.starts_with("backend path="), "{body}");
    }
    Ok(())
}

#[tokio::test]
async fn external_services_forward_host_style() -> TestResult {
    let (backend, _backend_task) = spawn_backend().await;

    let test = Test::from_toml(
        r#"
            [[services]]
            name = "origin"
            external = {}

            [[sockets]]
            name = "main"
            service = "origin"
        "#,
    )
    .external_addr("origin", backend)
    .start(&["main"])
    .await;

    let resp = test.get("main", "/proxied/path?x=1").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_text(resp).await;
    // The upstream sees an origin-form request line and the client's
    // original authority in Host.
    assert!(body.contains("path=/proxied/path?x=1"), "{body}");
    assert!(body.contains(&format!("host={}", test.addr("main"))), "{body}");
    Ok(())
}

#[tokio::test]
async fn requests_without_host_are_rejected_with_400() -> TestResult {
    let dir = tempfile::tempdir()?;
    let test = Test::from_toml(&format!(
        r#"
            [[services]]
            name = "site"
            disk = {{ path = "{}" }}

            [[sockets]]
            name = "main"
            service = "site"
        "#,
        dir.path().display()
    ))
    .start(&["main"])
    .await;

    // hyper's client always sends Host, so speak raw HTTP/1.1 instead.
    let mut stream = tokio::net::TcpStream::connect(test.addr("main")).await?;
    stream
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    Ok(())
}

#[tokio::test]
async fn unresolved_service_references_still_listen() -> TestResult {
    let test = Test::from_toml(
        r#"
            [[sockets]]
            name = "main"
            service = "missing"
        "#,
    )
    .start(&["main"])
    .await;

    // The socket accepted our connection, but every request fails with the
    // fixed configuration error.
    let resp = test.get("main", "/").await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(test
        .config_errors()
        .iter()
        .any(|e| e.contains("refers to a service \"missing\"")));
    Ok(())
}

#[tokio::test]
async fn configured_header_injection_applies_both_ways() -> TestResult {
    let test = Test::from_toml(
        r#"
            [[services]]
            name = "hello"
            [services.worker]
            compatibility_date = "2022-10-31"
            modules = [{ name = "main.js", content = "export default {}" }]

            [[sockets]]
            name = "main"
            service = "hello"
            [sockets.http]
            inject_request_headers = [{ name = "X-Inject", value = "from-config" }]
            inject_response_headers = [{ name = "X-Powered-By", value = "gantry" }]
        "#,
    )
    .start(&["main"])
    .await;

    // The request injector overwrites whatever the client sent; the
    // response injector stamps the reply.
    let resp = test
        .request(
            "main",
            Request::get("/x")
                .header("x-inject", "from-client")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(resp.headers()["x-powered-by"], "gantry");
    let body = body_text(resp).await;
    assert!(body.contains("x-inject=from-config"), "{body}");
    Ok(())
}

#[tokio::test]
async fn socket_entrypoints_pin_worker_exports() -> TestResult {
    let test = Test::from_toml(
        r#"
            [[services]]
            name = "hello"
            [services.worker]
            compatibility_date = "2022-10-31"
            modules = [{ name = "main.js", content = "export default {}" }]

            [[sockets]]
            name = "admin"
            service = { name = "hello", entrypoint = "admin" }
        "#,
    )
    .start(&["admin"])
    .await;

    let resp = test.get("admin", "/").await;
    let body = body_text(resp).await;
    assert!(body.contains("entrypoint=admin"), "{body}");
    Ok(())
}
