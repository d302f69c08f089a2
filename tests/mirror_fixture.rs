use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use site_cloner::browser::HttpFetcher;
use site_cloner::cache::MemoryCache;
use site_cloner::crawler::{JobOptions, JobStatus, Orchestrator, OrchestratorSettings, RetryPolicy};
use site_cloner::storage::{JobStore, MemoryJobStore};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HOME: &str = r#"<!DOCTYPE html>
<html>
<head><title>Home</title><link rel="stylesheet" href="/css/site.css"></head>
<body>
  <a href="/about">About us</a>
  <a href="/blog/">Blog</a>
  <img src="/img/logo.png" alt="logo">
</body>
</html>"#;

const ABOUT: &str = r#"<!DOCTYPE html>
<html>
<head><title>About</title><link rel="stylesheet" href="/css/site.css"></head>
<body>
  <a href="/">Home</a>
  <img src="/cdn/logo.png" alt="logo">
</body>
</html>"#;

const BLOG: &str = r#"<!DOCTYPE html>
<html>
<head><title>Blog</title></head>
<body>
  <a href="/about#team">Team</a>
  <a href="../">Home</a>
</body>
</html>"#;

const CSS: &str = "body { font-family: sans-serif } .logo { background: url(/img/logo.png) }";

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n-not-really-an-image";

/// A three page site whose pages revalidate with ETags.
///
/// Every page is expected once in full and once revalidated.
async fn site() -> MockServer {
    let server = MockServer::start().await;

    for (route, body, etag) in [("/", HOME, "\"home-v1\""), ("/about", ABOUT, "\"about-v1\""), ("/blog/", BLOG, "\"blog-v1\"")] {
        // Mounted first so revalidations match before the full response
        Mock::given(method("GET"))
            .and(path(route))
            .and(header("if-none-match", etag))
            .respond_with(ResponseTemplate::new(304).insert_header("etag", etag))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", etag)
                    .set_body_raw(body, "text/html; charset=utf-8"),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    Mock::given(method("GET"))
        .and(path("/css/site.css"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(CSS, "text/css"))
        .mount(&server)
        .await;

    for route in ["/img/logo.png", "/cdn/logo.png"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "image/png").set_body_bytes(PNG))
            .mount(&server)
            .await;
    }

    server
}

struct Fixture {
    orchestrator: Orchestrator,
    store: Arc<MemoryJobStore>,
    _root: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryJobStore::default());

    let settings = OrchestratorSettings {
        output_root: root.path().to_path_buf(),
        retry: RetryPolicy { initial_backoff_ms: 5, jitter: 0.0, ..RetryPolicy::default() },
        allow_private_networks: true,
        ..OrchestratorSettings::default()
    };
    let fetcher = HttpFetcher::new("site-cloner-tests", Duration::from_secs(10));
    let orchestrator = Orchestrator::new(settings, store.clone(), Arc::new(MemoryCache::new()), Arc::new(fetcher));

    Fixture { orchestrator, store, _root: root }
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == route)
        .count()
}

fn read(dir: &Path, file: &str) -> String {
    std::fs::read_to_string(dir.join(file)).unwrap()
}

#[tokio::test]
async fn clones_site_and_revalidates_on_rerun() {
    let server = site().await;
    let fixture = fixture();
    let target = format!("{}/", server.uri());
    let options = JobOptions { incremental: true, ..JobOptions::default() };

    let first = fixture.orchestrator.submit(&target, options.clone()).await.unwrap();
    let record = fixture.orchestrator.run(&first).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.pages_cloned, 3);
    // One stylesheet and one image shared by two URLs
    assert_eq!(record.assets_captured, 2);
    assert!(record.errors.is_empty(), "{:?}", record.errors);
    assert_eq!(record.verification.as_ref().unwrap().score, 100.0);

    let out = PathBuf::from(&record.output_dir);
    let home = read(&out, "index.html");
    let about = read(&out, "about/index.html");
    let blog = read(&out, "blog/index.html");

    assert!(home.contains(r#"href="about/index.html""#));
    assert!(home.contains(r#"href="blog/index.html""#));
    assert!(about.contains(r#"href="../index.html""#));
    assert!(blog.contains(r#"href="../about/index.html#team""#));
    assert!(!home.contains(&server.uri()));

    let logo = home.split("src=\"").nth(1).unwrap().split('"').next().unwrap().to_string();
    assert!(about.contains(&format!("src=\"../{}\"", logo)));
    assert_eq!(std::fs::read(out.join(&logo)).unwrap(), PNG);

    let downloads = requests_to(&server, "/img/logo.png").await
        + requests_to(&server, "/cdn/logo.png").await
        + requests_to(&server, "/css/site.css").await;
    assert_eq!(downloads, 3);

    let second = fixture.orchestrator.submit(&target, options).await.unwrap();
    let record = fixture.orchestrator.run(&second).await.unwrap();
    let job = fixture.store.load(&second).await.unwrap().unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(job.counters.pages_cached, 3);
    assert_eq!(job.counters.pages_fetched, 0);
    assert_eq!(job.counters.assets_downloaded, 0);
    assert_eq!(record.assets_captured, 2);
    assert_eq!(record.verification.unwrap().score, 100.0);

    let downloads_after = requests_to(&server, "/img/logo.png").await
        + requests_to(&server, "/cdn/logo.png").await
        + requests_to(&server, "/css/site.css").await;
    assert_eq!(downloads_after, downloads);
}

#[tokio::test]
async fn missing_asset_lowers_score_but_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gallery"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(r#"<html><body><img src="/img/gone.png"><a href="/">Home</a></body></html>"#, "text/html"),
        )
        .mount(&server)
        .await;

    let fixture = fixture();
    let target = format!("{}/gallery", server.uri());

    let id = fixture.orchestrator.submit(&target, JobOptions { max_depth: 0, ..JobOptions::default() }).await.unwrap();
    let record = fixture.orchestrator.run(&id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.pages_cloned, 1);
    assert_eq!(record.errors.len(), 1);
    assert!(record.errors[0].url.as_deref().unwrap().ends_with("/img/gone.png"));

    let report = record.verification.unwrap();
    assert!(report.score < 100.0);
    assert_eq!(report.assets.expected, 1);
    assert_eq!(report.assets.found, 0);
    // Not-found is permanent, so the asset is requested once
    assert_eq!(requests_to(&server, "/img/gone.png").await, 1);
}

#[tokio::test]
async fn transient_page_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body><p>Back again</p></body></html>", "text/html"),
        )
        .mount(&server)
        .await;

    let fixture = fixture();
    let id = fixture.orchestrator.submit(&format!("{}/", server.uri()), JobOptions::default()).await.unwrap();
    let record = fixture.orchestrator.run(&id).await.unwrap();
    let job = fixture.store.load(&id).await.unwrap().unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.pages_cloned, 1);
    assert_eq!(job.counters.retries, 2);
    assert!(read(Path::new(&record.output_dir), "index.html").contains("Back again"));
}
