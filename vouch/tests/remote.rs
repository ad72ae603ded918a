use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use color_eyre::Result;
use vouch::{
    keys::{KeySource, RemoteKeySource},
    testing::{valid_claims, TestKeyPair},
    RejectionKind, TokenVerifier, VerifierConfig,
};
use vouch_clock::{DurationSecs, TestClock, UnixTime};

const PROJECT: &str = "vouch-test";
const NOW: UnixTime = UnixTime(1_700_000_000);
const CACHE_CONTROL: &str = "public, max-age=19845, must-revalidate, no-transform";

#[derive(Clone)]
struct Provider {
    pems: Arc<HashMap<String, String>>,
    requests: Arc<AtomicUsize>,
}

impl Provider {
    fn new(pair: &TestKeyPair) -> Self {
        let pems = HashMap::from([(
            pair.kid().as_str().to_owned(),
            pair.certificate_pem().to_owned(),
        )]);

        Self {
            pems: Arc::new(pems),
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn keys(State(provider): State<Provider>) -> impl IntoResponse {
    provider.requests.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    (
        [(header::CACHE_CONTROL, CACHE_CONTROL)],
        Json((*provider.pems).clone()),
    )
}

async fn unavailable(State(provider): State<Provider>) -> StatusCode {
    provider.requests.fetch_add(1, Ordering::SeqCst);
    StatusCode::SERVICE_UNAVAILABLE
}

async fn slow(State(provider): State<Provider>) -> Json<HashMap<String, String>> {
    provider.requests.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(5)).await;
    Json((*provider.pems).clone())
}

async fn garbage() -> &'static str {
    "<html>not a key set</html>"
}

async fn serve(provider: Provider) -> Result<SocketAddr> {
    let router = Router::new()
        .route("/keys", get(keys))
        .route("/unavailable", get(unavailable))
        .route("/slow", get(slow))
        .route("/garbage", get(garbage))
        .with_state(provider);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    Ok(addr)
}

fn verifier(url: String, timeout: Duration) -> Result<TokenVerifier<TestClock>> {
    let config = VerifierConfig::new(PROJECT)
        .with_key_source_url(url)
        .with_fetch_timeout(timeout);
    let source = RemoteKeySource::new(config.key_source_url(), config.fetch_timeout())?;

    Ok(TokenVerifier::new(&config, source, TestClock::new(NOW)))
}

#[tokio::test]
async fn fetches_keys_and_cache_lifetime() -> Result<()> {
    let pair = TestKeyPair::generate("remote-1")?;
    let addr = serve(Provider::new(&pair)).await?;

    let source = RemoteKeySource::new(format!("http://{addr}/keys"), Duration::from_secs(5))?;
    let fetched = source.fetch().await?;

    assert_eq!(fetched.keys.len(), 1);
    assert_eq!(fetched.keys.get(pair.kid()), Some(&pair.public_key()?));
    assert_eq!(fetched.max_age, Some(DurationSecs(19845)));
    Ok(())
}

#[tokio::test]
async fn verifies_against_remote_keys_and_honors_max_age() -> Result<()> {
    let pair = TestKeyPair::generate("remote-1")?;
    let provider = Provider::new(&pair);
    let addr = serve(provider.clone()).await?;

    let verifier = verifier(format!("http://{addr}/keys"), Duration::from_secs(5))?;
    let token = pair.sign_claims(&valid_claims(PROJECT, NOW))?;

    verifier.verify_token(&token).await?;
    verifier.verify_token(&token).await?;

    assert_eq!(provider.requests(), 1);
    assert_eq!(
        verifier.key_cache().expires_at(),
        Some(UnixTime(NOW.0 + 19845))
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_fetch() -> Result<()> {
    let pair = TestKeyPair::generate("remote-1")?;
    let provider = Provider::new(&pair);
    let addr = serve(provider.clone()).await?;

    let verifier = verifier(format!("http://{addr}/keys"), Duration::from_secs(5))?;
    let token = pair.sign_claims(&valid_claims(PROJECT, NOW))?;

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let verifier = verifier.clone();
            let token = token.clone();
            tokio::spawn(async move { verifier.verify_token(&token).await.map(|_| ()) })
        })
        .collect();

    for task in tasks {
        task.await??;
    }

    assert_eq!(provider.requests(), 1);
    Ok(())
}

#[tokio::test]
async fn error_status_makes_the_source_unavailable() -> Result<()> {
    let pair = TestKeyPair::generate("remote-1")?;
    let provider = Provider::new(&pair);
    let addr = serve(provider.clone()).await?;

    let verifier = verifier(format!("http://{addr}/unavailable"), Duration::from_secs(5))?;
    let token = pair.sign_claims(&valid_claims(PROJECT, NOW))?;

    let err = verifier.verify_token(&token).await.unwrap_err();
    assert_eq!(err.kind(), RejectionKind::KeySourceUnavailable);
    match err {
        vouch::VerifyError::KeySourceUnavailable(e) => {
            assert_eq!(e.reason(), "unexpected response status");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // The failure is not cached; the next call tries again
    let _ = verifier.verify_token(&token).await;
    assert_eq!(provider.requests(), 2);
    Ok(())
}

#[tokio::test]
async fn slow_source_times_out() -> Result<()> {
    let pair = TestKeyPair::generate("remote-1")?;
    let addr = serve(Provider::new(&pair)).await?;

    let source = RemoteKeySource::new(format!("http://{addr}/slow"), Duration::from_millis(200))?;
    let started = std::time::Instant::now();
    let err = source.fetch().await.unwrap_err();

    assert_eq!(err.reason(), "timed out");
    assert!(started.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[tokio::test]
async fn unexpected_body_makes_the_source_unavailable() -> Result<()> {
    let pair = TestKeyPair::generate("remote-1")?;
    let addr = serve(Provider::new(&pair)).await?;

    let source = RemoteKeySource::new(format!("http://{addr}/garbage"), Duration::from_secs(5))?;
    let err = source.fetch().await.unwrap_err();

    assert_eq!(err.reason(), "unexpected response body");
    Ok(())
}

#[tokio::test]
async fn unreachable_source_is_unavailable() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let source = RemoteKeySource::new(format!("http://{addr}/keys"), Duration::from_secs(5))?;
    let err = source.fetch().await.unwrap_err();

    assert_eq!(err.reason(), "request failed");
    Ok(())
}
