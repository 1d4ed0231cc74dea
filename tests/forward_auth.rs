mod common;

use common::*;
use outpost::auth::ProxyMode;
use outpost::session::StorageConfig;
use reqwest::StatusCode;
use serde_json::Value;

async fn forward_outpost(idp: &MockIdp) -> TestOutpost {
    let single = idp.provider("app", ProxyMode::ForwardSingle, "http://app.test");

    let mut domain = idp.provider("corp", ProxyMode::ForwardDomain, "http://auth.corp.test");
    domain.cookie_domain = "corp.test".to_string();
    domain.skip_path_regex = "^http://status\\.corp\\.test/.*".to_string();

    TestOutpost::start(vec![single, domain], StorageConfig::default())
        .await
        .expect("outpost starts")
}

/// Browser request for an outpost path on `host`
async fn browse(outpost: &TestOutpost, host: &str, path: &str, jar: &CookieJar) -> reqwest::Response {
    let mut request = client()
        .get(outpost.url(path))
        .header("x-forwarded-host", host)
        .header("x-forwarded-proto", "http");
    if !jar.is_empty() {
        request = request.header("cookie", jar.header());
    }
    request.send().await.expect("request succeeds")
}

/// Traefik forward-auth check for `host` + `uri`
async fn traefik(outpost: &TestOutpost, host: &str, uri: &str, jar: &CookieJar) -> reqwest::Response {
    let mut request = client()
        .get(outpost.url("/outpost.goauthentik.io/auth/traefik"))
        .header("x-forwarded-proto", "http")
        .header("x-forwarded-host", host)
        .header("x-forwarded-uri", uri);
    if !jar.is_empty() {
        request = request.header("cookie", jar.header());
    }
    request.send().await.expect("request succeeds")
}

/// Log in through the outpost endpoints served on `host`
async fn login(outpost: &TestOutpost, host: &str, start: &url::Url, jar: &mut CookieJar) -> url::Url {
    let start_path = format!("{}?{}", start.path(), start.query().unwrap_or_default());
    let response = browse(outpost, host, &start_path, jar).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    jar.absorb(&response);
    let state = query(&location(&response), "state").expect("state parameter");

    let callback = format!(
        "/outpost.goauthentik.io/callback?code={}&state={}",
        VALID_CODE,
        urlencoding::encode(&state)
    );
    let response = browse(outpost, host, &callback, jar).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    jar.absorb(&response);
    location(&response)
}

#[tokio::test]
async fn test_nginx_returns_401_then_200_after_login() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;
    let mut jar = CookieJar::default();

    let response = client()
        .get(outpost.url("/outpost.goauthentik.io/auth/nginx"))
        .header("x-forwarded-host", "app.test")
        .header("x-original-url", "http://app.test/reports/7")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    jar.absorb(&response);
    assert!(!jar.is_empty());

    // nginx sends the browser to start without a destination
    let start = url::Url::parse("http://app.test/outpost.goauthentik.io/start").unwrap();
    let destination = login(&outpost, "app.test", &start, &mut jar).await;
    assert_eq!(destination.as_str(), "http://app.test/reports/7");

    let response = client()
        .get(outpost.url("/outpost.goauthentik.io/auth/nginx"))
        .header("x-forwarded-host", "app.test")
        .header("x-original-url", "http://app.test/reports/7")
        .header("cookie", jar.header())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-authentik-username"], USERNAME);
    assert_eq!(response.headers()["x-authentik-meta-provider"], "app");

    outpost.shutdown().await;
}

#[tokio::test]
async fn test_traefik_login_round_trip() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;
    let mut jar = CookieJar::default();

    let response = traefik(&outpost, "app.test", "/dashboard", &jar).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    jar.absorb(&response);
    let start = location(&response);
    assert_eq!(start.host_str(), Some("app.test"));
    assert_eq!(query(&start, "rd").as_deref(), Some("http://app.test/dashboard"));

    let destination = login(&outpost, "app.test", &start, &mut jar).await;
    assert_eq!(destination.as_str(), "http://app.test/dashboard");

    let response = traefik(&outpost, "app.test", "/dashboard", &jar).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-authentik-uid"], "u1");
    assert_eq!(response.headers()["x-authentik-email"], "alice@example.com");

    outpost.shutdown().await;
}

#[tokio::test]
async fn test_caddy_and_envoy_share_the_session() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;
    let mut jar = CookieJar::default();

    let response = client()
        .get(outpost.url("/outpost.goauthentik.io/auth/caddy"))
        .header("x-forwarded-host", "app.test")
        .header("x-forwarded-uri", "/files")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    jar.absorb(&response);
    let start = location(&response);
    login(&outpost, "app.test", &start, &mut jar).await;

    let response = client()
        .get(outpost.url("/outpost.goauthentik.io/auth/envoy/files?page=2"))
        .header("host", "app.test")
        .header("cookie", jar.header())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-authentik-username"], USERNAME);

    outpost.shutdown().await;
}

#[tokio::test]
async fn test_forward_domain_covers_sub_domains() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;
    let mut jar = CookieJar::default();

    let response = traefik(&outpost, "wiki.corp.test", "/page", &jar).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    jar.absorb(&response);
    let start = location(&response);
    assert_eq!(start.host_str(), Some("auth.corp.test"));
    assert_eq!(query(&start, "rd").as_deref(), Some("http://wiki.corp.test/page"));

    let destination = login(&outpost, "auth.corp.test", &start, &mut jar).await;
    assert_eq!(destination.as_str(), "http://wiki.corp.test/page");

    let response = traefik(&outpost, "git.corp.test", "/", &jar).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-authentik-meta-provider"], "corp");

    outpost.shutdown().await;
}

#[tokio::test]
async fn test_allowlisted_url_skips_login() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;

    let response = traefik(&outpost, "status.corp.test", "/health", &CookieJar::default()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-authentik-uid").is_none());

    outpost.shutdown().await;
}

#[tokio::test]
async fn test_foreign_redirect_is_dropped() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;
    let mut jar = CookieJar::default();

    let start = url::Url::parse(
        "http://app.test/outpost.goauthentik.io/start?rd=http%3A%2F%2Fevil.test%2F",
    )
    .unwrap();
    let destination = login(&outpost, "app.test", &start, &mut jar).await;
    assert_eq!(destination.as_str(), "http://app.test/");

    outpost.shutdown().await;
}

#[tokio::test]
async fn test_ping_and_unknown_hosts() {
    let idp = MockIdp::start().await.unwrap();
    let outpost = forward_outpost(&idp).await;
    let jar = CookieJar::default();

    let response = browse(&outpost, "nowhere.test", "/outpost.goauthentik.io/ping", &jar).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = browse(&outpost, "nowhere.test", "/anything", &jar).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().get("x-request-id").is_some());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UNKNOWN_HOST");

    // Forward providers do not proxy
    let response = browse(&outpost, "app.test", "/anything", &jar).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    outpost.shutdown().await;
}
