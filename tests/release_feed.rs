//! 上游 release 匹配逻辑集成测试（本地伪 GitHub API）

use axum::routing::get;

use naiveswitch::app::updater;

async fn serve_release(json: &'static str) -> String {
    let router = axum::Router::new().route(
        "/repos/klzgrad/naiveproxy/releases/latest",
        get(move || async move {
            ([(axum::http::header::CONTENT_TYPE, "application/json")], json)
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

const RELEASE: &str = r#"{
    "tag_name": "v131.0.6778.86-1",
    "assets": [
        {"name": "naiveproxy-v131.0.6778.86-1-win-x64.zip",
         "browser_download_url": "https://dl.example/naiveproxy-v131.0.6778.86-1-win-x64.zip"},
        {"name": "naiveproxy-v131.0.6778.86-1-linux-x64.tar.xz",
         "browser_download_url": "https://dl.example/naiveproxy-v131.0.6778.86-1-linux-x64.tar.xz"}
    ]
}"#;

#[tokio::test]
async fn newer_release_matches_by_os_arch_suffix() {
    let base = serve_release(RELEASE).await;
    let url = updater::check_latest_release(
        &reqwest::Client::new(),
        &base,
        "klzgrad",
        "naiveproxy",
        "naiveproxy-v130.0.6723.40-5-linux-x64",
    )
    .await
    .unwrap();
    assert_eq!(
        url.as_deref(),
        Some("https://dl.example/naiveproxy-v131.0.6778.86-1-linux-x64.tar.xz")
    );
}

#[tokio::test]
async fn installed_tag_means_no_update() {
    let base = serve_release(RELEASE).await;
    let url = updater::check_latest_release(
        &reqwest::Client::new(),
        &base,
        "klzgrad",
        "naiveproxy",
        "naiveproxy-v131.0.6778.86-1-linux-x64",
    )
    .await
    .unwrap();
    assert!(url.is_none());
}

#[tokio::test]
async fn missing_arch_asset_is_an_error() {
    let base = serve_release(RELEASE).await;
    let result = updater::check_latest_release(
        &reqwest::Client::new(),
        &base,
        "klzgrad",
        "naiveproxy",
        "naiveproxy-v130.0.6723.40-5-mac-arm64",
    )
    .await;
    assert!(result.is_err());
}
