//! 订阅 wire 格式端到端测试：双层 base64 解码

use axum::routing::get;
use base64::prelude::{Engine as _, BASE64_STANDARD};

use naiveswitch::app::subscription;

/// Serve `body` at `/sub` on a random port and return the full URL.
async fn serve_feed(body: &'static str) -> String {
    let router = axum::Router::new().route("/sub", get(move || async move { body }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/sub", addr)
}

fn encode_feed(entries: &[&str]) -> String {
    let lines: Vec<String> = entries
        .iter()
        .map(|entry| format!("naive+https://{}", BASE64_STANDARD.encode(entry)))
        .collect();
    BASE64_STANDARD.encode(lines.join("\n"))
}

#[tokio::test]
async fn fetch_decodes_feed_in_order() {
    let body: &'static str = Box::leak(
        encode_feed(&[
            "u:p@a.example:443",
            "u:p@b.example:443",
            "u:p@c.example:443",
        ])
        .into_boxed_str(),
    );
    let url = serve_feed(body).await;

    let urls = subscription::fetch(&reqwest::Client::new(), &url)
        .await
        .unwrap();
    assert_eq!(
        urls,
        vec![
            "https://u:p@a.example:443".to_string(),
            "https://u:p@b.example:443".to_string(),
            "https://u:p@c.example:443".to_string(),
        ]
    );
}

#[tokio::test]
async fn fetch_rejects_plain_text_body() {
    let url = serve_feed("this is not a subscription feed at all!").await;
    assert!(subscription::fetch(&reqwest::Client::new(), &url)
        .await
        .is_err());
}

#[tokio::test]
async fn fetch_surfaces_network_errors() {
    // nothing listens here
    let result =
        subscription::fetch(&reqwest::Client::new(), "http://127.0.0.1:1/sub").await;
    assert!(result.is_err());
}
