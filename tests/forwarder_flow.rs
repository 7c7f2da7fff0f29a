//! 转发器错误计数与避让切换的端到端流程
#![cfg(unix)]

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use naiveswitch::app::persist::PersistedState;
use naiveswitch::app::state::GlobalState;
use naiveswitch::app::supervisor::Supervisor;
use naiveswitch::app::switcher::SwitchRequest;
use naiveswitch::proxy::forwarder::{
    self, BufferPool, SERVER_DOWN_FINGERPRINT,
};

/// A stand-in child that answers every connection with the SOCKS refusal
/// reply and closes.
async fn refusing_child() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                let _ = conn.write_all(&SERVER_DOWN_FINGERPRINT).await;
                let _ = conn.shutdown().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
            });
        }
    });
    addr.to_string()
}

async fn client_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accepted, connected) = tokio::join!(listener.accept(), connect);
    (accepted.unwrap().0, connected.unwrap())
}

#[tokio::test]
async fn eleven_refusals_trigger_an_avoid_switch() {
    let state = Arc::new(GlobalState::new(
        std::env::temp_dir(),
        PersistedState::default(),
    ));
    state.set_current_server("https://u:p@a.example:443");

    // Real spawn so the child-present flag is set; `sh` exits right away
    // but the forwarder only checks the flag before dialing.
    let supervisor = Arc::new(Supervisor::new(
        PathBuf::from("/bin"),
        "sh".to_string(),
        state.app_token.clone(),
    ));
    supervisor
        .restart("https://u:p@a.example:443")
        .await
        .unwrap();

    let upstream = refusing_child().await;
    let (switch_tx, mut switch_rx) = mpsc::channel(100);
    let pool = Arc::new(BufferPool::new());

    // keep the user-side sockets open so the upload direction never
    // completes cleanly
    let mut held = Vec::new();
    for _ in 0..11 {
        let (server_side, user_side) = client_pair().await;
        held.push(user_side);
        forwarder::handle_connection(
            state.clone(),
            supervisor.clone(),
            switch_tx.clone(),
            pool.clone(),
            server_side,
            upstream.clone(),
        )
        .await;
    }

    match switch_rx.recv().await.unwrap() {
        SwitchRequest::Avoid { server } => {
            assert_eq!(server, "https://u:p@a.example:443")
        }
        other => panic!("unexpected request: {:?}", other),
    }
    // counter reset after the switch request fired
    assert_eq!(state.error_count.load(Ordering::SeqCst), 0);

    supervisor.stop(Duration::from_millis(200)).await;
    drop(held);
}

#[tokio::test]
async fn no_child_asks_for_an_auto_switch() {
    let state = Arc::new(GlobalState::new(
        std::env::temp_dir(),
        PersistedState::default(),
    ));
    let supervisor = Arc::new(Supervisor::new(
        PathBuf::from("/bin"),
        "sh".to_string(),
        state.app_token.clone(),
    ));

    let (switch_tx, mut switch_rx) = mpsc::channel(100);
    let pool = Arc::new(BufferPool::new());
    let (server_side, _user_side) = client_pair().await;

    forwarder::handle_connection(
        state.clone(),
        supervisor,
        switch_tx,
        pool,
        server_side,
        "127.0.0.1:1".to_string(),
    )
    .await;

    assert!(matches!(
        switch_rx.recv().await.unwrap(),
        SwitchRequest::Auto
    ));
    assert_eq!(state.error_count.load(Ordering::SeqCst), 0);
}
