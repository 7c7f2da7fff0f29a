use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::app::state::GlobalState;
use crate::app::supervisor::{Supervisor, UPSTREAM_LISTEN};
use crate::app::switcher::SwitchRequest;
use crate::common::Downgrade;

/// SOCKS5 "connection refused" reply: exactly these 12 bytes, alone on the
/// wire with a dead upload direction, mean the upstream rejected us.
pub const SERVER_DOWN_FINGERPRINT: [u8; 12] = [5, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];

/// Error count that triggers an avoid-switch.
const ERROR_SWITCH_THRESHOLD: i32 = 10;
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);
const BUF_SIZE: usize = 32 * 1024;
const POOL_MAX: usize = 256;

/// Relay buffer pool; recycles 32 KiB buffers across connections.
pub struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Vec<u8> {
        if let Ok(mut bufs) = self.bufs.lock() {
            if let Some(buf) = bufs.pop() {
                return buf;
            }
        }
        vec![0u8; BUF_SIZE]
    }

    fn put(&self, buf: Vec<u8>) {
        if let Ok(mut bufs) = self.bufs.lock() {
            if bufs.len() < POOL_MAX {
                bufs.push(buf);
            }
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接转发服务
///
/// Accepts client connections and relays each through the child's loopback
/// SOCKS endpoint. Relay outcomes feed the error counter; the counter feeds
/// the switch channel.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GlobalState>,
    supervisor: Arc<Supervisor>,
    do_switch: mpsc::Sender<SwitchRequest>,
) {
    let pool = Arc::new(BufferPool::new());
    loop {
        match listener.accept().await {
            Ok((conn, _)) => {
                tokio::spawn(handle_connection(
                    state.clone(),
                    supervisor.clone(),
                    do_switch.clone(),
                    pool.clone(),
                    conn,
                    UPSTREAM_LISTEN.to_string(),
                ));
            }
            Err(e) => {
                debug!(error = %e, "accept failed");
                continue;
            }
        }
    }
}

pub async fn handle_connection(
    state: Arc<GlobalState>,
    supervisor: Arc<Supervisor>,
    do_switch: mpsc::Sender<SwitchRequest>,
    pool: Arc<BufferPool>,
    conn: TcpStream,
    upstream: String,
) {
    if !supervisor.child_running() {
        debug!("no naive running");
        let _ = do_switch.send(SwitchRequest::Auto).await;
        return;
    }

    let down = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&upstream)).await {
        Ok(Ok(child_conn)) => relay_and_sniff(conn, child_conn, &pool).await,
        Ok(Err(e)) => {
            debug!(error = %e, "dialing upstream child failed");
            true
        }
        Err(_) => {
            debug!("dialing upstream child timed out");
            true
        }
    };

    if down {
        let count = state.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > ERROR_SWITCH_THRESHOLD {
            state.error_count.store(0, Ordering::SeqCst);
            debug!(count = count, "too many errors, switching server");
            let _ = do_switch
                .send(SwitchRequest::Avoid {
                    server: state.current_server(),
                })
                .await;
        }
    } else {
        state.decrement_error_count();
    }
}

/// Relay both directions and report whether the exchange looked like a
/// server-down reply.
///
/// The upload direction (client → child) runs in the background and records
/// whether it completed cleanly. The download direction runs here through
/// the downgraded wrappers so every upstream byte crosses our buffer; the
/// first 12 land in the sniff window.
async fn relay_and_sniff(client: TcpStream, child: TcpStream, pool: &BufferPool) -> bool {
    let (mut client_read, client_write) = client.into_split();
    let (child_read, mut child_write) = child.into_split();

    let remote_ok = Arc::new(AtomicBool::new(false));
    let remote_ok_flag = remote_ok.clone();
    let upload = tokio::spawn(async move {
        let ok = tokio::io::copy(&mut client_read, &mut child_write)
            .await
            .is_ok();
        remote_ok_flag.store(ok, Ordering::SeqCst);
        let _ = child_write.shutdown().await;
    });

    let mut reader = Downgrade::new(child_read);
    let mut writer = Downgrade::new(client_write);

    let mut buf = pool.get();
    let mut written: u64 = 0;
    let mut head = [0u8; 12];
    let mut head_len = 0usize;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        if head_len < head.len() {
            let take = (head.len() - head_len).min(n);
            head[head_len..head_len + take].copy_from_slice(&buf[..take]);
            head_len += take;
        }
        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        written += n as u64;
    }
    pool.put(buf);

    // Sample the upload outcome before tearing it down; the abort below
    // must not count as a failed upload.
    let remote_ok = remote_ok.load(Ordering::SeqCst);
    let down = is_server_down(written, &head[..head_len], remote_ok);

    // Unblocks a still-pending upload read; dropping the halves closes both
    // sockets.
    upload.abort();

    down
}

/// Down iff the upload broke, exactly 12 bytes came back, and they match
/// the refusal fingerprint.
pub fn is_server_down(written: u64, head: &[u8], remote_ok: bool) -> bool {
    if remote_ok {
        return false;
    }
    if written != 12 {
        return false;
    }
    head == SERVER_DOWN_FINGERPRINT
}
