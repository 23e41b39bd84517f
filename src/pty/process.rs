use std::io::Read;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{broadcast, mpsc, watch};

use crate::error::{DeadProcessError, SpawnError};

/// How long an input write may wait for queue space before being dropped.
/// Keeps a wedged shell from deadlocking the connection's dispatch task.
const INPUT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of the single-writer input queue per process (chunks).
const INPUT_QUEUE_DEPTH: usize = 256;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Bytes of output retained for replay after reconnect (tail-trimmed)
    pub replay_buffer_bytes: usize,
    /// Capacity of the output fan-out channel (chunks)
    pub output_channel_capacity: usize,
}

/// Bounded tail buffer of PTY output, replayed to a client on reconnect.
/// Chunks are numbered; a snapshot carries the seq of the first chunk it
/// does NOT contain, so a subscriber can drop live chunks already replayed.
struct ReplayBuffer {
    data: Vec<u8>,
    max: usize,
    seq: u64,
}

impl ReplayBuffer {
    /// Append a chunk and return its sequence number.
    fn push(&mut self, chunk: &[u8]) -> u64 {
        let assigned = self.seq;
        self.seq += 1;
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.max {
            let excess = self.data.len() - self.max;
            self.data.drain(..excess);
        }
        assigned
    }
}

/// One PTY-backed shell process. Owns the master handle, the child killer,
/// the single-writer input queue, and the output fan-out channel. All OS
/// resources are released when the value drops, on every exit path.
pub struct PtyProcess {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    input_tx: mpsc::Sender<Bytes>,
    output_tx: broadcast::Sender<(u64, Bytes)>,
    replay: Arc<Mutex<ReplayBuffer>>,
    exited: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<u32>>,
    /// Last geometry applied to the PTY, for idempotent resize
    size: Mutex<(u16, u16)>,
}

impl PtyProcess {
    /// Spawn a shell on a fresh PTY with the given initial geometry.
    /// Resource/exec failures are hard errors reported to the caller;
    /// later process exit is an event, not an error.
    pub fn spawn(opts: &SpawnOptions) -> Result<Self, SpawnError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError(e.to_string()))?;

        let cmd = CommandBuilder::new(&opts.shell);
        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError(e.to_string()))?;
        // Close our copy of the slave so reads see EOF when the child exits
        drop(pair.slave);

        let killer = child.clone_killer();
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError(e.to_string()))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError(e.to_string()))?;

        let (output_tx, _) = broadcast::channel(opts.output_channel_capacity);
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(INPUT_QUEUE_DEPTH);
        let (exit_tx, exit_rx) = watch::channel(None);

        let replay = Arc::new(Mutex::new(ReplayBuffer {
            data: Vec::new(),
            max: opts.replay_buffer_bytes,
            seq: 0,
        }));
        let exited = Arc::new(AtomicBool::new(false));

        // Reader: blocking loop on the master. Broadcast drops oldest for
        // lagging receivers, so a slow client never stalls this read.
        {
            let output_tx = output_tx.clone();
            let replay = replay.clone();
            let exited = exited.clone();
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_CHUNK_SIZE];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            // Seq assignment and buffering share the lock a
                            // snapshot takes, so a snapshot's cursor is
                            // consistent with its contents
                            let seq = match replay.lock() {
                                Ok(mut rb) => rb.push(&buf[..n]),
                                Err(_) => break,
                            };
                            let _ = output_tx.send((seq, Bytes::copy_from_slice(&buf[..n])));
                        }
                    }
                }

                exited.store(true, Ordering::SeqCst);
                let code = child.wait().ok().map(|status| status.exit_code());
                let _ = exit_tx.send(Some(code.unwrap_or(0)));
            });
        }

        // Writer: the only task that touches the process's input stream
        tokio::task::spawn_blocking(move || {
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() || writer.flush().is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            input_tx,
            output_tx,
            replay,
            exited,
            exit_rx,
            size: Mutex::new((opts.cols, opts.rows)),
        })
    }

    /// Queue raw bytes for the process's input stream, in order.
    pub async fn write(&self, data: Bytes) -> Result<(), DeadProcessError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(DeadProcessError);
        }

        match tokio::time::timeout(INPUT_SEND_TIMEOUT, self.input_tx.send(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeadProcessError),
            Err(_) => {
                tracing::warn!("PTY input queue full, dropping input");
                Ok(())
            }
        }
    }

    /// Apply a window-size change. Skips the ioctl when the geometry is
    /// unchanged, so repeated identical resizes are free.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        {
            let mut size = self.size.lock().expect("size lock poisoned");
            if *size == (cols, rows) {
                return Ok(());
            }
            *size = (cols, rows);
        }

        let master = self.master.lock().expect("master lock poisoned");
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| anyhow::anyhow!("resize failed: {}", e))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(u64, Bytes)> {
        self.output_tx.subscribe()
    }

    /// Tail of output produced so far plus the seq of the first chunk not
    /// contained in it. Subscribe before snapshotting and drop live chunks
    /// below the cursor; nothing is then lost or delivered twice.
    pub fn replay_snapshot(&self) -> (Vec<u8>, u64) {
        self.replay
            .lock()
            .map(|rb| (rb.data.clone(), rb.seq))
            .unwrap_or_default()
    }

    /// Receiver that yields the exit code once the process has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<u32>> {
        self.exit_rx.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Terminate the process. Idempotent; killing an exited process is a no-op.
    pub fn kill(&self) {
        let mut killer = self.killer.lock().expect("killer lock poisoned");
        let _ = killer.kill();
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // Guarantee release on every exit path; the reader task reaps the child
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_opts() -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            cols: 80,
            rows: 24,
            replay_buffer_bytes: 64 * 1024,
            output_channel_capacity: 256,
        }
    }

    /// Collect output until `needle` appears or the timeout passes.
    async fn wait_for_output(
        rx: &mut broadcast::Receiver<(u64, Bytes)>,
        needle: &str,
        timeout: Duration,
    ) -> String {
        let deadline = Instant::now() + timeout;
        let mut collected = String::new();
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok((_, bytes))) => {
                    collected.push_str(&String::from_utf8_lossy(&bytes));
                    if collected.contains(needle) {
                        return collected;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                _ => break,
            }
        }
        collected
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        let mut rx = pty.subscribe();

        pty.write(Bytes::from("echo hello-pty\n")).await.unwrap();
        let out = wait_for_output(&mut rx, "hello-pty", Duration::from_secs(5)).await;
        assert!(out.contains("hello-pty"), "output was: {out:?}");
    }

    #[tokio::test]
    async fn test_replay_buffer_captures_output() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        let mut rx = pty.subscribe();

        pty.write(Bytes::from("echo replay-me\n")).await.unwrap();
        wait_for_output(&mut rx, "replay-me", Duration::from_secs(5)).await;

        // Subscribe-then-snapshot, the reconnect order: dropping live chunks
        // below the cursor must keep new output and skip everything the
        // snapshot already holds
        let mut late_rx = pty.subscribe();
        let (replay, cursor) = pty.replay_snapshot();
        assert!(String::from_utf8_lossy(&replay).contains("replay-me"));
        assert!(cursor > 0);

        pty.write(Bytes::from("echo after-snap\n")).await.unwrap();
        let mut fresh = String::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline && !fresh.contains("after-snap") {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, late_rx.recv()).await {
                Ok(Ok((seq, bytes))) => {
                    if seq >= cursor {
                        fresh.push_str(&String::from_utf8_lossy(&bytes));
                    }
                }
                _ => break,
            }
        }
        assert!(fresh.contains("after-snap"), "live output was: {fresh:?}");
        assert!(!fresh.contains("replay-me"), "replayed chunk leaked: {fresh:?}");
    }

    #[test]
    fn test_replay_buffer_seq_advances_past_trim() {
        let mut rb = ReplayBuffer {
            data: Vec::new(),
            max: 8,
            seq: 0,
        };
        assert_eq!(rb.push(b"aaaa"), 0);
        assert_eq!(rb.push(b"bbbb"), 1);
        // Trimmed out of the data, but seqs keep counting
        assert_eq!(rb.push(b"cccc"), 2);
        assert_eq!(rb.data, b"bbbbcccc");
        assert_eq!(rb.seq, 3);
    }

    #[tokio::test]
    async fn test_resize_is_idempotent() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        pty.resize(100, 40).unwrap();
        // Second identical call must be harmless
        pty.resize(100, 40).unwrap();
        pty.resize(80, 24).unwrap();
    }

    #[tokio::test]
    async fn test_exit_reported_and_writes_rejected() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        let mut exit_rx = pty.exit_watch();

        pty.write(Bytes::from("exit 3\n")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while exit_rx.borrow().is_none() {
                exit_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("process did not exit");

        assert!(pty.is_dead());
        assert!(pty.write(Bytes::from("ignored\n")).await.is_err());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        pty.kill();
        pty.kill();

        let mut exit_rx = pty.exit_watch();
        tokio::time::timeout(Duration::from_secs(5), async {
            while exit_rx.borrow().is_none() {
                exit_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("killed process did not report exit");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let mut opts = test_opts();
        opts.shell = "/nonexistent/shell-binary".to_string();
        assert!(PtyProcess::spawn(&opts).is_err());
    }

    #[tokio::test]
    async fn test_large_output_order_preserved() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        let mut rx = pty.subscribe();

        // Needle split so the command echo itself never matches
        pty.write(Bytes::from("seq 1 10000; printf 'EN''D\\n'\n"))
            .await
            .unwrap();
        let out = wait_for_output(&mut rx, "END", Duration::from_secs(30)).await;

        let nums: Vec<u32> = out
            .lines()
            .filter_map(|l| l.trim().parse::<u32>().ok())
            .collect();
        assert!(nums.len() > 5000, "too little output seen: {}", nums.len());
        assert!(
            nums.windows(2).all(|w| w[0] < w[1]),
            "output chunks reordered"
        );
    }

    #[tokio::test]
    async fn test_output_order_preserved() {
        let pty = PtyProcess::spawn(&test_opts()).unwrap();
        let mut rx = pty.subscribe();

        pty.write(Bytes::from("for i in 1 2 3 4 5; do echo line-$i; done\n"))
            .await
            .unwrap();
        let out = wait_for_output(&mut rx, "line-5", Duration::from_secs(5)).await;

        let positions: Vec<_> = (1..=5)
            .map(|i| out.find(&format!("line-{i}")).expect("missing line"))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();
        assert_eq!(positions, sorted, "output chunks reordered: {out:?}");
    }
}
