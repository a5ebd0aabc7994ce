//! Multi-node job standard-stream demultiplexer (spec §5/§6): a small,
//! standalone, single-threaded-in-spirit helper that accepts connections on
//! two listening sockets (out, err), validates a per-job cookie as the
//! first bytes of each accepted connection, and copies stream bytes to its
//! own stdout/stderr until all peers disconnect or its parent exits.
//!
//! Out of scope for the rest of the workspace (spec §1 treats it as an
//! external collaborator); implemented directly here since spec §5/§6/§8
//! pin down its exit codes, cookie protocol, and line-buffering contract
//! in enough literal detail to build and test without further design.
//!
//! Grounded in the teacher's small standalone binaries
//! (`bpmn-lite-server/src/main.rs`'s `tokio::main` + `tracing-subscriber`
//! bootstrap) generalized to a two-listener accept loop, plus `nix`'s
//! `kill(pid, None)`/`ESRCH` idiom for parent-liveness checks (same crate
//! and pattern the wider example pack uses for signal-adjacent work).

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::{getppid, Pid};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Exit codes exactly as spec §6 "Environment" pins them down.
mod exit_code {
    pub const IO_ERROR: u8 = 1;
    pub const ALLOCATION_FAILURE: u8 = 2;
    pub const MISSING_COOKIE: u8 = 3;
    pub const LISTEN_FAILURE: u8 = 5;
}

/// Which stream a listener's accepted connections are routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Out,
    Err,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cookie = match std::env::var("JOBCOOKIE") {
        Ok(c) => c,
        Err(_) => {
            tracing::error!("JOBCOOKIE is not set");
            return ExitCode::from(exit_code::MISSING_COOKIE);
        }
    };

    // Positional <out_port> <err_port>: the two listening sockets the
    // parent execution daemon wired up for this job's stdout/stderr.
    // Parsing failure ahead of any syscall is this binary's equivalent of
    // the original's pre-listen allocation failure (spec §6 exit code 2) —
    // a setup-resource problem distinct from the listen() call itself.
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (out_port, err_port) = match parse_ports(&args) {
        Some(ports) => ports,
        None => {
            tracing::error!("usage: batch-stream-demux <out_port> <err_port>");
            return ExitCode::from(exit_code::ALLOCATION_FAILURE);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build async runtime");
            return ExitCode::from(exit_code::ALLOCATION_FAILURE);
        }
    };

    runtime.block_on(async_main(cookie, out_port, err_port))
}

fn parse_ports(args: &[String]) -> Option<(u16, u16)> {
    if args.len() != 2 {
        return None;
    }
    let out_port = args[0].parse::<u16>().ok()?;
    let err_port = args[1].parse::<u16>().ok()?;
    Some((out_port, err_port))
}

async fn async_main(cookie: String, out_port: u16, err_port: u16) -> ExitCode {
    let out_listener = match TcpListener::bind(("127.0.0.1", out_port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = out_port, "failed to bind out listener");
            return ExitCode::from(exit_code::LISTEN_FAILURE);
        }
    };
    let err_listener = match TcpListener::bind(("127.0.0.1", err_port)).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, port = err_port, "failed to bind err listener");
            return ExitCode::from(exit_code::LISTEN_FAILURE);
        }
    };

    let cookie = Arc::new(cookie);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let parent_pid = getppid();
    tokio::spawn(watch_parent(parent_pid, shutdown_tx));

    let out_task = tokio::spawn(accept_loop(out_listener, Stream::Out, cookie.clone(), shutdown_rx.clone()));
    let err_task = tokio::spawn(accept_loop(err_listener, Stream::Err, cookie, shutdown_rx));

    let (out_result, err_result) = tokio::join!(out_task, err_task);
    if out_result.is_err() || err_result.is_err() {
        return ExitCode::from(exit_code::IO_ERROR);
    }
    ExitCode::SUCCESS
}

/// Polls the parent's liveness by signalling it with signal 0 (spec §6:
/// "detected by signalling the parent pid with 0 and receiving ESRCH").
/// A successful signal or any error other than `ESRCH` means the parent is
/// still presumed alive; `ESRCH` ends the loop by flipping the shutdown
/// watch.
async fn watch_parent(parent_pid: Pid, shutdown_tx: watch::Sender<bool>) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(500));
    loop {
        interval.tick().await;
        match kill(parent_pid, None) {
            Ok(()) => continue,
            Err(Errno::ESRCH) => {
                tracing::info!("parent process gone, shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            Err(_) => continue,
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    stream: Stream,
    cookie: Arc<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _addr)) => {
                        let cookie = cookie.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, stream, &cookie).await {
                                tracing::warn!(error = %e, ?stream, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, ?stream, "accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

/// Spec §6 "Stream-demultiplexer protocol": the first bytes on a freshly
/// accepted connection must be exactly the job cookie. A mismatch closes
/// the socket with no data written anywhere; a match routes every
/// subsequent byte, line-buffered, to this process's stdout or stderr,
/// flushing on each newline.
async fn handle_connection(mut socket: TcpStream, stream: Stream, cookie: &str) -> anyhow::Result<()> {
    let mut prefix = vec![0u8; cookie.len()];
    if socket.read_exact(&mut prefix).await.is_err() {
        return Ok(()); // connection closed before sending a full cookie; drop silently
    }
    if prefix != cookie.as_bytes() {
        tracing::warn!(?stream, "cookie mismatch, closing connection");
        return Ok(());
    }

    let mut line = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            if !line.is_empty() {
                write_line(stream, &line)?;
            }
            return Ok(());
        }
        for &b in &chunk[..n] {
            line.push(b);
            if b == b'\n' {
                write_line(stream, &line)?;
                line.clear();
            }
        }
    }
}

/// Writes one buffered line (including its trailing newline, if present)
/// to stdout or stderr and flushes immediately.
fn write_line(stream: Stream, bytes: &[u8]) -> anyhow::Result<()> {
    match stream {
        Stream::Out => {
            let mut out = std::io::stdout().lock();
            out.write_all(bytes)?;
            out.flush()?;
        }
        Stream::Err => {
            let mut err = std::io::stderr().lock();
            err.write_all(bytes)?;
            err.flush()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt as _;

    #[tokio::test]
    async fn cookie_mismatch_closes_without_writing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cookie = Arc::new("ABCD".to_string());

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_connection(socket, Stream::Out, &cookie).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"XYZ\n").await.unwrap();
        drop(client);

        let result = server.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn matching_cookie_is_consumed_before_data_routing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cookie = Arc::new("ABCD".to_string());

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_connection(socket, Stream::Out, &cookie).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ABCDhello\n").await.unwrap();
        drop(client);

        server.await.unwrap().unwrap();
    }

    #[test]
    fn parse_ports_requires_exactly_two_numeric_args() {
        assert_eq!(parse_ports(&["123".into(), "456".into()]), Some((123, 456)));
        assert_eq!(parse_ports(&["123".into()]), None);
        assert_eq!(parse_ports(&["abc".into(), "456".into()]), None);
    }
}
