//! End-to-end tests: a host drives a sandbox over an in-process port pair.
//!
//! The engine is a fake that interprets a few module names, so these tests
//! exercise the archive loader, RPC, bridge and stdin channel together.

#![allow(clippy::unwrap_used)] // unwrap is acceptable in tests

use std::io::Write;
use std::sync::{Arc, Once};
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use futures::future::join_all;
use tokio::time::timeout;

use cradle::fs::FileContent;
use cradle::rpc::RpcError;
use cradle::{
    ConnectOptions, Connection, Engine, EngineError, EngineExit, EngineOutput, FileSystemMap,
    Invocation, Sandbox, SandboxClient, SandboxConfig, SandboxContext, SandboxError,
    SandboxHandler, StdinRead, bridge, extract_archive, port_pair,
};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("cradle=debug")
            .with_test_writer()
            .init();
    });
}

const HOST: &str = "https://host.test";
const SANDBOX: &str = "https://sandbox.test";

/// `python` prints its entry file, `cat` copies stdin, `sleep` waits,
/// `crash` panics after some output and `write` creates a file.
fn fake_engine() -> Arc<dyn Engine> {
    bridge::from_fn(|mut inv: Invocation, out: &mut EngineOutput| {
        match inv.module.as_str() {
            "python" => {
                let entry = inv.args.last().cloned().unwrap_or_default();
                match inv.fs.get(&entry) {
                    Some(file) => out.stdout(&file.content().to_text_lossy()),
                    None => {
                        out.stderr(&format!("can't open file '{entry}'\n"));
                        return Ok(EngineExit {
                            exit_code: 2,
                            fs: inv.fs,
                        });
                    }
                }
            }
            "cat" => {
                out.stdout("> ");
                while let StdinRead::Data(bytes) = inv.stdin.read(256) {
                    out.stdout(&String::from_utf8_lossy(&bytes));
                }
            }
            "sleep" => {
                let ms = inv.args.first().and_then(|a| a.parse().ok()).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(ms));
                out.stdout(&format!("slept {ms}"));
            }
            "write" => {
                let path = inv.args.first().cloned().unwrap_or_default();
                inv.fs.write(&path, inv.args.get(1..).unwrap_or_default().join(" "));
            }
            "crash" => {
                out.stdout("partial");
                panic!("guest trapped");
            }
            other => return Err(EngineError::ModuleNotFound(other.to_string())),
        }
        Ok(EngineExit {
            exit_code: 0,
            fs: inv.fs,
        })
    })
}

fn archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, body.as_bytes())
            .unwrap();
    }
    let mut encoder = builder.into_inner().unwrap();
    encoder.flush().unwrap();
    encoder.finish().unwrap()
}

/// Start a sandbox on one end of a port pair and connect a client to it.
async fn start(config: SandboxConfig) -> (SandboxClient, SandboxContext, Connection) {
    init_tracing();
    let (host_port, sandbox_port) = port_pair(HOST, SANDBOX);
    let context = SandboxContext::new(fake_engine(), config);

    let server = tokio::spawn(SandboxHandler::serve(
        sandbox_port,
        context.clone(),
        ConnectOptions::default().allow_origin(HOST),
    ));
    let client = SandboxClient::connect(host_port, ConnectOptions::default().allow_origin(SANDBOX))
        .await
        .unwrap();
    let connection = server.await.unwrap().unwrap();
    (client, context, connection)
}

#[tokio::test]
async fn test_run_archive_over_rpc() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;
    let fs = extract_archive(&archive(&[
        ("app/main.py", "print('hello')\n"),
        ("app/data.csv", "a,b\n"),
    ]))
    .unwrap();

    let result = client
        .headless_run_fs("python", "/app/main.py", fs.clone(), None)
        .await
        .unwrap();

    assert_eq!(result.stdout, "print('hello')\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.fs, fs);
}

#[tokio::test]
async fn test_headless_stdin_round_trip() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;

    let result = client
        .headless_unsafe_command("cat", FileSystemMap::new(), Some("line one\nline two\n"))
        .await
        .unwrap();

    assert_eq!(result.stdin, "line one\nline two\n");
    assert_eq!(result.stdout, "> line one\nline two\n");
}

#[tokio::test]
async fn test_filesystem_changes_come_back() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;

    let result = client
        .headless_unsafe_command("write /out.txt hello world", FileSystemMap::new(), None)
        .await
        .unwrap();

    let file = result.fs.get("/out.txt").unwrap();
    assert_eq!(file.content(), &FileContent::Text("hello world".into()));
}

#[tokio::test]
async fn test_concurrent_runs_resolve_independently() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;

    // Longest first, so replies come back in reverse order.
    let runs = [150, 100, 50, 0].map(|ms| {
        let client = client.clone();
        async move {
            client
                .headless_unsafe_command(&format!("sleep {ms}"), FileSystemMap::new(), None)
                .await
        }
    });
    let results = timeout(Duration::from_secs(10), join_all(runs)).await.unwrap();

    let stdout: Vec<_> = results.into_iter().map(|r| r.unwrap().stdout).collect();
    assert_eq!(stdout, ["slept 150", "slept 100", "slept 50", "slept 0"]);
}

#[tokio::test]
async fn test_remote_errors_are_verbatim() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;

    let err = client
        .headless_run_code("cobol", "DISPLAY 'HI'.", None)
        .await
        .unwrap_err();
    match err {
        SandboxError::Rpc(RpcError::Remote(err)) => {
            assert_eq!(err.message, "unknown runtime: cobol");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_worker_crash_is_reported() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;

    let err = client
        .headless_unsafe_command("crash", FileSystemMap::new(), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("guest trapped"), "{err}");

    // The sandbox keeps serving after a crashed run.
    let result = client
        .headless_run_code("python", "ok", None)
        .await
        .unwrap();
    assert_eq!(result.stdout, "ok");
}

#[tokio::test]
async fn test_crash_keeps_partial_output_across_rpc() {
    let (client, _context, _server) = start(SandboxConfig::default()).await;

    let err = client
        .headless_unsafe_command("crash", FileSystemMap::new(), None)
        .await
        .unwrap_err();

    match &err {
        SandboxError::RunFailed { message, partial } => {
            assert!(message.contains("guest trapped"), "{message}");
            assert_eq!(partial.stdout, "partial");
            assert_eq!(partial.stderr, "");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.partial().unwrap().stdout, "partial");
}

#[tokio::test]
async fn test_interactive_run_with_terminal_input() {
    let (client, context, _server) = start(SandboxConfig::default()).await;
    let terminal = context.terminal().clone();
    let mut output = terminal.subscribe();

    let run = tokio::spawn(async move {
        client
            .interactive_unsafe_command("cat", FileSystemMap::new())
            .await
    });

    let prompt = timeout(Duration::from_secs(5), output.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prompt.text, "> ");

    terminal.input("typed\n").unwrap();
    terminal.end_input();
    let result = timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(result.stdin, "typed\n");
    assert_eq!(result.stdout, "> typed\n");
    assert_eq!(result.tty, "> typed\ntyped\n");
}

#[tokio::test]
async fn test_editor_control() {
    let (client, context, _server) = start(SandboxConfig::default()).await;

    client.show_editor().await.unwrap();
    client
        .set_editor_program(cradle::sandbox::SetEditorProgramArgs {
            syntax: "python".into(),
            runtime: "python".into(),
            code: "print(1)".into(),
        })
        .await
        .unwrap();

    let editor = context.editor();
    assert!(editor.visible);
    assert_eq!(editor.program.unwrap().code, "print(1)");

    client.hide_editor().await.unwrap();
    assert!(!context.editor().visible);
}

#[tokio::test]
async fn test_close_tears_down_both_sides() {
    let (client, _context, server) = start(SandboxConfig::default()).await;

    client.close().await;
    timeout(Duration::from_secs(5), server.closed()).await.unwrap();

    let err = client.show_editor().await.unwrap_err();
    assert!(matches!(err, SandboxError::Rpc(RpcError::ConnectionClosed)));
}
