use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_client_and_server_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("framed_mesh");

    let mut server = spawn(&binary, &["server", "--listen", "127.0.0.1:0"])?;
    let banner = read_line_expect(&mut server.stdout, "waiting for server banner").await?;
    let addr = banner
        .strip_prefix("listening on ")
        .with_context(|| format!("unexpected banner '{banner}'"))?
        .to_string();

    let mut client = spawn(&binary, &["client", "--connect", &addr])?;
    wait_for(
        &mut client.stdout,
        |line| line.starts_with("*** connected to"),
        "client connect",
    )
    .await?;
    wait_for(
        &mut server.stdout,
        |line| line.ends_with("joined"),
        "server join notice",
    )
    .await?;

    client.send_line("(+ 1 2)").await?;
    wait_for(&mut server.stdout, |line| line == "<< 3", "server receipt").await?;
    // The local result and the server's broadcast race on the client's stdout.
    wait_for_all(&mut client.stdout, &["=> 3", "<< 3"], "client results").await?;

    client.send_line("(/ 1 0)").await?;
    wait_for(
        &mut client.stdout,
        |line| line == "!! evaluation failed: division by zero",
        "local error",
    )
    .await?;

    let _ = client.child.kill().await;
    let _ = client.child.wait().await;
    wait_for(
        &mut server.stdout,
        |line| line.contains(" left: "),
        "server disconnect notice",
    )
    .await?;

    let _ = server.child.kill().await;
    let _ = server.child.wait().await;
    Ok(())
}

#[tokio::test]
async fn startup_expressions_run_before_the_console() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("framed_mesh");

    let mut server = spawn(
        &binary,
        &["server", "--listen", "127.0.0.1:0", "-e", "(* 6 7)", "-e", "(concat \"a\" \"b\")"],
    )?;
    read_line_expect(&mut server.stdout, "waiting for server banner").await?;
    assert_eq!(read_line_expect(&mut server.stdout, "first expression").await?, "=> 42");
    assert_eq!(read_line_expect(&mut server.stdout, "second expression").await?, "=> ab");

    let _ = server.child.kill().await;
    let _ = server.child.wait().await;
    Ok(())
}

#[tokio::test]
async fn bind_failure_exits_non_zero() -> Result<()> {
    let taken = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = taken.local_addr()?.to_string();
    let binary = assert_cmd::cargo::cargo_bin!("framed_mesh");

    let mut server = spawn(&binary, &["server", "--listen", &addr])?;
    let status = timeout(READ_TIMEOUT, server.child.wait()).await??;
    assert!(!status.success());
    Ok(())
}

struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

fn spawn(binary: &Path, args: &[&str]) -> Result<Process> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {args:?}"))?;
    let stdin = child.stdin.take().context("stdin missing after spawn")?;
    let stdout = child.stdout.take().context("stdout missing after spawn")?;

    Ok(Process {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

/// Skips lines until one satisfies `matches`.
async fn wait_for(
    reader: &mut BufReader<ChildStdout>,
    matches: impl Fn(&str) -> bool,
    description: &str,
) -> Result<String> {
    loop {
        let line = read_line_expect(reader, description).await?;
        if matches(&line) {
            return Ok(line);
        }
    }
}

async fn wait_for_all(
    reader: &mut BufReader<ChildStdout>,
    expected: &[&str],
    description: &str,
) -> Result<()> {
    let mut missing: Vec<&str> = expected.to_vec();
    while !missing.is_empty() {
        let line = read_line_expect(reader, description).await?;
        missing.retain(|want| *want != line);
    }
    Ok(())
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{description}: timed out waiting for line"))?
        .with_context(|| format!("{description}: failed to read line"))?;
    if read == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
