//! Child process plumbing
//!
//! Shared by the CLI runner and the API server: UTF-8 environment, merged
//! line streaming and graceful termination.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long a terminated child gets before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Default the Python I/O encoding to UTF-8 unless the caller set it.
///
/// ACE-Step prints emoji, which crashes on legacy Windows code pages.
pub fn apply_utf8_env(cmd: &mut Command) {
    for (key, value) in [
        ("PYTHONIOENCODING", "utf-8"),
        ("PYTHONUTF8", "1"),
        ("LANG", "C.UTF-8"),
        ("LC_ALL", "C.UTF-8"),
    ] {
        if std::env::var_os(key).is_none() {
            cmd.env(key, value);
        }
    }
}

/// Forward each line of `reader` into `tx` until EOF.
///
/// Bytes that are not valid UTF-8 are replaced, so no line is lost.
pub fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(decode_line(&buf)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Output stream closed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Decode one raw line, dropping the line terminator.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Merge a child's stdout and stderr into one line channel.
pub fn merge_output(child: &mut Child) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }
    rx
}

/// Ask the child to exit, then kill it after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    send_terminate(child).await;
    if timeout(grace, child.wait()).await.is_err() {
        tracing::warn!("Process did not exit within {:?}, killing it", grace);
        if let Err(e) = child.kill().await {
            tracing::warn!("Failed to kill process: {}", e);
        }
    }
}

#[cfg(unix)]
async fn send_terminate(child: &mut Child) {
    let Some(pid) = child.id() else { return };
    let sent = Command::new("kill")
        .args(["-TERM", &pid.to_string()])
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false);
    if !sent {
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
async fn send_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

/// Render a command line for logs, quoting arguments that need it.
pub fn quote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_arg(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let safe = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_command() {
        let args = vec![
            "/env/bin/python".to_string(),
            "cli.py".to_string(),
            "-c".to_string(),
            "/out dir/it's.toml".to_string(),
            String::new(),
        ];
        assert_eq!(
            quote_command(&args),
            "/env/bin/python cli.py -c '/out dir/it'\"'\"'s.toml' ''"
        );
    }

    #[tokio::test]
    async fn test_invalid_utf8_lines_are_kept() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raw: &'static [u8] = b"step 1\nbad \xff byte\r\nlast";
        forward_lines(raw, tx).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["step 1", "bad \u{FFFD} byte", "last"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_merge_output_and_terminate() {
        let mut child = Command::new("sh")
            .args(["-c", "echo out; echo err 1>&2; sleep 30"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let mut rx = merge_output(&mut child);
        let mut lines = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        lines.sort();
        assert_eq!(lines, vec!["err", "out"]);

        terminate(&mut child, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }
}
