use std::{io::ErrorKind, process::Stdio, str::FromStr, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::error::Error;

use super::{Cidr, Key, List, WgState, WireguardApi, dump::parse_dump};

const WG: &str = "wg";
const WG_QUICK: &str = "wg-quick";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives the daemon through the `wg` userspace tool.
#[derive(Debug, Clone)]
pub struct WgCmdBackend {
    timeout: Duration,
}

impl Default for WgCmdBackend {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl WgCmdBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<String>,
    ) -> Result<String, Error> {
        log::debug!("{program} {}", args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| match err.kind() {
            ErrorKind::NotFound => Error::DaemonUnavailable(format!("{program} not found")),
            _ => Error::DaemonUnavailable(format!("cannot run {program}: {err}")),
        })?;

        let pipe = child.stdin.take();
        let exchange = async move {
            if let (Some(input), Some(mut pipe)) = (stdin, pipe) {
                match pipe.write_all(input.as_bytes()).await {
                    // exit status tells what went wrong
                    Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                        log::debug!("{program} closed stdin early");
                    }
                    res => res?,
                }
            }

            child.wait_with_output().await
        };

        let out = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(out)) => out,
            Ok(Err(err)) => {
                return Err(Error::DaemonCommandFailed {
                    exit_code: None,
                    stderr: format!("{program}: {err}"),
                });
            }
            Err(_) => {
                return Err(Error::DaemonCommandFailed {
                    exit_code: None,
                    stderr: format!("{program} timed out after {:?}", self.timeout),
                });
            }
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            return Err(classify_failure(out.status.code(), stderr));
        }

        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    async fn wg(&self, args: &[&str]) -> Result<String, Error> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run(WG, &args, None).await
    }
}

/// A missing interface is a setup problem, anything else may be transient.
fn classify_failure(exit_code: Option<i32>, stderr: String) -> Error {
    if stderr.contains("No such device") || stderr.contains("Unable to access interface") {
        Error::DaemonUnavailable(stderr)
    } else {
        Error::DaemonCommandFailed { exit_code, stderr }
    }
}

impl WireguardApi for WgCmdBackend {
    type Error = Error;

    async fn get_pub_key(&self, iface: &str) -> Result<Key, Self::Error> {
        let out = self.wg(&["show", iface, "public-key"]).await?;

        Ok(Key::from_str(out.trim())?)
    }

    async fn add_peer(
        &self,
        iface: &str,
        peer: Key,
        allowed_ips: &[Cidr],
        preshared_key: Option<Key>,
    ) -> Result<(), Self::Error> {
        let mut args = vec![
            "set".to_string(),
            iface.to_string(),
            "peer".to_string(),
            peer.to_string(),
            "allowed-ips".to_string(),
            List(allowed_ips.to_vec()).to_string().replace(' ', ""),
        ];

        let stdin = preshared_key.map(|psk| {
            args.push("preshared-key".to_string());
            args.push("/dev/stdin".to_string());
            format!("{psk}\n")
        });

        self.run(WG, &args, stdin).await?;

        Ok(())
    }

    async fn remove_peer(&self, iface: &str, peer: Key) -> Result<(), Self::Error> {
        let peer = peer.to_string();
        self.wg(&["set", iface, "peer", peer.as_str(), "remove"])
            .await?;

        Ok(())
    }

    async fn dump(&self, iface: &str) -> Result<WgState, Self::Error> {
        let out = self.wg(&["show", iface, "dump"]).await?;

        Ok(parse_dump(&out))
    }

    async fn save(&self, iface: &str) -> Result<(), Self::Error> {
        self.run(WG_QUICK, &["save".to_string(), iface.to_string()], None)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::Error;

    use super::{WgCmdBackend, classify_failure};

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure(Some(1), "Unable to access interface: No such device".into()),
            Error::DaemonUnavailable(_)
        ));

        let err = classify_failure(Some(1), "Invalid argument".into());
        assert!(err.is_transient());
        assert!(matches!(
            err,
            Error::DaemonCommandFailed {
                exit_code: Some(1),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let backend = WgCmdBackend::new(Duration::from_millis(100));
        let res = backend.run("wg-warden-no-such-binary", &[], None).await;

        assert!(matches!(res, Err(Error::DaemonUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unrunnable_binary_is_unavailable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let backend = WgCmdBackend::new(Duration::from_millis(500));
        let res = backend.run(&path, &[], None).await;

        assert!(matches!(res, Err(Error::DaemonUnavailable(_))));
    }

    #[tokio::test]
    async fn test_stdin_closed_early_uses_exit_status() {
        let backend = WgCmdBackend::new(Duration::from_secs(5));

        let res = backend.run("true", &[], Some("x".repeat(1 << 20))).await;
        assert_eq!(res.unwrap(), "");

        let res = backend.run("false", &[], Some("x".repeat(1 << 20))).await;
        assert!(matches!(
            res,
            Err(Error::DaemonCommandFailed {
                exit_code: Some(1),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_command_failure() {
        let backend = WgCmdBackend::new(Duration::from_millis(100));
        let res = backend.run("sleep", &["5".to_string()], None).await;

        assert!(matches!(
            res,
            Err(Error::DaemonCommandFailed {
                exit_code: None,
                ..
            })
        ));
    }
}
