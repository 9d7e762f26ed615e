use std::{future::Future, path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use common::{command::command_status, config::ReadinessConfig};
use tokio::{net::TcpStream, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub identity: PathBuf,
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn port_open(&self, host: &str, port: u16) -> bool;

    /// `Ok(false)` means the host answered but is not ready yet. Errors are
    /// reserved for failures on this side, such as a missing ssh binary.
    async fn marker_present(&self, target: &SshTarget, marker: &str) -> Result<bool>;
}

/// Plain TCP connects and the system `ssh` client.
pub struct SystemProbe;

#[async_trait]
impl ReadinessProbe for SystemProbe {
    async fn port_open(&self, host: &str, port: u16) -> bool {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!("{host}:{port} not reachable: {err}");
                false
            }
            Err(_) => {
                debug!("{host}:{port} connect timed out");
                false
            }
        }
    }

    async fn marker_present(&self, target: &SshTarget, marker: &str) -> Result<bool> {
        let identity = target.identity.display().to_string();
        let port = target.port.to_string();
        let destination = format!("{}@{}", target.user, target.host);
        let remote = format!("test -f \"$HOME/{marker}\"");
        let args = [
            "-i",
            identity.as_str(),
            "-p",
            port.as_str(),
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "BatchMode=yes",
            "-o",
            "ConnectTimeout=10",
            "-o",
            "LogLevel=ERROR",
            destination.as_str(),
            remote.as_str(),
        ];
        let status = command_status("ssh", &args).await?;
        Ok(status.success())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub grace: Duration,
    pub timeout: Option<Duration>,
}

impl From<&ReadinessConfig> for PollSettings {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            grace: Duration::from_secs(config.grace_secs),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl PollSettings {
    fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| Instant::now() + t)
    }
}

/// Blocks until `host:port` accepts a TCP connection, then sits out the grace
/// period so the guest can finish booting. A configured timeout covers both.
pub async fn wait_for_port(
    probe: &dyn ReadinessProbe,
    host: &str,
    port: u16,
    settings: &PollSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let what = format!("{host}:{port}");
    let timeout = settings.timeout.unwrap_or_default();
    let deadline = settings.deadline();
    poll(&what, settings, deadline, cancel, || async move {
        Ok(probe.port_open(host, port).await)
    })
    .await?;
    info!("{what} is open, waiting {:?} before going on", settings.grace);
    tokio::select! {
        _ = cancel.cancelled() => bail!("waiting for {what} cancelled"),
        _ = expired(deadline) => bail!("{what} still not ready after {timeout:?}"),
        _ = tokio::time::sleep(settings.grace) => Ok(()),
    }
}

pub async fn wait_for_marker(
    probe: &dyn ReadinessProbe,
    target: &SshTarget,
    marker: &str,
    settings: &PollSettings,
    cancel: &CancellationToken,
) -> Result<()> {
    let what = format!("{}@{}:~/{marker}", target.user, target.host);
    poll(&what, settings, settings.deadline(), cancel, || {
        probe.marker_present(target, marker)
    })
    .await?;
    info!("{what} found");
    Ok(())
}

/// Resolves once `deadline` passes, never when there is none.
async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll<F, Fut>(
    what: &str,
    settings: &PollSettings,
    deadline: Option<Instant>,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let timeout = settings.timeout.unwrap_or_default();
    loop {
        let ready = tokio::select! {
            _ = cancel.cancelled() => bail!("waiting for {what} cancelled"),
            _ = expired(deadline) => bail!("{what} still not ready after {timeout:?}"),
            ready = check() => ready?,
        };
        if ready {
            return Ok(());
        }
        debug!("{what} not ready, retrying in {:?}", settings.interval);
        tokio::select! {
            _ = cancel.cancelled() => bail!("waiting for {what} cancelled"),
            _ = expired(deadline) => bail!("{what} still not ready after {timeout:?}"),
            _ = tokio::time::sleep(settings.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Port opens `port_after` into the test, marker shows up `marker_after`
    /// after the first marker probe.
    struct Scripted {
        start: Instant,
        port_after: Duration,
        marker_after: Duration,
        first_marker_probe: Mutex<Option<Instant>>,
        probes: Mutex<Vec<(&'static str, Duration)>>,
    }

    impl Scripted {
        fn new(port_after: u64, marker_after: u64) -> Self {
            Self {
                start: Instant::now(),
                port_after: Duration::from_secs(port_after),
                marker_after: Duration::from_secs(marker_after),
                first_marker_probe: Mutex::new(None),
                probes: Mutex::new(Vec::new()),
            }
        }

        fn probes(&self, kind: &str) -> Vec<Duration> {
            self.probes
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, at)| *at)
                .collect()
        }
    }

    #[async_trait]
    impl ReadinessProbe for Scripted {
        async fn port_open(&self, _: &str, _: u16) -> bool {
            let at = self.start.elapsed();
            self.probes.lock().unwrap().push(("port", at));
            at >= self.port_after
        }

        async fn marker_present(&self, _: &SshTarget, _: &str) -> Result<bool> {
            let now = Instant::now();
            self.probes.lock().unwrap().push(("marker", self.start.elapsed()));
            let first = *self.first_marker_probe.lock().unwrap().get_or_insert(now);
            Ok(now - first >= self.marker_after)
        }
    }

    fn settings(timeout: Option<u64>) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(5),
            grace: Duration::from_secs(120),
            timeout: timeout.map(Duration::from_secs),
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            user: "clex".into(),
            host: "203.0.113.1".into(),
            port: 22,
            identity: PathBuf::from("/nonexistent/id_rsa"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn port_wait_retries_then_sits_out_the_grace_period() {
        let probe = Scripted::new(12, 0);
        let cancel = CancellationToken::new();
        wait_for_port(&probe, "reg1.example.com", 22, &settings(None), &cancel)
            .await
            .unwrap();

        // probes at 0, 5, 10, 15
        assert_eq!(probe.probes("port").len(), 4);
        assert!(probe.start.elapsed() >= Duration::from_secs(15 + 120));
    }

    #[tokio::test(start_paused = true)]
    async fn marker_is_only_probed_after_the_port_wait() {
        let probe = Scripted::new(7, 10);
        let cancel = CancellationToken::new();
        let settings = settings(None);

        wait_for_port(&probe, "reg1.example.com", 22, &settings, &cancel)
            .await
            .unwrap();
        let port_done = probe.start.elapsed();
        wait_for_marker(&probe, &target(), ".i_am_ready", &settings, &cancel)
            .await
            .unwrap();

        let markers = probe.probes("marker");
        assert!(markers.iter().all(|at| *at >= port_done));
        // not ready at +0 and +5, ready at +10
        assert_eq!(markers.len(), 3);
        assert!(probe.start.elapsed() >= port_done + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_timeout_is_fatal() {
        let probe = Scripted::new(u64::MAX / 4, 0);
        let cancel = CancellationToken::new();
        let err = wait_for_port(&probe, "reg1.example.com", 22, &settings(Some(30)), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_wait() {
        let probe = Scripted::new(0, u64::MAX / 4);
        let cancel = CancellationToken::new();
        let waiter = {
            let cancel = cancel.clone();
            async move {
                wait_for_marker(&probe, &target(), ".i_am_ready", &settings(None), &cancel).await
            }
        };
        let handle = tokio::spawn(waiter);
        tokio::time::sleep(Duration::from_secs(60)).await;
        cancel.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_covers_the_grace_period() {
        let probe = Scripted::new(0, 0);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let err = wait_for_port(&probe, "reg1.example.com", 22, &settings(Some(60)), &cancel)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not ready"));
        assert_eq!(probe.probes("port").len(), 1);
        assert!(start.elapsed() < Duration::from_secs(120));
    }

    struct Hanging;

    #[async_trait]
    impl ReadinessProbe for Hanging {
        async fn port_open(&self, _: &str, _: u16) -> bool {
            std::future::pending().await
        }

        async fn marker_present(&self, _: &SshTarget, _: &str) -> Result<bool> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_interrupts_a_probe_that_never_answers() {
        let cancel = CancellationToken::new();
        let err = wait_for_marker(&Hanging, &target(), ".i_am_ready", &settings(Some(30)), &cancel)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready after 30s"));
    }
}
