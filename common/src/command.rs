use std::{
    process::{ExitStatus, Stdio},
    time::Duration,
};

use anyhow::{Context, Result};
use console::{style, StyledObject};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::process::Command;

lazy_static::lazy_static! {
    static ref DOTS_STYLE: ProgressStyle = ProgressStyle::with_template("{spinner} {msg} {elapsed_precise}").unwrap().tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
    pub static ref GREEN_TICK: StyledObject<&'static str> = style("✔").green();
    pub static ref RED_CROSS: StyledObject<&'static str> = style("✗").red();
}

pub fn progress(msg: &str) -> ProgressBar {
    let w = ProgressBar::new_spinner();
    w.set_style(DOTS_STYLE.clone());
    w.enable_steady_tick(Duration::from_millis(80));
    w.set_message(msg.to_owned());
    w
}

/// Runs `cmd` to completion with its output discarded and hands back the exit status.
/// Callers decide what a non-zero status means.
pub async fn command_status(cmd: &str, args: &[&str]) -> Result<ExitStatus> {
    tracing::debug!("{cmd} {args:?}");
    let status = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("could not spawn {cmd}"))?;
    Ok(status)
}

fn elapsed_time_str(dur: &Duration) -> String {
    let seconds = dur.as_secs() % 60;
    let minutes = (dur.as_secs() / 60) % 60;
    let hours = (dur.as_secs() / 60) / 60;
    format!("{:0>2}:{:0>2}:{:0>2}", hours, minutes, seconds)
}

fn finished_line(status_message: &str, context: &str, dur: &Duration) -> String {
    format!(
        "{} {} ({}) took, {}",
        GREEN_TICK.to_string(),
        status_message,
        context,
        elapsed_time_str(dur)
    )
}

/// Spinners for steps that run side by side. With `verbose` set no spinners
/// are drawn and the tracing output is left alone.
pub struct Reporter {
    multi: Option<MultiProgress>,
}

impl Reporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            multi: (!verbose).then(MultiProgress::new),
        }
    }

    pub fn start(&self, msg: &str) -> Option<ProgressBar> {
        self.multi.as_ref().map(|m| m.add(progress(msg)))
    }

    pub fn finish(&self, status_message: &str, context: &str, dur: Duration, pb: Option<ProgressBar>) {
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        self.println(finished_line(status_message, context, &dur));
    }

    pub fn fail(&self, status_message: &str, context: &str, pb: Option<ProgressBar>) {
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }
        self.println(format!(
            "{} {} ({})",
            RED_CROSS.to_string(),
            status_message,
            context
        ));
    }

    fn println(&self, line: String) {
        match &self.multi {
            Some(m) if !m.is_hidden() => {
                if m.println(&line).is_err() {
                    println!("{line}");
                }
            }
            _ => println!("{line}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_elapsed_time() {
        assert_eq!(elapsed_time_str(&Duration::from_secs(0)), "00:00:00");
        assert_eq!(elapsed_time_str(&Duration::from_secs(3725)), "01:02:05");
    }

    #[tokio::test]
    async fn reports_exit_status() {
        assert!(command_status("true", &[]).await.unwrap().success());
        assert!(!command_status("false", &[]).await.unwrap().success());
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        assert!(command_status("definitely-not-a-real-binary", &[]).await.is_err());
    }
}
