//! Ambient capabilities the run controller needs from the outside world.
//!
//! Waiting, environment variables, the path of the telemetry client
//! executable and CPU pinning all go through [`Environment`], so a run can
//! be driven in tests without sleeping or touching the real shell.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::topology::AffinityMask;

pub trait Environment {
    /// Block for `duration`, showing progress under `label`.
    fn wait(&mut self, duration: Duration, label: &str);

    /// Block for `duration` without any output.
    fn pause(&mut self, duration: Duration);

    /// Called once per poll while a rebuild is running.
    fn build_progress(&mut self, _elapsed: Duration, _tick: usize) {}

    fn var(&self, key: &str) -> Option<String>;

    /// Program re-invoked as the telemetry collector.
    fn client_program(&self) -> PathBuf;

    /// How often long-running children are polled.
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    /// Pin the harness to `core`.
    fn pin_to_core(&mut self, _core: usize) -> std::io::Result<()> {
        Ok(())
    }

    /// Undo [`Environment::pin_to_core`].
    fn unpin(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// The real thing: sleeps, prints progress and pins with `sched_setaffinity`.
pub struct SystemEnvironment {
    show_progress: bool,
    original_affinity: Option<AffinityMask>,
}

impl SystemEnvironment {
    pub fn new() -> Self {
        Self {
            show_progress: true,
            original_affinity: None,
        }
    }

    pub fn quiet() -> Self {
        Self {
            show_progress: false,
            original_affinity: None,
        }
    }
}

impl Default for SystemEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SystemEnvironment {
    fn wait(&mut self, duration: Duration, label: &str) {
        if !self.show_progress {
            std::thread::sleep(duration);
            return;
        }
        println!("{label} . . .");
        let total = duration.as_secs_f64();
        let mut remaining = duration;
        while !remaining.is_zero() {
            let left = remaining.as_secs_f64().ceil() as u64;
            let pct = if total > 0.0 {
                ((total - remaining.as_secs_f64()) / total * 100.0) as u64
            } else {
                100
            };
            print!("\r{left} seconds left: {pct}%    ");
            let _ = std::io::stdout().flush();
            let slice = remaining.min(Duration::from_secs(1));
            std::thread::sleep(slice);
            remaining -= slice;
        }
        print!("\r{:<32}\r", "");
        let _ = std::io::stdout().flush();
    }

    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn build_progress(&mut self, elapsed: Duration, tick: usize) {
        if self.show_progress {
            print!("\r{}", build_status_line(elapsed, tick));
            let _ = std::io::stdout().flush();
        }
    }

    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn client_program(&self) -> PathBuf {
        std::env::current_exe().unwrap_or_else(|_| PathBuf::from("doat"))
    }

    fn pin_to_core(&mut self, core: usize) -> std::io::Result<()> {
        if self.original_affinity.is_none() {
            self.original_affinity = Some(AffinityMask::current()?);
        }
        AffinityMask::single(core).apply()?;
        log::info!("harness pinned to core {core} (pid {})", std::process::id());
        Ok(())
    }

    fn unpin(&mut self) -> std::io::Result<()> {
        if let Some(mask) = &self.original_affinity {
            mask.apply()?;
            log::info!("harness unpinned (affinity {})", mask);
        }
        Ok(())
    }
}

const SPINNER: [char; 4] = ['|', '/', '-', '\\'];

/// `Building . . . mm:ss <spinner>`.
pub fn build_status_line(elapsed: Duration, tick: usize) -> String {
    let secs = elapsed.as_secs();
    format!(
        "Building . . . {:02}:{:02} {}",
        secs / 60,
        secs % 60,
        SPINNER[tick % SPINNER.len()]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_status_line_format() {
        assert_eq!(build_status_line(Duration::ZERO, 0), "Building . . . 00:00 |");
        assert_eq!(
            build_status_line(Duration::from_secs(125), 3),
            "Building . . . 02:05 \\"
        );
        assert_eq!(build_status_line(Duration::from_millis(900), 5), "Building . . . 00:00 /");
    }

    #[test]
    fn test_quiet_wait_sleeps_for_duration() {
        let mut env = SystemEnvironment::quiet();
        let start = std::time::Instant::now();
        env.wait(Duration::from_millis(30), "settle");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_var_reads_process_environment() {
        let env = SystemEnvironment::quiet();
        assert!(env.var("PATH").is_some());
        assert!(env.var("DOAT_SURELY_UNSET_VARIABLE").is_none());
    }
}
