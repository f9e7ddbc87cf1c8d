//! Keeps the proxy alive exactly as long as a client is running.
//!
//! The client sometimes restarts itself (updates, patchline switches). When
//! the watched process exits, the watcher waits out a grace window, then looks
//! for a replacement by name and watches that instead. No replacement means
//! the client is gone for good.

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, info, warn};

/// Executable names of the client, without extension.
pub const CLIENT_PROCESS_NAMES: &[&str] = &["RiotClientServices", "Riot Client"];

/// How long a self-relaunch may take before the client counts as gone.
pub const EXIT_GRACE: Duration = Duration::from_secs(3);

/// How often a process known only by pid is checked.
pub const PID_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub trait ProcessProbe: Send + Sync + 'static {
    /// Pid of a running process whose executable matches one of `names`.
    fn find(&self, names: &[&str]) -> Option<u32>;

    fn is_running(&self, pid: u32) -> bool;
}

/// What is being watched: the process we spawned, or one found afterwards.
#[derive(Debug)]
pub enum Watched {
    Child(Child),
    Pid(u32),
}

/// The client exited and nothing replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

pub async fn watch_client(
    first: Watched,
    probe: Arc<dyn ProcessProbe>,
    grace: Duration,
    poll: Duration,
) -> ClientGone {
    let mut watched = first;
    loop {
        match watched {
            Watched::Child(mut child) => match child.wait().await {
                Ok(status) => info!(status = %status, "Client exited"),
                Err(e) => warn!(error = %e, "Failed to wait for client, treating it as exited"),
            },
            Watched::Pid(pid) => {
                while probe_is_running(&probe, pid).await {
                    tokio::time::sleep(poll).await;
                }
                info!(pid, "Client exited");
            }
        }

        tokio::time::sleep(grace).await;

        match probe_find(&probe).await {
            Some(pid) => {
                info!(pid, "A new client process appeared, watching it");
                watched = Watched::Pid(pid);
            }
            None => {
                info!("No client came back");
                return ClientGone;
            }
        }
    }
}

/// Whether any client process is running right now.
pub async fn client_running(probe: &Arc<dyn ProcessProbe>) -> bool {
    probe_find(probe).await.is_some()
}

async fn probe_find(probe: &Arc<dyn ProcessProbe>) -> Option<u32> {
    let probe = probe.clone();
    tokio::task::spawn_blocking(move || probe.find(CLIENT_PROCESS_NAMES))
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Process probe failed");
            None
        })
}

async fn probe_is_running(probe: &Arc<dyn ProcessProbe>, pid: u32) -> bool {
    let probe = probe.clone();
    tokio::task::spawn_blocking(move || probe.is_running(pid))
        .await
        .unwrap_or(false)
}

/// Whether an executable path or image name is one of `names`, ignoring
/// directories, a `.exe` suffix and case.
fn executable_matches(executable: &str, names: &[&str]) -> bool {
    let base = executable
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(executable)
        .trim();
    let base = match base.len().checked_sub(4) {
        Some(cut) if base.is_char_boundary(cut) && base[cut..].eq_ignore_ascii_case(".exe") => {
            &base[..cut]
        }
        _ => base,
    };
    names.iter().any(|name| base.eq_ignore_ascii_case(name))
}

/// Rows of `tasklist /FO CSV /NH`: `"image","pid","session","#","mem"`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_tasklist(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut cols = line.split("\",\"").map(|c| c.trim_matches('"'));
            let image = cols.next()?.trim().to_string();
            let pid = cols.next()?.trim().parse().ok()?;
            Some((image, pid))
        })
        .collect()
}

/// Probe backed by the operating system's process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[cfg(unix)]
impl ProcessProbe for SystemProbe {
    fn find(&self, names: &[&str]) -> Option<u32> {
        let entries = std::fs::read_dir("/proc").ok()?;
        for entry in entries.flatten() {
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
            if executable_matches(&String::from_utf8_lossy(argv0), names) {
                debug!(pid, "Found client process");
                return Some(pid);
            }
        }
        None
    }

    fn is_running(&self, pid: u32) -> bool {
        std::path::Path::new("/proc").join(pid.to_string()).exists()
    }
}

#[cfg(windows)]
impl ProcessProbe for SystemProbe {
    fn find(&self, names: &[&str]) -> Option<u32> {
        let output = tasklist(&[])?;
        parse_tasklist(&output)
            .into_iter()
            .find(|(image, _)| executable_matches(image, names))
            .map(|(_, pid)| pid)
    }

    fn is_running(&self, pid: u32) -> bool {
        let filter = format!("PID eq {}", pid);
        tasklist(&["/FI", &filter])
            .map(|output| parse_tasklist(&output).iter().any(|(_, p)| *p == pid))
            .unwrap_or(false)
    }
}

#[cfg(windows)]
fn tasklist(extra: &[&str]) -> Option<String> {
    let output = std::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH"])
        .args(extra)
        .output()
        .map_err(|e| warn!(error = %e, "Failed to run tasklist"))
        .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Each pid is reported running for a set number of polls. `find`
    /// hands out the queued replacements one per call.
    struct FakeProbe {
        polls_left: Mutex<std::collections::HashMap<u32, u32>>,
        replacements: Mutex<VecDeque<u32>>,
        finds: Mutex<u32>,
    }

    impl FakeProbe {
        fn new(running: &[(u32, u32)], replacements: &[u32]) -> Self {
            Self {
                polls_left: Mutex::new(running.iter().copied().collect()),
                replacements: Mutex::new(replacements.iter().copied().collect()),
                finds: Mutex::new(0),
            }
        }
    }

    impl ProcessProbe for FakeProbe {
        fn find(&self, names: &[&str]) -> Option<u32> {
            assert_eq!(names, CLIENT_PROCESS_NAMES);
            *self.finds.lock().unwrap() += 1;
            self.replacements.lock().unwrap().pop_front()
        }

        fn is_running(&self, pid: u32) -> bool {
            let mut polls = self.polls_left.lock().unwrap();
            match polls.get_mut(&pid) {
                Some(0) | None => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            }
        }
    }

    const FAST: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_gone_without_replacement() {
        let probe = Arc::new(FakeProbe::new(&[(10, 2)], &[]));
        let gone = watch_client(Watched::Pid(10), probe.clone(), FAST, FAST).await;
        assert_eq!(gone, ClientGone);
        assert_eq!(*probe.finds.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rearms_on_replacement() {
        let probe = Arc::new(FakeProbe::new(&[(10, 1), (11, 3)], &[11]));
        let gone = watch_client(Watched::Pid(10), probe.clone(), FAST, FAST).await;
        assert_eq!(gone, ClientGone);
        // Once after pid 10 exited, once after its replacement did.
        assert_eq!(*probe.finds.lock().unwrap(), 2);
        assert_eq!(probe.polls_left.lock().unwrap().get(&11), Some(&0));
    }

    #[tokio::test]
    async fn test_client_running() {
        let probe: Arc<dyn ProcessProbe> = Arc::new(FakeProbe::new(&[], &[42]));
        assert!(client_running(&probe).await);
        assert!(!client_running(&probe).await);
    }

    #[test]
    fn test_executable_matches() {
        assert!(executable_matches(
            r"C:\Riot Games\Riot Client\RiotClientServices.exe",
            CLIENT_PROCESS_NAMES
        ));
        assert!(executable_matches("/opt/riot/Riot Client", CLIENT_PROCESS_NAMES));
        assert!(executable_matches("riotclientservices.EXE", CLIENT_PROCESS_NAMES));
        assert!(!executable_matches("RiotClientUx.exe", CLIENT_PROCESS_NAMES));
        assert!(!executable_matches("", CLIENT_PROCESS_NAMES));
    }

    #[test]
    fn test_parse_tasklist() {
        let output = "\"RiotClientServices.exe\",\"4242\",\"Console\",\"1\",\"45,120 K\"\r\n\
                      \"explorer.exe\",\"900\",\"Console\",\"1\",\"80,000 K\"\r\n\
                      INFO: No tasks are running which match the specified criteria.\r\n";
        let rows = parse_tasklist(output);
        assert_eq!(
            rows,
            vec![
                ("RiotClientServices.exe".to_string(), 4242),
                ("explorer.exe".to_string(), 900)
            ]
        );
    }

    #[tokio::test]
    async fn test_watches_spawned_child() {
        #[cfg(unix)]
        let child = tokio::process::Command::new("true").spawn();
        #[cfg(windows)]
        let child = tokio::process::Command::new("cmd").args(["/C", "exit"]).spawn();
        let Ok(child) = child else {
            return;
        };
        let probe = Arc::new(FakeProbe::new(&[], &[]));
        let gone = watch_client(Watched::Child(child), probe, FAST, FAST).await;
        assert_eq!(gone, ClientGone);
    }
}
