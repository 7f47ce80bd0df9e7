//! Local terminal handle owned by one SSH session

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{self, IsTerminal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FALLBACK_SIZE: (u16, u16) = (80, 24);
const DEFAULT_TERM: &str = "xterm-256color";

/// Whether stdio is a terminal, and how to talk to it
#[derive(Debug, Clone, Copy)]
pub struct Terminal {
    interactive: bool,
}

impl Terminal {
    /// Inspect the process's stdin/stdout
    pub fn detect() -> Self {
        Self {
            interactive: io::stdin().is_terminal() && io::stdout().is_terminal(),
        }
    }

    pub fn non_interactive() -> Self {
        Self { interactive: false }
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    /// `(columns, rows)`, falling back to 80x24
    pub fn size(&self) -> (u16, u16) {
        crossterm::terminal::size().unwrap_or(FALLBACK_SIZE)
    }

    /// `$TERM`, or a sensible default
    pub fn term_name(&self) -> String {
        std::env::var("TERM")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TERM.to_string())
    }

    /// Enter raw mode until the guard drops
    pub fn raw_mode(&self) -> io::Result<RawModeGuard> {
        RawModeGuard::enable(self.interactive)
    }

    /// Report size changes until `cancel` fires
    pub fn watch_resize(&self, cancel: CancellationToken) -> io::Result<ResizeWatcher> {
        ResizeWatcher::spawn(*self, cancel)
    }
}

/// Restores cooked mode on drop, on every exit path
#[derive(Debug)]
pub struct RawModeGuard(bool);

impl RawModeGuard {
    fn enable(enable: bool) -> io::Result<Self> {
        if enable {
            enable_raw_mode()?;
            Ok(Self(true))
        } else {
            Ok(Self(false))
        }
    }

    pub fn is_active(&self) -> bool {
        self.0
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.0 {
            let _ = disable_raw_mode();
        }
    }
}

/// Background SIGWINCH listener; aborted on drop
#[derive(Debug)]
pub struct ResizeWatcher {
    sizes: mpsc::Receiver<(u16, u16)>,
    task: JoinHandle<()>,
}

impl ResizeWatcher {
    #[cfg(unix)]
    fn spawn(terminal: Terminal, cancel: CancellationToken) -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut winch = signal(SignalKind::window_change())?;
        let (tx, sizes) = mpsc::channel(8);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = winch.recv() => {
                        if received.is_none() {
                            break;
                        }
                        let size = terminal.size();
                        debug!(cols = size.0, rows = size.1, "Terminal resized");
                        if tx.send(size).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Self { sizes, task })
    }

    #[cfg(not(unix))]
    fn spawn(_terminal: Terminal, cancel: CancellationToken) -> io::Result<Self> {
        tracing::warn!("Terminal resize propagation is not supported on this platform");
        let (_tx, sizes) = mpsc::channel(1);
        let task = tokio::spawn(async move { cancel.cancelled().await });
        Ok(Self { sizes, task })
    }

    /// Next size, `None` once the watcher stopped
    pub async fn recv(&mut self) -> Option<(u16, u16)> {
        self.sizes.recv().await
    }
}

impl Drop for ResizeWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Wait on an optional watcher; pending forever when there is none
pub(crate) async fn next_resize(watcher: &mut Option<ResizeWatcher>) -> Option<(u16, u16)> {
    match watcher {
        Some(watcher) => watcher.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_interactive_raw_mode_is_noop() {
        let terminal = Terminal::non_interactive();
        let guard = terminal.raw_mode().unwrap();
        assert!(!guard.is_active());
        drop(guard);
    }

    #[test]
    fn test_size_has_fallback() {
        let (cols, rows) = Terminal::non_interactive().size();
        assert!(cols > 0 && rows > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resize_watcher_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let mut watcher = Terminal::non_interactive()
            .watch_resize(cancel.clone())
            .unwrap();
        cancel.cancel();
        assert_eq!(watcher.recv().await, None);
    }

    #[tokio::test]
    async fn test_next_resize_without_watcher_is_pending() {
        let mut none = None;
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), next_resize(&mut none)).await;
        assert!(result.is_err());
    }
}
