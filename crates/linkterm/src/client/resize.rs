//! Sources of local terminal resize events.
//!
//! The controller only needs to know *that* the terminal may have changed
//! size; it re-queries the dimensions itself. Unix terminals announce this
//! with SIGWINCH, everything else is polled.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use protocol::TerminalSize;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Queries the current size of the local terminal.
pub type SizeQuery = Arc<dyn Fn() -> io::Result<TerminalSize> + Send + Sync>;

/// Interval used by [`PollingResizeSource`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Something that yields an event whenever the terminal may have been resized.
pub trait ResizeSource: Send {
    /// Start producing events. The channel closes when the source stops.
    ///
    /// Must be called from within a Tokio runtime.
    fn events(self: Box<Self>) -> io::Result<mpsc::Receiver<()>>;
}

/// Resize events from SIGWINCH.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct SignalResizeSource;

#[cfg(unix)]
impl ResizeSource for SignalResizeSource {
    fn events(self: Box<Self>) -> io::Result<mpsc::Receiver<()>> {
        let mut winch = signal(SignalKind::window_change())?;
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            while winch.recv().await.is_some() {
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

/// Resize events from polling the terminal size.
pub struct PollingResizeSource {
    size: SizeQuery,
    interval: Duration,
}

impl PollingResizeSource {
    /// Poll `size` every [`DEFAULT_POLL_INTERVAL`].
    pub fn new(size: SizeQuery) -> Self {
        Self::with_interval(size, DEFAULT_POLL_INTERVAL)
    }

    /// Poll `size` at a custom interval.
    pub fn with_interval(size: SizeQuery, interval: Duration) -> Self {
        Self { size, interval }
    }
}

impl ResizeSource for PollingResizeSource {
    fn events(self: Box<Self>) -> io::Result<mpsc::Receiver<()>> {
        let (tx, rx) = mpsc::channel(8);
        let mut last = (self.size)().ok();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let current = match (self.size)() {
                    Ok(size) => Some(size),
                    Err(_) => continue,
                };
                if current != last {
                    last = current;
                    if tx.send(()).await.is_err() {
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// The resize source for this platform: SIGWINCH on unix.
#[cfg(unix)]
pub fn default_resize_source(_size: SizeQuery) -> Box<dyn ResizeSource> {
    Box::new(SignalResizeSource)
}

/// The resize source for this platform: polling where there is no SIGWINCH.
#[cfg(not(unix))]
pub fn default_resize_source(size: SizeQuery) -> Box<dyn ResizeSource> {
    Box::new(PollingResizeSource::new(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::timeout;

    fn shared_size(initial: TerminalSize) -> (Arc<Mutex<TerminalSize>>, SizeQuery) {
        let current = Arc::new(Mutex::new(initial));
        let reader = Arc::clone(&current);
        let query: SizeQuery = Arc::new(move || Ok(*reader.lock().unwrap()));
        (current, query)
    }

    #[tokio::test]
    async fn test_polling_emits_on_change_only() {
        let (current, query) = shared_size(TerminalSize::new(80, 24));
        let source = Box::new(PollingResizeSource::with_interval(
            query,
            Duration::from_millis(10),
        ));
        let mut events = source.events().unwrap();

        // No change, no event
        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());

        *current.lock().unwrap() = TerminalSize::new(120, 40);
        let event = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert_eq!(event, Some(()));

        assert!(timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_source_receives_sigwinch() {
        let mut events = Box::new(SignalResizeSource).events().unwrap();

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGWINCH).unwrap();

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(event, Some(()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_default_source_follows_sigwinch_on_unix() {
        // The size never changes, so only a signal-driven source reports
        let (_current, query) = shared_size(TerminalSize::new(80, 24));
        let mut events = default_resize_source(query).events().unwrap();

        nix::sys::signal::raise(nix::sys::signal::Signal::SIGWINCH).unwrap();

        let event = timeout(Duration::from_secs(2), events.recv()).await.unwrap();
        assert_eq!(event, Some(()));
    }

    #[tokio::test]
    async fn test_default_source_produces_channel() {
        let (_current, query) = shared_size(TerminalSize::default());
        let source = default_resize_source(query);
        assert!(source.events().is_ok());
    }
}
