use tracing::{info, warn};

use crate::scheduler::StopHandle;

#[derive(Debug, Clone, Copy)]
enum Signal {
    #[cfg(unix)]
    Sigint,
    #[cfg(unix)]
    Sigterm,
    #[cfg(windows)]
    CtrlC,
}

/// Listen for termination signals and forward them to `stop`. The first signal
/// requests shutdown; later ones are only logged.
pub fn install(stop: StopHandle) -> anyhow::Result<()> {
    let mut signals = Signals::new()?;
    tokio::spawn(async move {
        loop {
            let Some(signal) = signals.recv().await else {
                warn!("signal stream closed");
                return;
            };
            if stop.stop() {
                info!(?signal, "shutdown requested, waiting for running jobs");
            } else {
                info!(?signal, "already shutting down");
            }
        }
    });
    Ok(())
}

#[cfg(unix)]
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Option<Signal> {
        tokio::select! {
            s = self.interrupt.recv() => s.map(|_| Signal::Sigint),
            s = self.terminate.recv() => s.map(|_| Signal::Sigterm),
        }
    }
}

#[cfg(windows)]
struct Signals {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(windows)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self { ctrl_c: tokio::signal::windows::ctrl_c()? })
    }

    async fn recv(&mut self) -> Option<Signal> {
        self.ctrl_c.recv().await.map(|_| Signal::CtrlC)
    }
}
