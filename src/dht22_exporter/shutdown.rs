// dht22-exporter - Temperature and humidity metrics exporter for Prometheus
//
// Copyright 2022 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use std::io;
use tokio::signal::unix::{self, SignalKind};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Turn the first SIGINT or SIGTERM received by this process into the cancellation
/// of a token shared by everything that needs to stop when the process does.
///
/// Tasks that check the token after it has been cancelled see it as cancelled
/// immediately, so there is no window in which a shutdown can be missed.
#[derive(Debug)]
pub struct Shutdown {
    token: CancellationToken,
    listener: JoinHandle<()>,
}

impl Shutdown {
    /// Install handlers for SIGINT and SIGTERM. Must be called from within a tokio
    /// runtime. Returns an error if either handler can't be registered.
    pub fn install() -> io::Result<Self> {
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let token = CancellationToken::new();
        let trigger = token.clone();

        let listener = task::spawn(async move {
            let signal = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
                // Cancelled some other way, nothing left to listen for
                _ = trigger.cancelled() => return,
            };

            tracing::info!(message = "received shutdown signal", signal = signal);
            trigger.cancel();
        });

        Ok(Self { token, listener })
    }

    /// Token that will be cancelled on shutdown, for handing to other tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until a shutdown signal has been received.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod test {
    use super::Shutdown;
    use std::process::Command;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_cancels_token() {
        let shutdown = Shutdown::install().unwrap();
        let early = shutdown.token();
        assert!(!early.is_cancelled());

        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
            .await
            .expect("shutdown signal not observed");

        // Listeners registered before and after the signal both see it
        assert!(early.is_cancelled());
        assert!(shutdown.token().is_cancelled());
        shutdown.token().cancelled().await;
    }
}
