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

use crate::config::Config;
use crate::http::{self, MetricsServer, RequestState};
use crate::metrics::MeasurementStore;
use crate::scheduler::Scheduler;
use crate::sensor::SensorReader;
use crate::shutdown::Shutdown;
use std::error::Error;
use std::fmt::{self, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stage of startup, or of serving, that failed
#[derive(PartialEq, Eq, Debug, Hash, Clone, Copy)]
pub enum StartupErrorKind {
    Gpio,
    Sensor,
    Metrics,
    Signals,
    Bind,
    Serve,
}

impl StartupErrorKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            StartupErrorKind::Gpio => "gpio",
            StartupErrorKind::Sensor => "sensor",
            StartupErrorKind::Metrics => "metrics",
            StartupErrorKind::Signals => "signals",
            StartupErrorKind::Bind => "bind",
            StartupErrorKind::Serve => "serve",
        }
    }
}

/// Fatal error starting or running the exporter. The process should exit with
/// status 1 when one of these is returned.
#[derive(Debug)]
pub enum StartupError {
    KindMsg(StartupErrorKind, &'static str),
    KindMsgCause(StartupErrorKind, &'static str, Box<dyn Error + Send + Sync>),
}

impl StartupError {
    pub fn kind(&self) -> StartupErrorKind {
        match self {
            StartupError::KindMsg(kind, _) => *kind,
            StartupError::KindMsgCause(kind, _, _) => *kind,
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::KindMsg(_, msg) => msg.fmt(f),
            StartupError::KindMsgCause(_, msg, ref e) => write!(f, "{}: {}", msg, e),
        }
    }
}

impl Error for StartupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StartupError::KindMsgCause(_, _, ref e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

/// A sensor, metrics store, signal handlers and bound server, ready to run.
///
/// Nothing is sampled or served until `run` is called.
pub struct Exporter<R> {
    scheduler: Scheduler<R>,
    server: MetricsServer,
    shutdown: Shutdown,
    poll_interval: Duration,
}

impl<R> Exporter<R>
where
    R: SensorReader,
{
    /// Initialize everything the exporter needs, in order: the sensor (via `init`,
    /// given the configured pin), metrics, signal handlers, then the HTTP listener.
    /// The first failure is returned and nothing after it is attempted.
    pub fn start<F>(config: &Config, init: F) -> Result<Self, StartupError>
    where
        F: FnOnce(&str) -> Result<R, StartupError>,
    {
        let reader = init(&config.pin)?;

        let store = MeasurementStore::new(config.units)
            .map(Arc::new)
            .map_err(|e| StartupError::KindMsgCause(StartupErrorKind::Metrics, "failed to register metrics", Box::new(e)))?;

        let shutdown = Shutdown::install().map_err(|e| {
            StartupError::KindMsgCause(StartupErrorKind::Signals, "failed to install signal handlers", Box::new(e))
        })?;

        let addr = config.bind_addr();
        let state = Arc::new(RequestState { store: store.clone() });
        let server = http::bind(&addr, state)
            .map_err(|e| StartupError::KindMsgCause(StartupErrorKind::Bind, "error starting server", Box::new(e)))?;

        Ok(Self {
            scheduler: Scheduler::new(reader, store, config.poll_interval, config.retry_count),
            server,
            shutdown,
            poll_interval: config.poll_interval,
        })
    }

    /// Address the metrics server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Token cancelled on SIGINT or SIGTERM. Cancelling it has the same effect.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.token()
    }

    /// Sample the sensor and serve metrics until shutdown, then give the scheduler
    /// up to one poll interval to stop.
    ///
    /// The server is not stopped on shutdown and keeps answering requests until
    /// the runtime it was spawned on goes away. An error serving requests ends the
    /// run early with a `Serve` error.
    pub async fn run(self) -> Result<(), StartupError> {
        let addr = self.server.local_addr();
        let scheduler = self.scheduler.spawn(self.shutdown.token());
        let mut server = tokio::spawn(self.server);

        tracing::info!(message = "starting server", address = %addr);

        tokio::select! {
            res = &mut server => {
                self.shutdown.token().cancel();
                return Err(match res {
                    Ok(Err(e)) => StartupError::KindMsgCause(StartupErrorKind::Serve, "error running server", Box::new(e)),
                    Ok(Ok(())) => StartupError::KindMsg(StartupErrorKind::Serve, "server stopped unexpectedly"),
                    Err(e) => StartupError::KindMsgCause(StartupErrorKind::Serve, "server task failed", Box::new(e)),
                });
            }
            _ = self.shutdown.wait() => {}
        }

        if tokio::time::timeout(self.poll_interval, scheduler).await.is_err() {
            tracing::warn!("sensor sampling did not stop in time");
        }

        tracing::info!("shutdown");
        Ok(())
    }
}
