//! # Status Store
//!
//! Observable UI state for a messaging session: connection status, login
//! flag, trader name and the most recent log entry. Every value lives in a
//! `tokio::sync::watch` channel so a UI thread can poll the current value or
//! await changes without touching the client.
//!
//! The log entry is normally fed by [`StoreLayer`], which mirrors the
//! crate's own `tracing` events into the store.

pub mod layer;

pub use layer::StoreLayer;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{:?}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

struct StoreChannels {
    status: watch::Sender<ConnectionStatus>,
    logged_in: watch::Sender<bool>,
    trader_name: watch::Sender<String>,
    log: watch::Sender<Option<LogEntry>>,
}

/// Cheaply cloneable handle to the shared UI state.
#[derive(Clone)]
pub struct StatusStore {
    channels: Arc<StoreChannels>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StatusStore")
            .field("status", &self.status())
            .field("logged_in", &self.logged_in())
            .field("trader_name", &self.trader_name())
            .finish()
    }
}

impl StatusStore {
    pub fn new() -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        let (logged_in, _) = watch::channel(false);
        let (trader_name, _) = watch::channel(String::new());
        let (log, _) = watch::channel(None);

        StatusStore {
            channels: Arc::new(StoreChannels {
                status,
                logged_in,
                trader_name,
                log,
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.channels.status.borrow()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.channels.status.send_replace(status);
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.channels.status.subscribe()
    }

    pub fn logged_in(&self) -> bool {
        *self.channels.logged_in.borrow()
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.channels.logged_in.send_replace(logged_in);
    }

    pub fn watch_logged_in(&self) -> watch::Receiver<bool> {
        self.channels.logged_in.subscribe()
    }

    pub fn trader_name(&self) -> String {
        self.channels.trader_name.borrow().clone()
    }

    pub fn set_trader_name(&self, name: impl Into<String>) {
        self.channels.trader_name.send_replace(name.into());
    }

    pub fn watch_trader_name(&self) -> watch::Receiver<String> {
        self.channels.trader_name.subscribe()
    }

    pub fn last_log(&self) -> Option<LogEntry> {
        self.channels.log.borrow().clone()
    }

    pub fn watch_log(&self) -> watch::Receiver<Option<LogEntry>> {
        self.channels.log.subscribe()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.channels.log.send_replace(Some(LogEntry {
            level,
            message: message.into(),
            timestamp: Local::now(),
        }));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    /// A `tracing` layer that records this crate's events in the store.
    pub fn layer(&self) -> StoreLayer {
        StoreLayer::new(self.clone())
    }
}
