/// Configuration management
use crate::error::{ChatError, Result};
use crate::types::{Role, Viewer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 20;
const DEFAULT_DATA_ROOT: &str = ".portal-chat";

/// Chat core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Directory for durable local storage (defaults to `.portal-chat/<viewer>`)
    pub data_dir: Option<PathBuf>,

    /// Messages per page
    pub page_size: usize,

    /// Max distance between a pending message and its live echo
    pub dedup_window: Duration,

    /// Automatic retry passes per pending send
    pub max_send_retries: u32,

    /// Heartbeat interval for subscription maintenance
    pub heartbeat_interval: Duration,

    /// First reconnect delay after a subscription drops
    pub reconnect_initial_backoff: Duration,

    /// Reconnect delay ceiling
    pub reconnect_max_backoff: Duration,

    /// Distance from the bottom (px) that still counts as following
    pub near_bottom_threshold: f32,

    /// Capacity of the UI event bus
    pub event_bus_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            page_size: DEFAULT_PAGE_SIZE,
            dedup_window: Duration::from_secs(5),
            max_send_retries: 3,
            heartbeat_interval: Duration::from_secs(15),
            reconnect_initial_backoff: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(60),
            near_bottom_threshold: 80.0,
            event_bus_capacity: 256,
        }
    }
}

impl ChatConfig {
    /// Parse `<viewer-id> <admin|client> [flags]` from command line arguments
    pub fn from_args(args: &[String]) -> Result<(Viewer, Self)> {
        if args.len() < 3 {
            return Err(ChatError::Config(format!(
                "Usage: {} <viewer-id> <admin|client> [--data-dir <path>] [--page-size <n>] [--heartbeat-secs <n>]",
                args.first().map(String::as_str).unwrap_or("portal-chat")
            )));
        }

        let viewer_id = args[1].trim().to_string();
        if viewer_id.is_empty() {
            return Err(ChatError::Config("Viewer id must not be empty".to_string()));
        }
        let role: Role = args[2].parse()?;

        let mut config = Self::default();

        let mut i = 3;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--page-size" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--page-size requires a number".to_string())
                    })?;
                    config.page_size = parse_page_size(n)?;
                    i += 2;
                }
                "--heartbeat-secs" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--heartbeat-secs requires a number".to_string())
                    })?;
                    config.heartbeat_interval = parse_secs(n)?;
                    i += 2;
                }
                other => {
                    return Err(ChatError::Config(format!("Unknown argument: {}", other)));
                }
            }
        }

        // Env overrides
        if let Ok(n) = std::env::var("PORTAL_CHAT_PAGE_SIZE") {
            config.page_size = parse_page_size(&n)?;
        }
        if let Ok(dir) = std::env::var("PORTAL_CHAT_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Ok(n) = std::env::var("PORTAL_CHAT_HEARTBEAT_SECS") {
            config.heartbeat_interval = parse_secs(&n)?;
        }

        Ok((Viewer::new(viewer_id, role), config))
    }

    /// Storage directory for a viewer
    pub fn data_dir_for(&self, viewer: &Viewer) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT).join(&viewer.id))
    }
}

fn parse_page_size(raw: &str) -> Result<usize> {
    match raw.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ChatError::Config(
            "Page size must be a positive number".to_string(),
        )),
    }
}

fn parse_secs(raw: &str) -> Result<Duration> {
    match raw.parse::<u64>() {
        Ok(n) if n > 0 => Ok(Duration::from_secs(n)),
        _ => Err(ChatError::Config(
            "Interval must be a positive number of seconds".to_string(),
        )),
    }
}
