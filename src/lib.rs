//! # Lapse Harness
//!
//! An unattended time-lapse capture service for small single-board
//! computers.
//!
//! Lapse Harness captures a still image on a timer (or on a GPIO sensor
//! edge), hands it to a local archive and a remote upload job through a
//! bounded queue, and reports status to a remote operator who can pause,
//! resume, re-arm or force any job.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Capture  │──▶│ HandoffQueue │──▶│ LocalArchive  │  retention
//! │ cam+gpio │   │  bounded     │──▶│ RemoteUpload  │  upload log
//! └────┬─────┘   └──────────────┘   └───────┬───────┘
//!      │                                    │
//!      └──────────▶ EventCounters ◀─────────┘
//!                        │
//!                 ┌──────┴──────┐
//!                 ▼             ▼
//!            ┌────────┐    ┌──────────┐
//!            │  poll  │    │   push   │
//!            │ (HTTP) │    │   (WS)   │
//!            └────────┘    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lapse check                  # validate config, print the job topology
//! lapse dark                   # is it dark now, and until when
//! lapse capture                # one capture into the image directory
//! lapse run                    # run the service until SIGTERM
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Artifacts, commands, status snapshots |
//! | [`error`] | Error type shared by all jobs |
//! | [`job`] | Job life-cycle state and retry policy |
//! | [`counters`] | Shared per-job counters |
//! | [`queue`] | Bounded multi-consumer handoff queue |
//! | [`dark`] | Dark-time oracle (fixed window or solar elevation) |
//! | [`gpio`] | Reflector output and sensor input |
//! | [`capture`] | Capture backends and the capture job |
//! | [`archive`] | Local archive and retention |
//! | [`pending`] | Retry list for artifacts that failed a step |
//! | [`upload_log`] | Durable record of uploaded artifacts |
//! | [`storage`] | Remote store abstraction and directory store |
//! | [`storage_s3`] | S3-compatible remote store |
//! | [`upload`] | Remote upload job |
//! | [`control`] | Control job and command intake |
//! | [`control_poll`] | HTTP poll transport |
//! | [`control_push`] | WebSocket push transport |
//! | [`supervisor`] | systemd readiness and watchdog notifications |
//! | [`shutdown`] | Cooperative cancellation and signal handling |
//! | [`orchestrator`] | Job scheduling, command dispatch, shutdown |

pub mod archive;
pub mod capture;
pub mod config;
pub mod control;
pub mod control_poll;
pub mod control_push;
pub mod counters;
pub mod dark;
pub mod error;
pub mod gpio;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod pending;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod storage_s3;
pub mod supervisor;
pub mod upload;
pub mod upload_log;
