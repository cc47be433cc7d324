//! # Strata
//!
//! An incremental, crash-safe build daemon for layered source corpora.
//!
//! Strata watches a base corpus and any number of overlay "content
//! versions", routes every file to an envelope of derivation steps, and
//! keeps the derived artifacts current. Work is scheduled through a durable
//! SQLite queue with leases, so a crashed worker or daemon never loses or
//! duplicates work, and artifacts are content-addressed by signature, so
//! unchanged inputs are never re-derived.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ Discovery  │──▶│ Build Queue │──▶│   Workers    │
//! │ walk+hash  │   │ lease/claim │   │ step → sig   │
//! └────────────┘   └──────┬──────┘   └──────┬───────┘
//!                         │                 ▼
//!        ┌────────────────┤          ┌──────────────┐
//!        ▼                ▼          │  Artifacts   │──▶ Registry
//!  ┌──────────┐   ┌──────────────┐   │ (by sig)     │   snapshots
//!  │   CLI    │──▶│ Control Plane│   └──────────────┘
//!  │ (strata) │   │ loopback HTTP│
//!  └──────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! strata start                      # take the writer lock, serve, build
//! strata enqueue mod:common/a.txt --flash
//! strata status
//! strata resolve brave
//! strata stop
//!
//! strata build                      # one-shot: via the daemon or standalone
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`routing`] | Routing table: file patterns → envelopes |
//! | [`models`] | Core data types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema and store metadata |
//! | [`lock`] | Writer lock |
//! | [`discovery`] | Walk content versions, detect changes, enqueue |
//! | [`queue`] | Durable priority queue with leases |
//! | [`signature`] | Artifact signatures |
//! | [`steps`] | Derivation steps and their registry |
//! | [`artifacts`] | Artifact storage and per-file pointers |
//! | [`worker`] | Worker execution engine |
//! | [`registry`] | Cross-file definition snapshots |
//! | [`server`] | Control plane (HTTP) |
//! | [`client`] | Control plane client |
//! | [`daemon`] | Daemon lifecycle |
//! | [`build`] | One-shot builds |

pub mod artifacts;
pub mod build;
pub mod client;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod db;
pub mod discovery;
pub mod error;
pub mod lock;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod routing;
pub mod server;
pub mod signature;
pub mod status;
pub mod steps;
pub mod worker;
