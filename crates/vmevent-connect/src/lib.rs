//! vmevent-connect - event source adapters for VMware Horizon and vSphere
//!
//! Each adapter polls a vendor API, removes events already delivered, converts the
//! rest to CloudEvents and hands them to a sink. Both adapters run under the same
//! poll loop with exponential backoff.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────┐   ┌───────────┐   ┌────────┐   ┌──────┐
//! │ Vendor API   │──▶│  Dedup  │──▶│ Converter │──▶│ Sender │──▶│ Sink │
//! │ (REST/SOAP)  │   └─────────┘   └───────────┘   └────────┘   └──────┘
//! └──────────────┘        ▲                             │
//!                         └──── checkpoint / position ◀─┘
//! ```
//!
//! # CLI Usage (Binary)
//!
//! ```bash
//! # Run the configured connector
//! vmevent-connect -c vmevent.yaml
//!
//! # Validate configuration
//! vmevent-connect -c vmevent.yaml validate
//!
//! # Print the configuration JSON schema
//! vmevent-connect schema
//! ```

// Common types (SensitiveString)
pub mod types;

// Error types
pub mod error;

// Runtime building blocks
pub mod backoff;
pub mod checkpoint;
pub mod dedup;
pub mod event;
pub mod poll;
pub mod retry;
pub mod sender;
pub mod sink;

// Vendor adapters
pub mod horizon;
pub mod vsphere;

// Configuration and lifecycle
pub mod config;
pub mod runner;

// Test doubles
pub mod testing;

pub use types::SensitiveString;

pub use error::{ConnectError, ConnectorError, ConnectorResult, ConnectorStatus, Result};

pub use backoff::{Backoff, BackoffConfig};
pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore, KvStore, StoreConfig};
pub use event::{EventConverter, NormalizedEvent, PayloadEncoding};
pub use poll::{CycleOutcome, PollLoop, PollingAdapter};
pub use sender::{DeliveryPolicy, DeliveryReport};
pub use sink::{HttpSink, HttpSinkConfig, Sink};

pub use horizon::{HorizonAdapter, HorizonConfig};
pub use vsphere::{VsphereAdapter, VsphereConfig};

pub use config::{ConnectConfig, ConnectorConfig};
pub use runner::{run_connector, ConnectorRunner};

pub use async_trait::async_trait;
