// ===================================================================================================
// SwarmSync Library - LAN Peer-to-Peer Folder Synchronization
// ===================================================================================================
//
// The daemon's core as a library: discovery, authenticated transport, sync
// engine, delta transfer, vault folders, and durable state. The binary in
// main.rs and any embedding application wire the pieces through the
// supervisor; UI layers subscribe to the typed event bus instead of linking
// against internals.
//
// ===================================================================================================

// ===== CRYPTOGRAPHY AND IDENTITY =====
pub mod crypto;       // Hashing, rolling checksum, identity/session keys, AEAD chunks, PBKDF2
pub mod key_storage;  // Pluggable persistence for the identity private key

// ===== DURABLE STATE =====
pub mod state_store;  // SQLite-backed file states and transfer checkpoints (WAL mode)
pub mod versioning;   // Pre-change content snapshots with retention
pub mod activity;     // Append-only activity history with disk spill
pub mod integrity;    // Non-destructive hash verification walk

// ===== NETWORK =====
pub mod discovery;    // UDP beacons, liveness sweep, trust gating
pub mod peer;         // Peer table and trusted-peer records
pub mod protocol;     // Frame codec and wire payload records
pub mod transport;    // TCP sessions, handshake, sealed framing, connection pool

// ===== SYNC ENGINE =====
pub mod sync_engine;  // Planner: local/remote pipelines, conflicts, gating, rescan
pub mod watcher;      // Debounced recursive filesystem watcher
pub mod transfer;     // Chunked bodies, temp assembly, checkpoints, resume
pub mod delta;        // Block signatures and COPY/INSERT instruction streams
pub mod ignore;       // .swarmignore matcher and excluded folders
pub mod conflict;     // Conflict records, resolutions, resolver collaborator
pub mod schedule;     // Sync windows and wake computation
pub mod power;        // Battery gating collaborator

// ===== VAULT =====
pub mod vault;        // Password-locked folders with chunked AEAD bodies

// ===== APPLICATION =====
pub mod cli;          // clap argument surface
pub mod config;       // Configuration value object (TOML)
pub mod error;        // Shared error taxonomy
pub mod events;       // Typed event bus for UI collaborators
pub mod logging;      // tracing subscriber setup
pub mod supervisor;   // Component wiring and lifecycle

pub use config::Config;
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use state_store::{StateStore, SyncedFile};
pub use supervisor::Supervisor;
