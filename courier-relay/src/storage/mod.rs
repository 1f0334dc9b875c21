//! Persistent storage for the relay.
//!
//! ```text
//! ┌────────────────┐  enqueue / pending_for  ┌──────────────────────────────────┐
//! │ DeliveryEngine │ ──────────────────────► │ RelayStore (RocksDB)             │
//! └────────────────┘  delete_by_message_id   │ CF "offline"       — queued env. │
//! ┌────────────────┐                         │ CF "offline_index" — by msg id   │
//! │ FcmNotifier    │ ──── push_token ──────► │ CF "push_tokens"   — device tok. │
//! └────────────────┘                         └──────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{OfflineEntry, RelayStore, StoreConfig, StoreError};
