//! # shadowsync-id
//!
//! Identifier types shared by every shadowsync crate.
//!
//! Two families of identifiers live here:
//!
//! - **Generated IDs** (`EventId`, `IntegrationId`): prefixed ULIDs in the
//!   form `{prefix}_{ulid}`, e.g. `evt_01HV4Z2WQXKJNM8GPQY6VBKC3D`. They are
//!   time-sortable when freshly generated and strictly parsed.
//! - **External keys** (`TenantId`, `DeviceId`): opaque strings minted by the
//!   fleet-management platform. They are validated (non-empty, bounded,
//!   printable) but otherwise carried verbatim.
//!
//! Keeping tenants and devices as distinct types means a tenant key can never
//! be passed where a device key is expected, which is the first line of tenant
//! isolation in the event store.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
