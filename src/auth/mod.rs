//! Authentication, partition resolution and wildcard permissions.

pub mod identity;
pub mod partition;
pub mod permission;

pub use identity::{Account, AuthError, IdentityBackend, StaticIdentity};
pub use partition::{PartitionResolver, Resolved};
pub use permission::{implies, Permission, PermissionError, PermissionSet, Principal};
