//! Persistent state: principal records, derived credentials and index
//! definitions.

pub mod credentials;
pub mod indexes;
pub mod users;

pub use credentials::{load_bootstrap_users, password_digest, CredentialStore, UserCredentials};
pub use indexes::{IndexCatalog, IndexDefinition, IndexKey, InMemoryIndexCatalog};
pub use users::{UserDocument, UserStore, UserUpdate};
