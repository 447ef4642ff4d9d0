// Types, constants and crypto shared by the snodekit crates.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod namespaces;
pub mod types;

pub use error::{CryptoError, IdentityError, SnodekitError};
pub use identity::{Identity, SignedRequest};
pub use namespaces::{Namespace, NamespaceRole};
pub use types::{short_key, IdentityKind, Snode};
