//! Deterministic mapping from user identity to store location.
//!
//! `path = store_dir/memory_<hex(sha256(salt + identity))>.store`
//!
//! Orchestrator and execution ids carry the first bytes of the same digest
//! (see [`scoped_id`]), which is enough to find the owning store again after
//! a restart without keeping an index of ids.
//!
//! The salt must stay fixed for the lifetime of the stored data. A
//! fingerprint of it is kept next to the stores so that configuration drift
//! is caught at startup instead of silently pointing every user at a fresh,
//! empty store.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::UserIdentity;

const FINGERPRINT_FILE: &str = ".salt_fingerprint";

/// Bytes of the store key embedded at the front of every scoped id
pub const ID_KEY_BYTES: usize = 6;

/// `sha256(salt + identity)`, the key a user's store is named after
pub fn store_key(user: &UserIdentity, salt: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(user.as_str().as_bytes());
    hasher.finalize().into()
}

/// Resolve the store path for `user` under `store_dir`.
pub fn resolve(store_dir: &Path, user: &UserIdentity, salt: &str) -> PathBuf {
    store_dir.join(format!("memory_{}.store", hex::encode(store_key(user, salt))))
}

/// Random v4 id whose leading bytes are the owner's store key prefix.
pub fn scoped_id(key: &[u8; 32]) -> Uuid {
    let mut bytes = *Uuid::new_v4().as_bytes();
    bytes[..ID_KEY_BYTES].copy_from_slice(&key[..ID_KEY_BYTES]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Fingerprint recorded for a salt; never the salt itself.
pub fn salt_fingerprint(salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"vutf-salt:");
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolver bound to one store directory and salt
#[derive(Debug, Clone)]
pub struct UserMemoryResolver {
    store_dir: PathBuf,
    salt: String,
}

impl UserMemoryResolver {
    /// Open the store directory, creating it if needed, and check the salt
    /// against the recorded fingerprint.
    ///
    /// A mismatch is an error unless `allow_rotation` is set, in which case
    /// the rotation is logged and the new fingerprint recorded.
    pub fn open(
        store_dir: impl Into<PathBuf>,
        salt: impl Into<String>,
        allow_rotation: bool,
    ) -> Result<Self> {
        let store_dir = store_dir.into();
        let salt = salt.into();
        std::fs::create_dir_all(&store_dir)?;

        let fingerprint_path = store_dir.join(FINGERPRINT_FILE);
        let fingerprint = salt_fingerprint(&salt);

        match std::fs::read_to_string(&fingerprint_path) {
            Ok(recorded) if recorded.trim() == fingerprint => {}
            Ok(_) if allow_rotation => {
                warn!(
                    store_dir = %store_dir.display(),
                    "Store salt rotated; existing stores are unreachable under their old paths"
                );
                std::fs::write(&fingerprint_path, &fingerprint)?;
            }
            Ok(_) => return Err(Error::SaltMismatch { store_dir }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(store_dir = %store_dir.display(), "Recording store salt fingerprint");
                std::fs::write(&fingerprint_path, &fingerprint)?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { store_dir, salt })
    }

    /// Store path for `user`
    pub fn resolve(&self, user: &UserIdentity) -> PathBuf {
        resolve(&self.store_dir, user, &self.salt)
    }

    /// New id for an orchestrator or execution owned by `user`
    pub fn new_id(&self, user: &UserIdentity) -> Uuid {
        scoped_id(&store_key(user, &self.salt))
    }

    /// Existing stores whose key matches the prefix carried by `id`.
    ///
    /// Usually one path; a prefix collision yields several and the caller
    /// checks each.
    pub fn locate(&self, id: Uuid) -> Result<Vec<PathBuf>> {
        let prefix = format!("memory_{}", hex::encode(&id.as_bytes()[..ID_KEY_BYTES]));
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.store_dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".store"));
            if matches {
                found.push(path);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn user(s: &str) -> UserIdentity {
        UserIdentity::parse(s).unwrap()
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let dir = Path::new("/stores");
        let a = resolve(dir, &user("alice"), "s");
        assert_eq!(a, resolve(dir, &user("ALICE "), "s"));
        assert_ne!(a, resolve(dir, &user("bob"), "s"));
        assert_ne!(a, resolve(dir, &user("alice"), "t"));

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("memory_"));
        assert!(name.ends_with(".store"));
        assert_eq!(name.len(), "memory_".len() + 64 + ".store".len());
    }

    #[test]
    fn test_resolve_known_value() {
        // sha256("salice")
        let mut hasher = Sha256::new();
        hasher.update(b"salice");
        let expected = format!("memory_{}.store", hex::encode(hasher.finalize()));
        assert_eq!(
            resolve(Path::new("d"), &user("alice"), "s"),
            Path::new("d").join(expected)
        );
    }

    #[test]
    fn test_distinct_users_distinct_paths() {
        let dir = Path::new("/stores");
        let paths: std::collections::HashSet<_> = (0..500)
            .map(|i| resolve(dir, &user(&format!("user-{i}")), "salt"))
            .collect();
        assert_eq!(paths.len(), 500);
    }

    #[test]
    fn test_scoped_ids_locate_their_store() {
        let tmp = TempDir::new().unwrap();
        let resolver = UserMemoryResolver::open(tmp.path(), "salt", false).unwrap();
        let alice = user("alice");
        let bob = user("bob");
        std::fs::write(resolver.resolve(&alice), b"").unwrap();
        std::fs::write(resolver.resolve(&bob), b"").unwrap();

        let first = resolver.new_id(&alice);
        let second = resolver.new_id(&alice);
        assert_ne!(first, second);
        assert_eq!(first.get_version_num(), 4);
        assert_eq!(first.as_bytes()[..ID_KEY_BYTES], second.as_bytes()[..ID_KEY_BYTES]);

        assert_eq!(resolver.locate(first).unwrap(), vec![resolver.resolve(&alice)]);
        assert_eq!(
            resolver.locate(resolver.new_id(&bob)).unwrap(),
            vec![resolver.resolve(&bob)]
        );
        assert!(resolver.locate(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn test_salt_fingerprint_guard() {
        let tmp = TempDir::new().unwrap();
        UserMemoryResolver::open(tmp.path(), "first", false).unwrap();
        UserMemoryResolver::open(tmp.path(), "first", false).unwrap();

        let err = UserMemoryResolver::open(tmp.path(), "second", false).unwrap_err();
        assert!(matches!(err, Error::SaltMismatch { .. }));

        UserMemoryResolver::open(tmp.path(), "second", true).unwrap();
        UserMemoryResolver::open(tmp.path(), "second", false).unwrap();
    }
}
