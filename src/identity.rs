use libp2p::identity::{DecodingError, Keypair};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("failed to access key file")]
    Io(#[from] io::Error),
    #[error("corrupt key file")]
    Corrupt(#[from] DecodingError),
}

/// Directory node keys are persisted under when none is configured.
pub fn default_key_dir() -> PathBuf {
    std::env::temp_dir().join("dht-tester")
}

fn key_path(dir: &Path, index: usize) -> PathBuf {
    dir.join(format!("node-{}.key", index))
}

/// Load the keypair persisted for the node at `index`, generating and
/// persisting a fresh one when none exists yet.
///
/// Absence is the normal first-run path and never an error; only unreadable
/// or corrupt persisted data fails.
pub fn load_or_generate(dir: &Path, index: usize) -> Result<Keypair, KeyLoadError> {
    let path = key_path(dir, index);

    match fs::read(&path) {
        Ok(bytes) => Ok(Keypair::from_protobuf_encoding(&bytes)?),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            log::info!("no key found at {}, generating one", path.display());

            let keypair = Keypair::generate_ed25519();
            let bytes = keypair.to_protobuf_encoding()?;

            fs::create_dir_all(dir)?;
            fs::write(&path, bytes)?;

            Ok(keypair)
        }
        Err(error) => Err(error.into()),
    }
}

// ----------------------------------------------------------------------------//

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!(
            "dht-tester-key-test-{}",
            rand::thread_rng().gen::<u64>()
        ))
    }

    #[test]
    fn generates_then_reloads_the_same_key() {
        let dir = scratch_dir();

        let generated = load_or_generate(&dir, 0).unwrap();
        let reloaded = load_or_generate(&dir, 0).unwrap();

        assert_eq!(
            generated.public().to_peer_id(),
            reloaded.public().to_peer_id()
        );

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn distinct_indices_get_distinct_keys() {
        let dir = scratch_dir();

        let a = load_or_generate(&dir, 0).unwrap();
        let b = load_or_generate(&dir, 1).unwrap();

        assert_ne!(a.public().to_peer_id(), b.public().to_peer_id());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn corrupt_key_file_is_an_error() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::write(key_path(&dir, 3), b"not a key").unwrap();

        assert!(matches!(
            load_or_generate(&dir, 3),
            Err(KeyLoadError::Corrupt(_))
        ));

        fs::remove_dir_all(&dir).unwrap();
    }
}
