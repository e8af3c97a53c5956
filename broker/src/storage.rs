use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StorageError;

/// Ubicación de un archivo en el almacenamiento de resultados.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileStorageKey {
    pub bucket: String,
    pub path: String,
}

impl FileStorageKey {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for FileStorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}

/// Almacenamiento durable de los resultados terminados.
///
/// Las operaciones son bloqueantes; desde código async se llaman dentro
/// de `spawn_blocking`.
pub trait FileStorage: Send + Sync {
    /// Copia el archivo local al almacenamiento bajo `key`.
    fn put(&self, key: &FileStorageKey, local: &Path) -> Result<(), StorageError>;

    fn exists(&self, key: &FileStorageKey) -> bool;

    fn get(&self, key: &FileStorageKey) -> Result<Vec<u8>, StorageError>;
}

/// Almacenamiento sobre el disco local: `{root}/{bucket}/{path}`.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cada parte de la clave es un solo nombre: nada de separadores ni `..`.
    fn resolve(&self, key: &FileStorageKey) -> Result<PathBuf, StorageError> {
        let plain = |part: &str| {
            !part.is_empty() && !part.contains(['/', '\\']) && !part.contains("..")
        };
        if !plain(&key.bucket) || !plain(&key.path) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(&key.bucket).join(&key.path))
    }
}

impl FileStorage for LocalFileStorage {
    fn put(&self, key: &FileStorageKey, local: &Path) -> Result<(), StorageError> {
        let target = self.resolve(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| StorageError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        fs::copy(local, &target).map_err(|source| StorageError::Io {
            path: target.display().to_string(),
            source,
        })?;
        debug!("guardado {} en {}", key, target.display());
        Ok(())
    }

    fn exists(&self, key: &FileStorageKey) -> bool {
        self.resolve(key).is_ok_and(|path| path.is_file())
    }

    fn get(&self, key: &FileStorageKey) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(key)?;
        if !path.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        fs::read(&path).map_err(|source| StorageError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn scratch(name: &str) -> PathBuf {
        let dir = env::temp_dir().join("broker-storage-tests").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn put_y_get_devuelven_el_mismo_contenido() {
        let dir = scratch("put_get");
        let local = dir.join("entrada.bin");
        fs::write(&local, b"resultado").unwrap();

        let storage = LocalFileStorage::new(dir.join("store"));
        let key = FileStorageKey::new("bucket", "job_times.grid");
        assert!(!storage.exists(&key));

        storage.put(&key, &local).unwrap();
        assert!(storage.exists(&key));
        assert_eq!(storage.get(&key).unwrap(), b"resultado");
    }

    #[test]
    fn get_de_una_clave_inexistente_es_not_found() {
        let dir = scratch("not_found");
        let storage = LocalFileStorage::new(&dir);
        let err = storage
            .get(&FileStorageKey::new("bucket", "nada.access"))
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn claves_con_separadores_o_puntos_se_rechazan() {
        let dir = scratch("claves_invalidas");
        fs::write(dir.join("secreto_times.grid"), b"x").unwrap();
        let storage = LocalFileStorage::new(dir.join("store"));

        for path in ["../secreto_times.grid", "a/b.access", "a\\b.access", ".."] {
            let key = FileStorageKey::new("bucket", path);
            assert!(matches!(storage.get(&key), Err(StorageError::InvalidKey(_))), "{}", path);
            assert!(!storage.exists(&key));
        }
        let key = FileStorageKey::new("..", "secreto_times.grid");
        assert!(matches!(storage.get(&key), Err(StorageError::InvalidKey(_))));
    }
}
