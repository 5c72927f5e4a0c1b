//! Shared fixtures for the integration suites.

use std::collections::BTreeMap;
use std::sync::Mutex;
use storfab::{ErrorKind, HelperError, ObjectBackend, ObjectEntry};

/// In-memory flat-key store recording backend traffic, standing in for
/// a remote object service.
#[derive(Default)]
pub struct RecordingObjectStore {
    pub objects: Mutex<BTreeMap<String, Vec<u8>>>,
    /// (key, size) per whole-object put, in arrival order.
    pub puts: Mutex<Vec<(String, usize)>>,
    /// Batch sizes per bulk delete.
    pub delete_batches: Mutex<Vec<usize>>,
}

impl ObjectBackend for RecordingObjectStore {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    fn get_object(&self, key: &str, offset: u64, size: usize) -> Result<Vec<u8>, HelperError> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(key)
            .ok_or_else(|| HelperError::new(ErrorKind::NotFound, format!("get {key}")))?;
        let start = (offset as usize).min(data.len());
        let end = (start + size).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn put_object(&self, key: &str, data: &[u8]) -> Result<usize, HelperError> {
        self.puts.lock().unwrap().push((key.to_string(), data.len()));
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(data.len())
    }

    fn delete_objects(&self, keys: &[String]) -> Result<(), HelperError> {
        self.delete_batches.lock().unwrap().push(keys.len());
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>, HelperError> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectEntry {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn head_object(&self, key: &str) -> Result<ObjectEntry, HelperError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|data| ObjectEntry {
                key: key.to_string(),
                size: data.len() as u64,
            })
            .ok_or_else(|| HelperError::new(ErrorKind::NotFound, format!("head {key}")))
    }
}
