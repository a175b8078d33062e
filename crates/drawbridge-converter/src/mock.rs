//! Placeholder conversion backend: waits a bit, emits a fixed PDF blob, and
//! stores it under a fresh name. Stands in for a real DWG renderer behind
//! the same storage and RPC contract.

use drawbridge_storage::{FileReader, FileStore};
use rand::Rng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

const PDF_BLOB: &[u8] = b"%PDF-1.4\n% DWG->PDF placeholder\n1 0 obj<<>>endobj\ntrailer<<>>\n%%EOF\n";

pub struct MockConverter {
    files: Arc<dyn FileStore>,
    semaphore: Semaphore,
}

impl MockConverter {
    pub fn new(files: Arc<dyn FileStore>, max_parallel: usize) -> Self {
        MockConverter {
            files,
            semaphore: Semaphore::new(max_parallel.max(1)),
        }
    }

    /// "Convert" the input and return the stored PDF's filename:
    /// `<uuid>_<stem>.pdf`, where the stem comes from the suggested name or,
    /// failing that, from the input path.
    pub async fn convert(&self, input_path: &str, suggested_name: &str) -> anyhow::Result<String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow::anyhow!("converter is shut down"))?;

        let delay = Duration::from_millis(rand::thread_rng().gen_range(500..2000));
        tokio::time::sleep(delay).await;

        let pdf_name = result_name(input_path, suggested_name);
        let reader: FileReader = Box::pin(std::io::Cursor::new(PDF_BLOB));
        self.files
            .save(reader, &pdf_name, Some(PDF_BLOB.len() as u64))
            .await
            .map_err(|e| anyhow::anyhow!("store result: {}", e))?;

        Ok(pdf_name)
    }
}

fn result_name(input_path: &str, suggested_name: &str) -> String {
    let base = if suggested_name.is_empty() {
        input_path
    } else {
        suggested_name
    };
    let stem = Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("output");
    format!("{}_{}.pdf", Uuid::new_v4(), stem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use drawbridge_storage::{SavedFile, StorageError, StorageResult};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct MemFiles {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl FileStore for MemFiles {
        async fn save(
            &self,
            mut reader: FileReader,
            filename: &str,
            _size: Option<u64>,
        ) -> StorageResult<SavedFile> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            let written = data.len() as u64;
            self.files
                .lock()
                .unwrap()
                .insert(filename.to_string(), data);
            Ok(SavedFile {
                written,
                hash: String::new(),
            })
        }

        async fn open(&self, filename: &str) -> StorageResult<(FileReader, u64)> {
            Err(StorageError::NotFound(filename.to_string()))
        }

        async fn delete(&self, _filename: &str) -> StorageResult<()> {
            Ok(())
        }

        async fn cleanup_older_than(&self, _max_age: Duration) -> StorageResult<()> {
            Ok(())
        }
    }

    #[test]
    fn result_name_prefers_the_suggested_stem() {
        let name = result_name("abc123.dwg", "floor plan.dwg");
        assert!(name.ends_with("_floor plan.pdf"));

        let name = result_name("abc123.dwg", "");
        assert!(name.ends_with("_abc123.pdf"));

        let name = result_name("", "");
        assert!(name.ends_with("_output.pdf"));
    }

    #[test]
    fn result_name_strips_directories() {
        let name = result_name("x.dwg", "../../evil/plan.dwg");
        assert!(name.ends_with("_plan.pdf"));
        assert!(!name.contains('/'));
    }

    #[tokio::test]
    async fn convert_stores_a_pdf_and_returns_its_name() {
        let files = Arc::new(MemFiles::default());
        let converter = MockConverter::new(files.clone(), 2);

        let pdf_name = converter.convert("abc.dwg", "drawing.dwg").await.unwrap();
        assert!(pdf_name.ends_with("_drawing.pdf"));

        let stored = files.files.lock().unwrap();
        let data = stored.get(&pdf_name).unwrap();
        assert!(data.starts_with(b"%PDF-1.4"));
    }
}
