use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use transitflow_utils::error::Error;
use transitflow_utils::TransitFlowResult;

use super::traits::{LandedRecord, LandingHeader, RawLanding, RawRecord, SourceRef};

/// Lands each record as one immutable file:
/// `<root>/<landing_path>/date=YYYY-MM-DD/hour=HH/<timestamp>_<run>_<page>_<uuid>.json`.
///
/// The first line is a JSON header, the rest is the payload exactly as received.
#[derive(Debug, Clone)]
pub struct FileLanding {
    root: PathBuf,
}

impl FileLanding {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(record: &RawRecord) -> String {
        let run: String = record
            .run_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!(
            "{}_{}_{:05}_{}.json",
            record.ingested_at.format("%Y%m%dT%H%M%S%6fZ"),
            run,
            record.page,
            uuid::Uuid::new_v4().simple()
        )
    }
}

#[async_trait]
impl RawLanding for FileLanding {
    async fn append(&self, record: RawRecord) -> TransitFlowResult<SourceRef> {
        let partition = format!(
            "{}/date={}/hour={}",
            record.landing_path.trim_matches('/'),
            record.ingested_at.format("%Y-%m-%d"),
            record.ingested_at.format("%H")
        );
        let relative = format!("{partition}/{}", Self::file_name(&record));
        let dir = self.root.join(&partition);
        fs::create_dir_all(&dir).await?;

        let header = LandingHeader {
            unit: record.unit.clone(),
            key: record.key.clone(),
            page: record.page,
            run_id: record.run_id.clone(),
            ingested_at: record.ingested_at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
        };
        let mut header_line = serde_json::to_vec(&header)?;
        header_line.push(b'\n');

        // Readers never see a half-written file: write aside, then rename into place.
        let target = self.root.join(&relative);
        let staging = target.with_extension("json.tmp");
        let mut file = File::create(&staging).await?;
        file.write_all(&header_line).await?;
        file.write_all(&record.payload).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, &target).await?;

        Ok(SourceRef(relative))
    }

    async fn list(&self, landing_path: &str) -> TransitFlowResult<Vec<SourceRef>> {
        let base = self.root.join(landing_path.trim_matches('/'));
        if !fs::try_exists(&base).await? {
            return Ok(Vec::new());
        }

        let mut refs = Vec::new();
        let mut pending = vec![base];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    if let Ok(relative) = path.strip_prefix(&self.root) {
                        let parts: Vec<String> = relative
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        refs.push(SourceRef(parts.join("/")));
                    }
                }
            }
        }
        // Partition directories and file names both start with the landing time.
        refs.sort();
        Ok(refs)
    }

    async fn read(&self, source_ref: &SourceRef) -> TransitFlowResult<LandedRecord> {
        let bytes = fs::read(self.root.join(source_ref.as_str())).await?;
        let split = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| Error::structural(source_ref.as_str(), "landed file has no header line"))?;
        let header: LandingHeader = serde_json::from_slice(&bytes[..split])
            .map_err(|e| Error::structural(source_ref.as_str(), format!("bad landing header: {e}")))?;
        Ok(LandedRecord { header, payload: bytes[split + 1..].to_vec() })
    }
}
