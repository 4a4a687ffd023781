//! Packed dataset bundles
//!
//! A bundle is a single random-access file holding every training sample of
//! a dataset:
//!
//! ```text
//! | "DSBUNDLE" | version: u32 LE | header_len: u64 LE | header (JSON) | payload |
//! ```
//!
//! Entry offsets are relative to the start of the payload. Bundles are
//! written to a temporary file and renamed into place, so the canonical path
//! either holds a complete bundle or nothing.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use launch_core::{DataPrepError, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{BuildRequest, BuiltCache, DatasetBuilder};

pub const BUNDLE_MAGIC: &[u8; 8] = b"DSBUNDLE";
pub const BUNDLE_VERSION: u32 = 1;

/// Index of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleHeader {
    pub name: String,
    pub img_size: u32,
    pub crop_long_edge: bool,
    pub resize_size: Option<u32>,
    pub num_classes: u32,
    pub entries: Vec<BundleEntry>,
}

/// One sample inside a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleEntry {
    /// Path relative to the source split directory
    pub path: String,

    /// Class index, from the sorted first-level directories
    pub label: Option<u32>,
    pub offset: u64,
    pub len: u64,
}

struct SourceSample {
    absolute: PathBuf,
    relative: String,
    label: Option<u32>,
    len: u64,
}

/// Builds packed bundles from `<data_dir>/<name>/train/`
#[derive(Debug, Clone, Default)]
pub struct PackedBundleBuilder;

impl PackedBundleBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Path a bundle with these parameters lives at
    pub fn canonical_path(
        output_dir: &Path,
        name: &str,
        img_size: u32,
        crop_long_edge: bool,
        resize_size: Option<u32>,
    ) -> PathBuf {
        let crop = if crop_long_edge { "crop" } else { "nocrop" };
        let resize = match resize_size {
            Some(size) => format!("resize{size}"),
            None => "noresize".to_string(),
        };
        output_dir.join(format!("{name}_{img_size}_{crop}_{resize}_train.bundle"))
    }

    /// Read and validate the header of the bundle at `path`
    pub async fn read_header(path: &Path) -> Result<BundleHeader> {
        let invalid = |reason: String| DataPrepError::InvalidArtifact {
            path: path.to_path_buf(),
            reason,
        };

        let mut file = fs::File::open(path)
            .await
            .map_err(|e| DataPrepError::io(path, e))?;
        let file_len = file
            .metadata()
            .await
            .map_err(|e| DataPrepError::io(path, e))?
            .len();

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .await
            .map_err(|e| invalid(format!("truncated preamble: {e}")))?;
        if &magic != BUNDLE_MAGIC {
            return Err(invalid("bad magic".to_string()).into());
        }

        let version = file
            .read_u32_le()
            .await
            .map_err(|e| invalid(format!("truncated preamble: {e}")))?;
        if version != BUNDLE_VERSION {
            return Err(invalid(format!("unsupported version {version}")).into());
        }

        let header_len = file
            .read_u64_le()
            .await
            .map_err(|e| invalid(format!("truncated preamble: {e}")))?;
        let payload_start = preamble_len()
            .checked_add(header_len)
            .filter(|&end| end <= file_len)
            .ok_or_else(|| invalid(format!("header length {header_len} exceeds file")))?;

        let mut raw = vec![0u8; header_len as usize];
        file.read_exact(&mut raw)
            .await
            .map_err(|e| invalid(format!("truncated header: {e}")))?;
        let header: BundleHeader =
            serde_json::from_slice(&raw).map_err(|e| invalid(format!("corrupt header: {e}")))?;

        let payload_len = file_len - payload_start;
        if let Some(entry) = header
            .entries
            .iter()
            .find(|e| e.offset.checked_add(e.len).map_or(true, |end| end > payload_len))
        {
            return Err(invalid(format!("entry {} extends past end of file", entry.path)).into());
        }

        Ok(header)
    }

    /// Read one sample's bytes from a bundle
    pub async fn read_entry(path: &Path, entry: &BundleEntry) -> Result<Vec<u8>> {
        use std::io::SeekFrom;
        use tokio::io::AsyncSeekExt;

        let io = |e| DataPrepError::io(path, e);
        let mut file = fs::File::open(path).await.map_err(io)?;

        file.seek(SeekFrom::Start(BUNDLE_MAGIC.len() as u64 + 4))
            .await
            .map_err(io)?;
        let header_len = file.read_u64_le().await.map_err(io)?;

        file.seek(SeekFrom::Start(preamble_len() + header_len + entry.offset))
            .await
            .map_err(io)?;
        let mut buf = vec![0u8; entry.len as usize];
        file.read_exact(&mut buf).await.map_err(io)?;
        Ok(buf)
    }

    /// Generate a unique temporary path next to `path`
    fn temp_path(path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        path.with_file_name(temp_name)
    }

    async fn collect_samples(source: &Path) -> std::result::Result<Vec<SourceSample>, DataPrepError> {
        let mut class_dirs = Vec::new();
        let mut samples = Vec::new();

        let mut entries = fs::read_dir(source)
            .await
            .map_err(|e| DataPrepError::io(source, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DataPrepError::io(source, e))?
        {
            // Follows symlinks so linked samples and class dirs are packed
            let meta = fs::metadata(entry.path())
                .await
                .map_err(|e| DataPrepError::io(entry.path(), e))?;
            if meta.is_dir() {
                class_dirs.push(entry.path());
            } else if meta.is_file() {
                samples.push(SourceSample {
                    relative: entry.file_name().to_string_lossy().into_owned(),
                    absolute: entry.path(),
                    label: None,
                    len: meta.len(),
                });
            }
        }
        class_dirs.sort();

        for (label, class_dir) in class_dirs.iter().enumerate() {
            // Walk each class directory recursively
            let mut stack = vec![class_dir.clone()];
            while let Some(dir) = stack.pop() {
                let mut entries = fs::read_dir(&dir)
                    .await
                    .map_err(|e| DataPrepError::io(&dir, e))?;
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| DataPrepError::io(&dir, e))?
                {
                    let entry_path = entry.path();
                    let meta = fs::metadata(&entry_path)
                        .await
                        .map_err(|e| DataPrepError::io(&entry_path, e))?;
                    if meta.is_dir() {
                        stack.push(entry_path);
                    } else if meta.is_file() {
                        let relative = entry_path
                            .strip_prefix(source)
                            .unwrap_or(&entry_path)
                            .to_string_lossy()
                            .into_owned();
                        samples.push(SourceSample {
                            absolute: entry_path,
                            relative,
                            label: Some(label as u32),
                            len: meta.len(),
                        });
                    }
                }
            }
        }

        samples.sort_by(|a, b| a.relative.cmp(&b.relative));
        Ok(samples)
    }

    async fn write_bundle(
        temp: &Path,
        header: &BundleHeader,
        samples: &[SourceSample],
    ) -> std::result::Result<u64, DataPrepError> {
        let raw_header =
            serde_json::to_vec(header).map_err(|e| DataPrepError::Build {
                message: format!("failed to encode bundle header: {e}"),
            })?;

        let file = fs::File::create(temp)
            .await
            .map_err(|e| DataPrepError::io(temp, e))?;
        let mut writer = BufWriter::new(file);
        let io = |e| DataPrepError::io(temp, e);

        writer.write_all(BUNDLE_MAGIC).await.map_err(io)?;
        writer.write_u32_le(BUNDLE_VERSION).await.map_err(io)?;
        writer
            .write_u64_le(raw_header.len() as u64)
            .await
            .map_err(io)?;
        writer.write_all(&raw_header).await.map_err(io)?;

        let mut written = 0u64;
        for sample in samples {
            let data = fs::read(&sample.absolute)
                .await
                .map_err(|e| DataPrepError::io(&sample.absolute, e))?;
            if data.len() as u64 != sample.len {
                return Err(DataPrepError::Build {
                    message: format!("{} changed while building", sample.absolute.display()),
                });
            }
            writer.write_all(&data).await.map_err(io)?;
            written += sample.len;
        }

        writer.flush().await.map_err(io)?;
        writer.get_ref().sync_all().await.map_err(io)?;
        Ok(written)
    }
}

fn preamble_len() -> u64 {
    BUNDLE_MAGIC.len() as u64 + 4 + 8
}

#[async_trait]
impl DatasetBuilder for PackedBundleBuilder {
    #[instrument(skip(self, request), fields(dataset = request.name, img_size = request.img_size))]
    async fn build_cache(&self, request: &BuildRequest<'_>) -> Result<BuiltCache> {
        // Pre-cropped sources are stored as they are
        let (crop_long_edge, resize_size) = if request.data.source_preprocessed {
            (false, None)
        } else {
            (request.crop_long_edge, request.resize_size)
        };

        let path = Self::canonical_path(
            request.output_dir,
            request.name,
            request.img_size,
            crop_long_edge,
            resize_size,
        );

        if fs::metadata(&path).await.is_ok() {
            match Self::read_header(&path).await {
                Ok(header) => {
                    info!(path = %path.display(), samples = header.entries.len(), "Reusing dataset bundle");
                    return Ok(BuiltCache {
                        path,
                        crop_long_edge: header.crop_long_edge,
                        resize_size: header.resize_size,
                        reused: true,
                    });
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Rebuilding invalid dataset bundle"),
            }
        }

        let data_dir = request.data_dir.ok_or_else(|| DataPrepError::Build {
            message: "RUN.data_dir is required to build a dataset bundle".to_string(),
        })?;
        let source = data_dir.join(request.name).join("train");
        if !fs::metadata(&source).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(DataPrepError::SourceMissing {
                name: request.name.to_string(),
                path: source,
            }
            .into());
        }

        let samples = Self::collect_samples(&source).await?;
        if samples.is_empty() {
            return Err(DataPrepError::SourceMissing {
                name: request.name.to_string(),
                path: source,
            }
            .into());
        }

        let mut offset = 0u64;
        let entries = samples
            .iter()
            .map(|s| {
                let entry = BundleEntry {
                    path: s.relative.clone(),
                    label: s.label,
                    offset,
                    len: s.len,
                };
                offset += s.len;
                entry
            })
            .collect();
        let num_classes = samples
            .iter()
            .filter_map(|s| s.label)
            .max()
            .map(|l| l + 1)
            .unwrap_or(0);
        let header = BundleHeader {
            name: request.name.to_string(),
            img_size: request.img_size,
            crop_long_edge,
            resize_size,
            num_classes,
            entries,
        };

        fs::create_dir_all(request.output_dir)
            .await
            .map_err(|e| DataPrepError::io(request.output_dir, e))?;

        let temp = Self::temp_path(&path);
        debug!(temp = %temp.display(), samples = samples.len(), "Writing dataset bundle");

        let written = match Self::write_bundle(&temp, &header, &samples).await {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                return Err(e.into());
            }
        };

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(DataPrepError::io(&path, e).into());
        }

        info!(
            path = %path.display(),
            samples = header.entries.len(),
            classes = num_classes,
            bytes = written,
            "Dataset bundle built"
        );

        Ok(BuiltCache {
            path,
            crop_long_edge,
            resize_size,
            reused: false,
        })
    }
}
